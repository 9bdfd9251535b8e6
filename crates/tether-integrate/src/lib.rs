//! # tether-integrate
//!
//! Distributed integration of `1 / ln(x)` on top of the tether engine.
//!
//! - [`Coordinator`]: runs on a [`Server`](tether_net::Server), registers
//!   workers and splits a job across them by core count
//! - [`Worker`]: a [`Client`](tether_net::Client) that announces its cores and
//!   answers integration tasks with the midpoint rule

#![deny(unsafe_code)]

pub mod coordinator;
pub mod integrate;
pub mod protocol;
pub mod worker;

pub use coordinator::{Coordinator, IntegrationReport, TaskFailure, WorkerInfo};
pub use worker::{Worker, WorkerError};
