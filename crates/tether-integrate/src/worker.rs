//! The computing side: connects, announces its cores and serves tasks.

use std::time::Duration;

use bytes::Bytes;
use tether_core::{ConnectionId, RegistryError, RequestError, RetryPolicy};
use tether_net::{Client, ClientError, ClientState, HandlerError, ReactorHandle, handler_fn};
use tether_settings::TetherSettings;
use thiserror::Error;
use tracing::{info, warn};

use crate::integrate::integrate_parallel;
use crate::protocol::{
    self, HELLO, Hello, INTEGRATE, IntegrationResult, IntegrationTask, PayloadError, Welcome,
};

/// Worker failure.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Connecting failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The handshake call failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] RequestError),
    /// The coordinator sent an unreadable reply.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// The task handler could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A connected (or connectable) worker.
#[derive(Debug)]
pub struct Worker {
    client: Client,
    cores: usize,
    handshake_timeout: Duration,
}

impl Worker {
    /// Create a worker that computes with `cores` threads.
    pub fn new(
        reactor: ReactorHandle,
        settings: &TetherSettings,
        cores: usize,
    ) -> Result<Self, WorkerError> {
        let cores = cores.max(1);
        let client = Client::new(reactor.clone(), settings);
        client.handlers().register(
            INTEGRATE,
            handler_fn(move |body: Bytes, from: ConnectionId| {
                let reactor = reactor.clone();
                async move {
                    let task: IntegrationTask = protocol::decode("task", &body)
                        .map_err(|err| HandlerError::failed(err.to_string()))?;
                    info!(
                        task_id = task.task_id,
                        lower = task.lower,
                        upper = task.upper,
                        step = task.step,
                        coordinator = %from,
                        "task received"
                    );
                    let value =
                        integrate_parallel(&reactor, task.lower, task.upper, task.step, cores)
                            .await;
                    info!(task_id = task.task_id, value, "task computed");
                    protocol::encode(
                        "result",
                        &IntegrationResult {
                            task_id: task.task_id,
                            value,
                        },
                    )
                    .map_err(|err| HandlerError::failed(err.to_string()))
                }
            }),
        )?;
        Ok(Self {
            client,
            cores,
            handshake_timeout: settings.client.default_call_timeout(),
        })
    }

    /// Cores this worker announces.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connect and register with the coordinator.
    pub async fn connect(&self, address: &str, policy: &RetryPolicy) -> Result<Welcome, WorkerError> {
        let _ = self.client.connect(address, policy).await?;
        self.hello().await
    }

    async fn hello(&self) -> Result<Welcome, WorkerError> {
        let body = protocol::encode("hello", &Hello { cores: self.cores })?;
        let reply = self
            .client
            .call(HELLO, body, self.handshake_timeout)
            .await?;
        let welcome: Welcome = protocol::decode("welcome", &reply)?;
        info!(session_id = welcome.session_id, cores = welcome.cores, "registered with coordinator");
        Ok(welcome)
    }

    /// Serve tasks until the connection is gone for good, registering again
    /// after every reconnect.
    pub async fn run(&self) {
        let mut states = self.client.watch_state();
        let mut greeted = self.client.connection_id();
        loop {
            let state = *states.borrow_and_update();
            match state {
                ClientState::Disconnected | ClientState::Closed => {
                    info!(%state, "worker stopping");
                    return;
                }
                ClientState::Connected => {
                    let current = self.client.connection_id();
                    if current.is_some() && current != greeted {
                        greeted = current;
                        if let Err(err) = self.hello().await {
                            warn!(error = %err, "re-registration failed");
                        }
                    }
                }
                ClientState::Connecting | ClientState::Reconnecting => {}
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the connection for good.
    pub async fn close(&self) -> bool {
        self.client.close().await
    }
}
