//! Midpoint-rule integration of `1 / ln(x)`.

use tether_net::ReactorHandle;
use tracing::warn;

/// The integrand. Zero where `1 / ln(x)` is undefined or unbounded.
pub fn integrand(x: f64) -> f64 {
    let ln = x.ln();
    if x <= 1.0 || ln.abs() < 1e-10 {
        return 0.0;
    }
    1.0 / ln
}

/// Midpoint rectangle rule over `[lower, upper]`; the last rectangle is
/// clipped to `upper`.
pub fn midpoint(lower: f64, upper: f64, step: f64) -> f64 {
    if upper <= lower || step <= 0.0 || !step.is_finite() {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut x = lower;
    while x < upper {
        let next = (x + step).min(upper);
        if next <= x {
            // step below float resolution at this magnitude
            break;
        }
        sum += integrand((x + next) / 2.0) * (next - x);
        x = next;
    }
    sum
}

/// Split `[lower, upper]` into `parts` contiguous pieces; the last ends
/// exactly at `upper`.
#[allow(clippy::cast_precision_loss)]
pub fn split(lower: f64, upper: f64, parts: usize) -> Vec<(f64, f64)> {
    if parts == 0 || upper <= lower {
        return Vec::new();
    }
    let width = (upper - lower) / parts as f64;
    // Each piece starts where the previous one ended.
    let mut start = lower;
    (1..=parts)
        .map(|i| {
            let end = if i == parts { upper } else { lower + width * i as f64 };
            let piece = (start, end);
            start = end;
            piece
        })
        .collect()
}

/// Integrate using `cores` blocking threads on `reactor`.
pub async fn integrate_parallel(
    reactor: &ReactorHandle,
    lower: f64,
    upper: f64,
    step: f64,
    cores: usize,
) -> f64 {
    let parts = split(lower, upper, cores.max(1));
    let handles: Vec<_> = parts
        .into_iter()
        .map(|(a, b)| reactor.spawn_blocking(move || midpoint(a, b, step)))
        .collect();
    let mut total = 0.0;
    for handle in handles {
        match handle.await {
            Ok(part) => total += part,
            Err(err) => warn!(error = %err, "integration thread failed"),
        }
    }
    total
}
