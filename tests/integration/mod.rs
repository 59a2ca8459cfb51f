//! Integration tests that drive whole bootstrap and scaling flows through the
//! public API. Remote hosts are simulated by `ScriptedExecutor`, so no SSH
//! access is needed:
//!
//! ```bash
//! cargo test --features test-harness
//! ```

pub mod bootstrap_flow;
pub mod scaling_flow;

use tokio::time::Instant;

pub async fn poll_until<T, F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}
