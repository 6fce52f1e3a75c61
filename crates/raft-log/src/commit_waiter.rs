//! Lets readers block until a given index has committed, without polling.
//!
//! Broadcasts the commit index to every waiter over a `tokio::sync::watch`
//! channel, combined with cooperative cancellation and an optional
//! deadline.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{LogError, Result};

/// Creates a commit-index channel, seeded at `initial`.
pub fn channel(initial: u64) -> (watch::Sender<u64>, watch::Receiver<u64>) {
    watch::channel(initial)
}

/// Blocks until `rx` observes a value `>= index`, or until `cancel` fires,
/// or (if given) `timeout` elapses. Both cancellation and timeout surface
/// as [`LogError::Cancelled`] - from the caller's perspective a wait that
/// didn't observe the commit is the same outcome either way.
pub async fn wait_for_commit(
    rx: &mut watch::Receiver<u64>,
    index: u64,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    if *rx.borrow() >= index {
        return Ok(());
    }
    let wait = rx.wait_for(|committed| *committed >= index);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LogError::Cancelled),
        result = wait => {
            result.map(|_| ()).map_err(|_| LogError::Cancelled)
        }
        _ = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        } => Err(LogError::Cancelled),
    }
}
