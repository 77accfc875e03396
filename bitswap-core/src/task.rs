use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Spawns `fut` racing `token`. If `token` fires first the task ends
/// silently (cancellation is expected and not an error); otherwise an
/// `Err` returned by `fut` is logged. Every background loop in this crate
/// (connection accept, inbound/outbound per peer, liveness sweep,
/// decision) is started through this so cancellation and failure are
/// never confused with each other.
pub fn spawn_tracked<F>(name: &'static str, token: CancellationToken, fut: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                trace!(task = name, "cancelled");
            }
            result = fut => {
                if let Err(err) = result {
                    error!(task = name, error = %err, "task exited with error");
                }
            }
        }
    })
}
