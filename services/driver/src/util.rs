//! Small shared helpers for cancellable waits and bounded joins.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// How long `close()` waits for a worker before detaching it.
pub(crate) const JOIN_BOUND: Duration = Duration::from_secs(1);

/// Sleep for `delay` unless shutdown fires first. Returns true when the
/// sleep was cut short by shutdown (or the shutdown channel went away).
pub(crate) async fn sleep_cancellable(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        () = tokio::time::sleep(delay) => false,
    }
}

/// Await a worker for at most [`JOIN_BOUND`]; log and detach if it hangs.
pub(crate) async fn join_bounded(name: &str, task: JoinHandle<()>) {
    if tokio::time::timeout(JOIN_BOUND, task).await.is_err() {
        warn!(worker = name, "worker did not stop within the join bound; detaching");
    }
}
