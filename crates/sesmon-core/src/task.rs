//! Panic containment for spawned tasks.

use std::future::Future;

use tokio::task::{JoinError, JoinHandle};
use tracing::error;

/// Extracts a printable message from a panicked task's join error.
pub fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawns a task and a watcher that logs its panic instead of dropping it.
///
/// The task is fully isolated: a panic terminates it, is logged with the
/// given description, and leaves every sibling task running.
pub fn spawn_logged<F>(desc: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(err) = inner.await {
            if err.is_panic() {
                error!("({desc}) panic recovered: {}", panic_message(err));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn spawn_logged_contains_panics() {
        let watcher = spawn_logged("test-panicker", async {
            panic!("deliberate test panic");
        });

        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should finish")
            .expect("watcher itself must not panic");
    }

    #[tokio::test]
    async fn spawn_logged_runs_future_to_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_logged("test-sender", async move {
            let _ = tx.send(42);
        });

        let got = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("value should arrive")
            .expect("sender should not be dropped");
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn panic_message_extracts_str_payloads() {
        let handle = tokio::spawn(async {
            panic!("str payload");
        });
        let err = handle.await.expect_err("task must panic");
        assert!(err.is_panic());
        assert_eq!(panic_message(err), "str payload");
    }

    #[tokio::test]
    async fn panic_message_extracts_string_payloads() {
        let handle = tokio::spawn(async {
            std::panic::panic_any(format!("formatted {}", 7));
        });
        let err = handle.await.expect_err("task must panic");
        assert_eq!(panic_message(err), "formatted 7");
    }
}
