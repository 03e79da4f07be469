//! One-shot broadcast signals for shutdown, stop and done propagation.

use std::sync::Arc;

use tokio::sync::watch;

/// Creates a connected [`Trigger`]/[`Signal`] pair.
pub fn channel() -> (Trigger, Signal) {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    (Trigger { tx }, Signal { rx })
}

/// The raising side of a one-shot signal.
///
/// Raising is idempotent: any number of callers may trigger, the signal
/// flips exactly once.
#[derive(Clone, Debug)]
pub struct Trigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Trigger {
    /// Raises the signal. Returns true only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Returns a new [`Signal`] observing this trigger.
    pub fn subscribe(&self) -> Signal {
        Signal {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side of a one-shot signal.
#[derive(Clone, Debug)]
pub struct Signal {
    rx: watch::Receiver<bool>,
}

impl Signal {
    /// Whether the signal has been raised.
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the signal is raised.
    ///
    /// If every [`Trigger`] is gone without ever raising, the signal can no
    /// longer fire and this waits forever (callers select against timers or
    /// other signals).
    pub async fn raised(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
