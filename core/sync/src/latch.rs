//! Single-resolution flags ("loaded from local", "loaded from remote").

use tokio::sync::watch;

use treesync_common::{Error, Result};

/// Setting side of a [`Latch`]. Setting is idempotent.
#[derive(Debug)]
pub struct LatchSetter {
    tx: watch::Sender<bool>,
}

impl LatchSetter {
    /// Set the flag. Returns whether this call set it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|set| !std::mem::replace(set, true))
    }
}

/// Awaitable flag that transitions to set exactly once.
#[derive(Debug, Clone)]
pub struct Latch {
    rx: watch::Receiver<bool>,
}

impl Latch {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the flag is set.
    ///
    /// # Errors
    /// - `EngineStopped` if the engine went away before setting it
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        rx.wait_for(|set| *set)
            .await
            .map(|_| ())
            .map_err(|_| Error::EngineStopped("Engine stopped before the flag was set".to_string()))
    }
}

pub fn latch() -> (LatchSetter, Latch) {
    let (tx, rx) = watch::channel(false);
    (LatchSetter { tx }, Latch { rx })
}
