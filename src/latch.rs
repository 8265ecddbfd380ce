//! One-shot latch: set once, awaited by any number of tasks.

use tokio::sync::watch;

/// A latch that starts closed and can be opened exactly once.
///
/// Waiters that arrive after the latch opened return immediately.
#[derive(Clone)]
pub struct Latch {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Opens the latch. Returns true only for the call that actually opened it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the latch is opened.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
