use std::sync::Arc;

use tokio::sync::watch;

/// One-shot broadcast signal: closed until [`open`](Self::open), then open
/// forever. Clones share the same signal.
#[derive(Clone)]
pub struct StartupGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate. Calling it again is a no-op.
    pub fn open(&self) {
        self.tx.send_if_modified(|open| !std::mem::replace(open, true));
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this only returns once open
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_release_on_open() {
        let gate = StartupGate::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let g = gate.clone();
                tokio::spawn(async move { g.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        assert!(!gate.is_open());
        gate.open();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn open_is_idempotent_and_sticky() {
        let gate = StartupGate::new();
        gate.open();
        gate.open();
        assert!(gate.is_open());
        tokio::time::timeout(Duration::from_millis(100), gate.wait())
            .await
            .expect("already open gate must not block");
    }
}
