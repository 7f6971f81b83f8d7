//! Run-exactly-once-at-a-time gate.
//!
//! The first caller to arrive runs the protected work. Callers arriving while
//! it runs wait for it to finish and return without running anything
//! themselves. The next caller after completion runs again.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Gate allowing at most one concurrent execution of a piece of work.
#[derive(Debug, Default)]
pub struct AwaitGate {
    /// Present while a run is in flight. Waiters clone it and wait for the
    /// runner's sender to drop.
    inflight: Mutex<Option<watch::Receiver<()>>>,
}

enum Role {
    Runner(watch::Sender<()>),
    Waiter(watch::Receiver<()>),
}

/// Clears the in-flight slot and releases waiters, even if the runner's
/// future is dropped part way through.
struct RunGuard<'a> {
    gate: &'a AwaitGate,
    _done: watch::Sender<()>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.gate.inflight.lock().take();
        // `_done` drops after this, which wakes every waiter.
    }
}

impl AwaitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless a run is already in flight, in which case wait for
    /// that run to finish instead.
    ///
    /// Returns `true` if this call ran `work`.
    pub async fn run<F, Fut>(&self, work: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let role = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(());
                    *slot = Some(rx);
                    Role::Runner(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                // Only ever resolves by the sender closing.
                let _ = rx.changed().await;
                false
            }
            Role::Runner(tx) => {
                let _guard = RunGuard {
                    gate: self,
                    _done: tx,
                };
                work().await;
                true
            }
        }
    }

    /// True while a run is in flight.
    pub fn is_running(&self) -> bool {
        self.inflight.lock().is_some()
    }
}
