//! Monotonic notification primitives.
//!
//! `NotifiedVersion` is the ordering-barrier building block of the commit
//! pipeline: tasks advance it, other tasks suspend until it reaches a
//! threshold. Built on a `tokio::sync::watch` channel whose sender is owned
//! by the primitive itself, so waiters never observe a closed channel.

use tokio::sync::watch;

use crate::types::Version;

/// A version that only moves forward, with `when_at_least` waiters.
#[derive(Debug)]
pub struct NotifiedVersion {
    tx: watch::Sender<Version>,
}

impl NotifiedVersion {
    pub fn new(initial: Version) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> Version {
        *self.tx.borrow()
    }

    /// Advance to `version`. Lower values are ignored to keep monotonicity.
    pub fn set(&self, version: Version) {
        self.tx.send_if_modified(|current| {
            if version > *current {
                *current = version;
                true
            } else {
                false
            }
        });
    }

    /// Suspend until the value reaches `version`.
    pub async fn when_at_least(&self, version: Version) {
        if self.get() >= version {
            return;
        }
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail while we hold it.
        let _ = rx.wait_for(|v| *v >= version).await;
    }
}

/// A wall-clock instant (seconds) that only moves forward.
#[derive(Debug)]
pub struct NotifiedTime {
    tx: watch::Sender<f64>,
}

impl NotifiedTime {
    pub fn new(initial: f64) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> f64 {
        *self.tx.borrow()
    }

    /// Advance to `time` if it is later than the current value.
    pub fn set_max(&self, time: f64) {
        self.tx.send_if_modified(|current| {
            if time > *current {
                *current = time;
                true
            } else {
                false
            }
        });
    }

    /// Suspend until the value reaches `time`.
    pub async fn when_at_least(&self, time: f64) {
        if self.get() >= time {
            return;
        }
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|t| *t >= time).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn when_at_least_wakes_in_order() {
        let nv = Arc::new(NotifiedVersion::new(0));
        let waiter = {
            let nv = nv.clone();
            tokio::spawn(async move {
                nv.when_at_least(5).await;
                nv.get()
            })
        };
        nv.set(3);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        nv.set(7);
        assert!(waiter.await.unwrap() >= 5);
    }

    #[tokio::test]
    async fn set_never_goes_backward() {
        let nv = NotifiedVersion::new(10);
        nv.set(4);
        assert_eq!(nv.get(), 10);
        nv.set(11);
        assert_eq!(nv.get(), 11);
    }
}
