//! Shutdown signalling and staged shutdown participation

use async_trait::async_trait;
use tokio::sync::watch;

/// Owner side of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable observer of a [`ShutdownTrigger`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx })
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires (or its owner is dropped).
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Ordering of shutdown stages; messaging goes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Early,
    Middle,
    Scheduling,
    Messaging,
}

/// Component that takes part in the host's staged shutdown.
///
/// The host calls `begin_shutdown`, polls `can_finish_shutdown` until it
/// reports true (or a deadline passes) and then awaits `finish_shutdown`.
#[async_trait]
pub trait ShutdownParticipant: Send + Sync {
    fn phase(&self) -> ShutdownPhase;

    fn begin_shutdown(&self);

    fn can_finish_shutdown(&self) -> bool;

    async fn finish_shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_observes_trigger() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        let mut late = trigger.subscribe();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move { signal.wait().await });
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        late.wait().await;
        assert!(late.is_triggered());
        assert!(trigger.is_triggered());
    }

    #[test]
    fn messaging_phase_is_last() {
        assert!(ShutdownPhase::Messaging > ShutdownPhase::Scheduling);
        assert!(ShutdownPhase::Early < ShutdownPhase::Middle);
    }
}
