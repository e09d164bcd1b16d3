// Start-up state machine with state-change subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;
use crate::custodian::LivenessProbe;
use crate::error::{BlobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Initializing,
    WaitingSource,
    LoadingMetadata,
    Ready,
    Degraded,
}

impl BootstrapState {
    fn can_transition_to(self, next: BootstrapState) -> bool {
        use BootstrapState::*;
        matches!(
            (self, next),
            (Initializing, WaitingSource)
                | (Initializing, Degraded)
                | (WaitingSource, LoadingMetadata)
                | (WaitingSource, Degraded)
                | (LoadingMetadata, Ready)
                | (LoadingMetadata, Degraded)
                | (Ready, Degraded)
                | (Degraded, Initializing)
        )
    }
}

pub type SubscriptionId = u64;

pub struct Bootstrap {
    state: RwLock<BootstrapState>,
    reason: RwLock<Option<String>>,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<BootstrapState>>>,
    next_id: AtomicU64,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BootstrapState::Initializing),
            reason: RwLock::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.read()
    }

    /// Why the engine is degraded, if it is.
    pub fn degraded_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<BootstrapState>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub fn transition(&self, next: BootstrapState) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.can_transition_to(next) {
                return Err(BlobError::InvalidTransition(format!(
                    "bootstrap {:?} -> {:?}",
                    *state, next
                )));
            }
            *state = next;
        }
        if next != BootstrapState::Degraded {
            *self.reason.write() = None;
        }
        info!("bootstrap state -> {:?}", next);

        // Drop subscribers whose receiver is gone.
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(next).is_ok());
        Ok(())
    }

    /// Move to `Degraded`, remembering why. No-op when already degraded.
    pub fn degrade(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("bootstrap degraded: {}", reason);
        *self.reason.write() = Some(reason);
        if self.state() != BootstrapState::Degraded {
            if let Err(e) = self.transition(BootstrapState::Degraded) {
                warn!("{}", e);
            }
        }
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `config.source_urls` until one answers its health check.
///
/// Returns the first live URL, or `None` once `source_wait_attempts` rounds
/// have failed. Returns `None` immediately when no sources are configured.
pub async fn wait_for_source(
    probe: &dyn LivenessProbe,
    config: &BootstrapConfig,
) -> Option<String> {
    if config.source_urls.is_empty() {
        return None;
    }
    let attempts = config.source_wait_attempts.max(1);
    for attempt in 0..attempts {
        for url in &config.source_urls {
            match probe.check(url).await {
                Ok(_) => {
                    debug!("source live url={} (round {})", url, attempt);
                    return Some(url.clone());
                }
                Err(e) => debug!("source not live url={}: {}", url, e),
            }
        }
        if attempt + 1 < attempts {
            let factor = 1u64 << attempt.min(16);
            tokio::time::sleep(Duration::from_millis(
                config.source_wait_backoff_ms.saturating_mul(factor),
            ))
            .await;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_notifies_subscribers() {
        let b = Bootstrap::new();
        let (id, mut rx) = b.subscribe();
        let (other, mut rx_other) = b.subscribe();

        b.transition(BootstrapState::WaitingSource).unwrap();
        assert!(b.unsubscribe(other));
        b.transition(BootstrapState::LoadingMetadata).unwrap();
        b.transition(BootstrapState::Ready).unwrap();

        let mut seen = Vec::new();
        while let Ok(s) = rx.try_recv() {
            seen.push(s);
        }
        assert_eq!(
            seen,
            vec![
                BootstrapState::WaitingSource,
                BootstrapState::LoadingMetadata,
                BootstrapState::Ready
            ]
        );
        assert_eq!(rx_other.try_recv().unwrap(), BootstrapState::WaitingSource);
        assert!(rx_other.try_recv().is_err());
        assert!(b.unsubscribe(id));
        assert!(!b.unsubscribe(id));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let b = Bootstrap::new();
        let err = b.transition(BootstrapState::Ready).unwrap_err();
        assert!(matches!(err, BlobError::InvalidTransition(_)));
        assert_eq!(b.state(), BootstrapState::Initializing);
    }

    #[test]
    fn test_degrade_records_reason() {
        let b = Bootstrap::new();
        b.degrade("cache store unavailable");
        assert_eq!(b.state(), BootstrapState::Degraded);
        assert_eq!(b.degraded_reason().as_deref(), Some("cache store unavailable"));
        b.transition(BootstrapState::Initializing).unwrap();
        assert!(b.degraded_reason().is_none());
    }
}
