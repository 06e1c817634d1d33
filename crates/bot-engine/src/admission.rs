//! Per-principal cooldown and global in-flight cap.
//!
//! The cooldown timestamp is stamped on release, not on admission, so an
//! in-flight job does not block its own principal twice; the global cap is
//! the only backstop against self-parallelism.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::api::{AdmissionConfig, RejectReason};

/// Cooldown map entries older than this are dropped on each admission
/// attempt.
const PRUNE_AFTER_SECS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum AdmissionReject {
    #[error("principal is rate limited")]
    Rate,
    #[error("in-flight cap reached")]
    QueueFull,
}

impl From<AdmissionReject> for RejectReason {
    fn from(reject: AdmissionReject) -> Self {
        match reject {
            AdmissionReject::Rate => RejectReason::Rate,
            AdmissionReject::QueueFull => RejectReason::QueueFull,
        }
    }
}

pub(crate) struct AdmissionController {
    config: AdmissionConfig,
    in_flight: AtomicUsize,
    last_accepted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AdmissionController {
    pub(crate) fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a mention, returning a permit whose drop performs the release.
    pub(crate) fn try_admit(
        self: &Arc<Self>,
        principal: &str,
    ) -> Result<AdmissionPermit, AdmissionReject> {
        self.try_admit_at(principal, Utc::now())
    }

    fn try_admit_at(
        self: &Arc<Self>,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmissionPermit, AdmissionReject> {
        let cooldown = TimeDelta::milliseconds(
            self.config.cooldown.as_millis().min(i64::MAX as u128) as i64,
        );

        {
            let mut map = lock(&self.last_accepted);
            map.retain(|_, at| now - *at < TimeDelta::seconds(PRUNE_AFTER_SECS));
            if let Some(at) = map.get(principal) {
                if now - *at < cooldown {
                    return Err(AdmissionReject::Rate);
                }
            }
        }

        let cap = self.config.max_in_flight;
        if self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < cap).then_some(count + 1)
            })
            .is_err()
        {
            return Err(AdmissionReject::QueueFull);
        }

        Ok(AdmissionPermit {
            controller: self.clone(),
            principal: principal.to_string(),
        })
    }

    fn release(&self, principal: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.last_accepted).insert(principal.to_string(), Utc::now());
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// RAII admission: dropping the permit decrements in-flight and stamps the
/// principal's cooldown, so a release happens on every worker exit path.
pub(crate) struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    principal: String,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(&self.principal);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller(cooldown_ms: u64, max_in_flight: usize) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(AdmissionConfig {
            cooldown: Duration::from_millis(cooldown_ms),
            max_in_flight,
        }))
    }

    #[test]
    fn cooldown_applies_after_release() {
        let admission = controller(5_000, 10);

        let permit = admission.try_admit("did:plc:a").unwrap();
        // Not yet released: the same principal can still be admitted (the
        // in-flight cap is the only backstop against self-parallelism).
        assert!(admission.try_admit("did:plc:a").is_ok());

        drop(permit);
        assert_eq!(
            admission.try_admit("did:plc:a").map(|_| ()),
            Err(AdmissionReject::Rate)
        );
    }

    #[test]
    fn cooldown_expires() {
        let admission = controller(5_000, 10);
        drop(admission.try_admit("did:plc:a").unwrap());

        let later = Utc::now() + TimeDelta::milliseconds(5_001);
        assert!(admission.try_admit_at("did:plc:a", later).is_ok());
    }

    #[test]
    fn in_flight_cap_rejects() {
        let admission = controller(0, 2);
        let _a = admission.try_admit("did:plc:a").unwrap();
        let _b = admission.try_admit("did:plc:b").unwrap();
        assert_eq!(
            admission.try_admit("did:plc:c").map(|_| ()),
            Err(AdmissionReject::QueueFull)
        );
        assert_eq!(admission.in_flight(), 2);
    }

    #[test]
    fn release_happens_on_drop() {
        let admission = controller(0, 1);
        {
            let _permit = admission.try_admit("did:plc:a").unwrap();
            assert_eq!(admission.in_flight(), 1);
        }
        assert_eq!(admission.in_flight(), 0);
        assert!(admission.try_admit("did:plc:b").is_ok());
    }

    #[test]
    fn stale_entries_are_pruned() {
        let admission = controller(5_000, 10);
        drop(admission.try_admit("did:plc:a").unwrap());

        let much_later = Utc::now() + TimeDelta::seconds(PRUNE_AFTER_SECS + 1);
        let permit = admission.try_admit_at("did:plc:a", much_later).unwrap();
        // The stale stamp was pruned during the admission attempt; a fresh
        // one only appears once this permit is released.
        assert!(lock(&admission.last_accepted).is_empty());
        drop(permit);
        assert_eq!(lock(&admission.last_accepted).len(), 1);
    }
}
