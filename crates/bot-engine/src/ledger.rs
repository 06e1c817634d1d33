//! Process-wide HTTP budget accounting, keyed by principal.
//!
//! A coarse global lock serializes access; entries older than the rolling
//! window are pruned on every check/record call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};

use crate::api::HttpLimits;

/// A budget violation, phrased as the user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Too many HTTP requests in this eval (max {limit} requests)")]
    PerEvalExceeded { limit: u32 },
    #[error("Too many HTTP requests in this window (max {limit} requests per {window_secs}s)")]
    WindowExceeded { limit: u32, window_secs: u64 },
    #[error("POST body too large (max {limit} bytes)")]
    BodyTooLarge { limit: usize },
}

#[derive(Debug)]
struct WindowEntry {
    at: DateTime<Utc>,
    #[allow(dead_code)]
    eval_id: u64,
}

#[derive(Debug, Default)]
struct PrincipalHistory {
    entries: VecDeque<WindowEntry>,
    current_eval: u64,
    eval_count: u32,
}

/// Rolling-window and per-eval HTTP accounting shared by all workers.
pub struct HttpBudgetLedger {
    limits: HttpLimits,
    next_eval_id: AtomicU64,
    principals: Mutex<HashMap<String, PrincipalHistory>>,
}

impl HttpBudgetLedger {
    pub fn new(limits: HttpLimits) -> Self {
        Self {
            limits,
            next_eval_id: AtomicU64::new(0),
            principals: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &HttpLimits {
        &self.limits
    }

    /// Allocates an eval id and resets the principal's per-eval counter.
    pub fn begin_eval(&self, principal: &str) -> u64 {
        let eval_id = self.next_eval_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut principals = lock(&self.principals);
        let history = principals.entry(principal.to_string()).or_default();
        history.current_eval = eval_id;
        history.eval_count = 0;
        eval_id
    }

    /// Fails when the per-eval or rolling-window budget is spent.
    pub fn check_limits(&self, principal: &str, eval_id: u64) -> Result<(), LedgerError> {
        self.check_limits_at(principal, eval_id, Utc::now())
    }

    fn check_limits_at(
        &self,
        principal: &str,
        eval_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut principals = lock(&self.principals);
        let history = principals.entry(principal.to_string()).or_default();
        self.prune(history, now);

        if history.current_eval == eval_id && history.eval_count >= self.limits.per_eval_limit {
            return Err(LedgerError::PerEvalExceeded {
                limit: self.limits.per_eval_limit,
            });
        }
        if history.entries.len() as u32 >= self.limits.window_limit {
            return Err(LedgerError::WindowExceeded {
                limit: self.limits.window_limit,
                window_secs: self.limits.window.as_secs(),
            });
        }
        Ok(())
    }

    /// Appends one request to the principal's history.
    pub fn record_request(&self, principal: &str, eval_id: u64) {
        self.record_request_at(principal, eval_id, Utc::now());
    }

    fn record_request_at(&self, principal: &str, eval_id: u64, now: DateTime<Utc>) {
        let mut principals = lock(&self.principals);
        let history = principals.entry(principal.to_string()).or_default();
        self.prune(history, now);
        if history.current_eval == eval_id {
            history.eval_count = history.eval_count.saturating_add(1);
        }
        history.entries.push_back(WindowEntry { at: now, eval_id });
    }

    /// Fails when the outbound POST body exceeds the configured cap.
    pub fn validate_post_body(&self, body: &[u8]) -> Result<(), LedgerError> {
        if body.len() > self.limits.post_body_limit_bytes {
            return Err(LedgerError::BodyTooLarge {
                limit: self.limits.post_body_limit_bytes,
            });
        }
        Ok(())
    }

    fn prune(&self, history: &mut PrincipalHistory, now: DateTime<Utc>) {
        let horizon = now
            - TimeDelta::milliseconds(self.limits.window.as_millis().min(i64::MAX as u128) as i64);
        while let Some(entry) = history.entries.front() {
            if entry.at >= horizon {
                break;
            }
            history.entries.pop_front();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(per_eval: u32, window: u32) -> HttpBudgetLedger {
        HttpBudgetLedger::new(HttpLimits {
            per_eval_limit: per_eval,
            window_limit: window,
            ..HttpLimits::default()
        })
    }

    #[test]
    fn per_eval_budget_is_exact() {
        let ledger = ledger(5, 100);
        let eval = ledger.begin_eval("did:plc:a");

        for _ in 0..5 {
            ledger.check_limits("did:plc:a", eval).unwrap();
            ledger.record_request("did:plc:a", eval);
        }
        assert_eq!(
            ledger.check_limits("did:plc:a", eval),
            Err(LedgerError::PerEvalExceeded { limit: 5 })
        );
    }

    #[test]
    fn per_eval_counter_resets_between_evals() {
        let ledger = ledger(2, 100);
        let first = ledger.begin_eval("did:plc:a");
        ledger.record_request("did:plc:a", first);
        ledger.record_request("did:plc:a", first);
        assert!(ledger.check_limits("did:plc:a", first).is_err());

        let second = ledger.begin_eval("did:plc:a");
        assert!(ledger.check_limits("did:plc:a", second).is_ok());
    }

    #[test]
    fn window_budget_spans_evals() {
        let ledger = ledger(100, 3);
        for _ in 0..3 {
            let eval = ledger.begin_eval("did:plc:a");
            ledger.check_limits("did:plc:a", eval).unwrap();
            ledger.record_request("did:plc:a", eval);
        }
        let eval = ledger.begin_eval("did:plc:a");
        assert_eq!(
            ledger.check_limits("did:plc:a", eval),
            Err(LedgerError::WindowExceeded {
                limit: 3,
                window_secs: 60
            })
        );
    }

    #[test]
    fn window_entries_are_pruned() {
        let ledger = ledger(100, 2);
        let eval = ledger.begin_eval("did:plc:a");
        let old = Utc::now() - TimeDelta::seconds(120);
        ledger.record_request_at("did:plc:a", eval, old);
        ledger.record_request_at("did:plc:a", eval, old);

        // Both entries fall outside the 60s window by now.
        assert!(ledger.check_limits("did:plc:a", eval).is_ok());
    }

    #[test]
    fn principals_are_independent() {
        let ledger = ledger(100, 1);
        let a = ledger.begin_eval("did:plc:a");
        ledger.record_request("did:plc:a", a);
        assert!(ledger.check_limits("did:plc:a", a).is_err());

        let b = ledger.begin_eval("did:plc:b");
        assert!(ledger.check_limits("did:plc:b", b).is_ok());
    }

    #[test]
    fn post_body_boundary_is_exact() {
        let ledger = HttpBudgetLedger::new(HttpLimits {
            post_body_limit_bytes: 8,
            ..HttpLimits::default()
        });
        assert!(ledger.validate_post_body(&[0u8; 8]).is_ok());
        assert_eq!(
            ledger.validate_post_body(&[0u8; 9]),
            Err(LedgerError::BodyTooLarge { limit: 8 })
        );
    }

    #[test]
    fn error_message_matches_reply_contract() {
        let err = LedgerError::PerEvalExceeded { limit: 5 };
        assert_eq!(
            err.to_string(),
            "Too many HTTP requests in this eval (max 5 requests)"
        );
    }
}
