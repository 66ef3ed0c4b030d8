//! Emergency-stop controller: a per-session trip wire over a sliding window
//! of recent events.
//!
//! Trips are state transitions, not errors: the owning session observes the
//! trip and moves to `Halted`. Recovery is an explicit, audited reset backed
//! by a human-authorized token; resetting clears the window but the trip
//! history survives for audit.

use crate::core::error::CodewardError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopEventKind {
    /// A permitted or committed change.
    Change,
    /// A denial, violation, or failed operation.
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Trips when error events within the window reach the threshold.
    RateLimit,
    /// Trips when errors/total exceeds the threshold at min sample size.
    ErrorRate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriggerDecl {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub threshold: f64,
    /// Window length in seconds.
    pub window: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

fn default_min_samples() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryDecl {
    #[serde(default)]
    pub auto_rollback: bool,
    #[serde(default = "default_true")]
    pub require_manual_reset: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RecoveryDecl {
    fn default() -> Self {
        Self { auto_rollback: false, require_manual_reset: true }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EmergencyStopConfig {
    #[serde(default)]
    pub triggers: Vec<TriggerDecl>,
    #[serde(default)]
    pub recovery: RecoveryDecl,
}

impl EmergencyStopConfig {
    pub fn from_json_str(s: &str) -> Result<Self, CodewardError> {
        serde_json::from_str(s).map_err(|e| CodewardError::InvalidProtocol(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CodewardError> {
        toml::from_str(s).map_err(|e| CodewardError::InvalidProtocol(e.to_string()))
    }

    /// Conservative defaults: 5 errors in 60s, or half the events failing
    /// once at least 10 have been seen.
    pub fn default_triggers() -> Self {
        Self {
            triggers: vec![
                TriggerDecl {
                    kind: TriggerKind::RateLimit,
                    threshold: 5.0,
                    window: 60,
                    min_samples: default_min_samples(),
                },
                TriggerDecl {
                    kind: TriggerKind::ErrorRate,
                    threshold: 0.5,
                    window: 60,
                    min_samples: default_min_samples(),
                },
            ],
            recovery: RecoveryDecl::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TripRecord {
    pub ts: String,
    pub event_id: String,
    /// "trip" or "reset".
    pub kind: String,
    pub reason: String,
    pub actor: Option<String>,
}

#[derive(Debug)]
pub struct EmergencyStopController {
    config: EmergencyStopConfig,
    window: VecDeque<(u64, StopEventKind)>,
    tripped: bool,
    trip_reason: Option<String>,
    tripped_at: Option<u64>,
    history: Vec<TripRecord>,
    events_path: Option<PathBuf>,
}

impl EmergencyStopController {
    pub fn new(config: EmergencyStopConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            tripped: false,
            trip_reason: None,
            tripped_at: None,
            history: Vec::new(),
            events_path: None,
        }
    }

    /// Routes trip/reset records to `emergency.events.jsonl` under the store.
    pub fn with_events_log(mut self, path: PathBuf) -> Self {
        self.events_path = Some(path);
        self
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.trip_reason.as_deref()
    }

    pub fn tripped_at(&self) -> Option<u64> {
        self.tripped_at
    }

    pub fn auto_rollback(&self) -> bool {
        self.config.recovery.auto_rollback
    }

    pub fn history(&self) -> &[TripRecord] {
        &self.history
    }

    /// Records one event and evaluates the triggers. Returns the trip reason
    /// when this event is the one that trips the controller.
    pub fn record_event(&mut self, kind: StopEventKind) -> Option<String> {
        self.record_event_at(time::now_epoch_secs(), kind)
    }

    /// Clock-injected variant; the public entry point always passes now.
    pub fn record_event_at(&mut self, now: u64, kind: StopEventKind) -> Option<String> {
        if self.tripped {
            return None;
        }
        self.window.push_back((now, kind));
        self.prune_window(now);
        if let Some(reason) = self.evaluate(now) {
            self.trip(now, &reason);
            return Some(reason);
        }
        None
    }

    /// Forces a trip regardless of window state (external danger signal).
    pub fn trip_manual(&mut self, reason: &str) {
        if !self.tripped {
            self.trip(time::now_epoch_secs(), reason);
        }
    }

    /// Clears the trip and the window. The trip history is preserved, and
    /// the reset itself is recorded. When the recovery policy demands a
    /// manual reset, an empty token is rejected.
    pub fn reset(&mut self, actor: &str, token: &str) -> Result<(), CodewardError> {
        if !self.tripped {
            return Ok(());
        }
        if self.config.recovery.require_manual_reset && token.trim().is_empty() {
            return Err(CodewardError::ValidationError(
                "emergency reset requires an authorization token".to_string(),
            ));
        }
        self.tripped = false;
        self.trip_reason = None;
        self.tripped_at = None;
        self.window.clear();
        let record = TripRecord {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            kind: "reset".to_string(),
            reason: format!("reset with token fingerprint {}", token_fingerprint(token)),
            actor: Some(actor.to_string()),
        };
        self.log(&record);
        self.history.push(record);
        Ok(())
    }

    fn trip(&mut self, now: u64, reason: &str) {
        self.tripped = true;
        self.trip_reason = Some(reason.to_string());
        self.tripped_at = Some(now);
        let record = TripRecord {
            ts: format!("{}Z", now),
            event_id: time::new_event_id(),
            kind: "trip".to_string(),
            reason: reason.to_string(),
            actor: None,
        };
        self.log(&record);
        self.history.push(record);
    }

    fn prune_window(&mut self, now: u64) {
        let max_window = self
            .config
            .triggers
            .iter()
            .map(|t| t.window)
            .max()
            .unwrap_or(0);
        while let Some(&(ts, _)) = self.window.front() {
            if now.saturating_sub(ts) > max_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate(&self, now: u64) -> Option<String> {
        for trigger in &self.config.triggers {
            let in_window: Vec<_> = self
                .window
                .iter()
                .filter(|(ts, _)| now.saturating_sub(*ts) <= trigger.window)
                .collect();
            let total = in_window.len() as u64;
            let errors = in_window
                .iter()
                .filter(|(_, k)| *k == StopEventKind::Error)
                .count() as u64;

            match trigger.kind {
                TriggerKind::RateLimit => {
                    if errors as f64 >= trigger.threshold {
                        return Some(format!(
                            "rate_limit: {} error events in {}s (threshold {})",
                            errors, trigger.window, trigger.threshold
                        ));
                    }
                }
                TriggerKind::ErrorRate => {
                    if total >= trigger.min_samples
                        && (errors as f64 / total as f64) > trigger.threshold
                    {
                        return Some(format!(
                            "error_rate: {}/{} events failed in {}s (threshold {})",
                            errors, total, trigger.window, trigger.threshold
                        ));
                    }
                }
            }
        }
        None
    }

    fn log(&self, record: &TripRecord) {
        use std::fs::OpenOptions;
        use std::io::Write;
        let Some(path) = &self.events_path else {
            return;
        };
        // Best-effort: a full disk must not mask the trip itself.
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{}", serde_json::to_string(record).unwrap());
        }
    }
}

fn token_fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..12].to_string()
}
