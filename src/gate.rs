//! Per-identifier admission control and egress proxy rotation.
//!
//! The gate sits in front of every call to the extraction tool. It bounds how
//! often a single identifier may be retried after failures within a sliding
//! window, and hands out configured proxies in round-robin order.
//!
//! In [`AdmissionMode::Advisory`] the check and the later record are two
//! separate steps, so concurrent requests for the same identifier may both be
//! admitted before either records a failure. [`AdmissionMode::Reserve`] closes
//! that gap by appending under the same lock as the check.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);
pub const DEFAULT_THRESHOLD: usize = 5;

type AttemptMap = HashMap<String, Vec<DateTime<Utc>>>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSettings {
    pub window: Duration,
    pub threshold: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionMode {
    /// Check now, record only when the caller reports a failure.
    #[default]
    Advisory,
    /// Check and reserve a slot atomically; a success gives the slot back.
    Reserve,
}

impl AdmissionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "advisory" => Some(Self::Advisory),
            "reserve" | "strict" => Some(Self::Reserve),
            _ => None,
        }
    }
}

/// Returned when an identifier has used up its attempts for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

pub struct AdmissionGate {
    settings: GateSettings,
    attempts: Mutex<AttemptMap>,
    proxies: Vec<String>,
    cursor: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    pub fn new<I, S>(settings: GateSettings, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_clock(settings, proxies, Arc::new(SystemClock))
    }

    pub fn with_clock<I, S>(settings: GateSettings, proxies: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let proxies = proxies
            .into_iter()
            .filter_map(|value| {
                let trimmed = value.as_ref().trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .collect();

        Self {
            settings,
            attempts: Mutex::new(HashMap::new()),
            proxies,
            cursor: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn settings(&self) -> GateSettings {
        self.settings
    }

    pub fn proxy_pool(&self) -> &[String] {
        &self.proxies
    }

    /// Compacts the identifier's history to the current window and reports
    /// whether it has reached the threshold.
    pub fn is_rate_limited(&self, identifier: &str) -> bool {
        let now = self.clock.now();
        let mut attempts = self.attempts.lock();
        let count = self.prune_entry(&mut attempts, identifier, now);
        count >= self.settings.threshold
    }

    /// Appends the current time to the identifier's history. Does not prune.
    pub fn record_attempt(&self, identifier: &str) {
        let now = self.clock.now();
        self.attempts
            .lock()
            .entry(identifier.to_string())
            .or_default()
            .push(now);
    }

    /// Advances the rotation cursor and returns the proxy under it, or `None`
    /// when no proxies are configured.
    pub fn next_proxy(&self) -> Option<&str> {
        let len = self.proxies.len();
        if len == 0 {
            return None;
        }

        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some((cursor + 1) % len)
            })
            .unwrap_or_else(|cursor| cursor);

        self.proxies.get((previous + 1) % len).map(String::as_str)
    }

    pub fn retry_after(&self) -> Duration {
        self.settings.window
    }

    /// Single entry point for gated calls. The returned [`Admission`] must be
    /// resolved with [`Admission::succeeded`] or [`Admission::failed`].
    pub fn admit(&self, identifier: &str, mode: AdmissionMode) -> Result<Admission<'_>, RateLimited> {
        let limited = RateLimited {
            retry_after: self.retry_after(),
        };

        match mode {
            AdmissionMode::Advisory => {
                if self.is_rate_limited(identifier) {
                    warn!(identifier, "rate limit exceeded");
                    return Err(limited);
                }
                debug!(identifier, "admitted");
                Ok(Admission {
                    gate: self,
                    identifier: identifier.to_string(),
                    reserved_at: None,
                })
            }
            AdmissionMode::Reserve => {
                let now = self.clock.now();
                let mut attempts = self.attempts.lock();
                let count = self.prune_entry(&mut attempts, identifier, now);
                if count >= self.settings.threshold {
                    warn!(identifier, "rate limit exceeded");
                    return Err(limited);
                }
                attempts
                    .entry(identifier.to_string())
                    .or_default()
                    .push(now);
                debug!(identifier, in_window = count + 1, "reserved attempt slot");
                Ok(Admission {
                    gate: self,
                    identifier: identifier.to_string(),
                    reserved_at: Some(now),
                })
            }
        }
    }

    /// Drops identifiers with no attempts left inside the window.
    pub fn sweep(&self) -> usize {
        let window_start = self.window_start(self.clock.now());
        let mut attempts = self.attempts.lock();
        let before = attempts.len();
        attempts.retain(|_, timestamps| {
            timestamps.retain(|timestamp| *timestamp > window_start);
            !timestamps.is_empty()
        });
        before - attempts.len()
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Saturates at the earliest representable instant for windows longer
    /// than the clock's history.
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = TimeDelta::from_std(self.settings.window).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn prune_entry(&self, attempts: &mut AttemptMap, identifier: &str, now: DateTime<Utc>) -> usize {
        let window_start = self.window_start(now);
        let entries = attempts.entry(identifier.to_string()).or_default();
        entries.retain(|timestamp| *timestamp > window_start);
        entries.len()
    }

    fn release(&self, identifier: &str, reserved_at: DateTime<Utc>) {
        let mut attempts = self.attempts.lock();
        if let Some(entries) = attempts.get_mut(identifier)
            && let Some(position) = entries.iter().rposition(|timestamp| *timestamp == reserved_at)
        {
            entries.remove(position);
        }
    }
}

/// Outcome handle for one admitted call.
#[must_use = "resolve the admission with succeeded() or failed()"]
pub struct Admission<'a> {
    gate: &'a AdmissionGate,
    identifier: String,
    reserved_at: Option<DateTime<Utc>>,
}

impl Admission<'_> {
    /// Successes never count against the identifier.
    pub fn succeeded(self) {
        if let Some(reserved_at) = self.reserved_at {
            self.gate.release(&self.identifier, reserved_at);
        }
    }

    /// The call never reached the extraction tool; nothing is counted.
    pub fn withdrawn(self) {
        if let Some(reserved_at) = self.reserved_at {
            self.gate.release(&self.identifier, reserved_at);
        }
        debug!(identifier = %self.identifier, "admission withdrawn");
    }

    pub fn failed(self) {
        if self.reserved_at.is_none() {
            self.gate.record_attempt(&self.identifier);
        }
        debug!(identifier = %self.identifier, "recorded failed attempt");
    }
}
