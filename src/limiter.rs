//! Named rate limiters shared by every actor in a workload.
//!
//! Limiters are created lazily by name the first time any actor asks for
//! one and are shared from then on. The registry refills all of them at the
//! start of every phase, so scheduling order inside a phase never leaves one
//! actor starting against a drained bucket.

use parking_lot::Mutex;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigNode;
use crate::core::errors::{LoadcastError, Result};
use crate::orchestrator::PhaseObserver;
use crate::phase::PhaseNumber;

/// `operations` may run every `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    pub operations: u64,
    pub per: Duration,
}

impl RateSpec {
    pub fn new(operations: u64, per: Duration) -> Result<Self> {
        if operations == 0 {
            return Err(LoadcastError::configuration(
                "Rate must allow at least one operation",
            ));
        }
        if per.is_zero() {
            return Err(LoadcastError::configuration("Rate period must be non-zero"));
        }
        Ok(Self { operations, per })
    }

    /// Reads `"100 per 1 second"` or `{ Operations: 100, Per: "1 second" }`.
    pub fn from_node(node: &ConfigNode) -> Result<Self> {
        let with_path = |e: LoadcastError| {
            LoadcastError::configuration_field(
                format!("Invalid rate at '{}': {}", node.path(), e),
                node.path().to_string(),
            )
        };

        match node.value() {
            Some(Value::String(s)) => s.parse().map_err(with_path),
            Some(Value::Mapping(_)) => {
                let operations: u64 = node.get("Operations").to()?;
                let per: String = node.get("Per").to()?;
                let per = parse_duration(&per).map_err(with_path)?;
                Self::new(operations, per).map_err(with_path)
            }
            _ => Err(LoadcastError::configuration_field(
                format!("Missing or malformed rate at '{}'", node.path()),
                node.path().to_string(),
            )),
        }
    }
}

impl FromStr for RateSpec {
    type Err = LoadcastError;

    fn from_str(s: &str) -> Result<Self> {
        let (ops, per) = s.split_once(" per ").ok_or_else(|| {
            LoadcastError::configuration(format!("Expected '<ops> per <duration>', got '{}'", s))
        })?;
        let operations = ops.trim().parse::<u64>().map_err(|e| {
            LoadcastError::configuration(format!("Bad operation count '{}': {}", ops.trim(), e))
        })?;
        Self::new(operations, parse_duration(per)?)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {:?}", self.operations, self.per)
    }
}

/// Parses `"<n> <unit>"`, e.g. `"2 seconds"`, `"500ms"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (count, unit) = s.split_at(split);
    let count = count.parse::<u64>().map_err(|e| {
        LoadcastError::configuration(format!("Bad duration '{}': {}", s, e))
    })?;

    let duration = match unit.trim() {
        "ns" | "nanosecond" | "nanoseconds" => Duration::from_nanos(count),
        "us" | "microsecond" | "microseconds" => Duration::from_micros(count),
        "ms" | "millisecond" | "milliseconds" => Duration::from_millis(count),
        "s" | "second" | "seconds" => Duration::from_secs(count),
        "m" | "minute" | "minutes" => {
            let secs = count.checked_mul(60).ok_or_else(|| {
                LoadcastError::configuration(format!("Duration '{}' is too large", s))
            })?;
            Duration::from_secs(secs)
        }
        other => {
            return Err(LoadcastError::configuration(format!(
                "Unknown duration unit '{}' in '{}'",
                other, s
            )))
        }
    };
    Ok(duration)
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_emptied: Instant,
}

/// Token bucket that refills to `operations` once every `per`.
#[derive(Debug)]
pub struct GlobalRateLimiter {
    name: String,
    spec: RateSpec,
    users: AtomicUsize,
    resets: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl GlobalRateLimiter {
    pub fn new(name: impl Into<String>, spec: RateSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            users: AtomicUsize::new(0),
            resets: AtomicU64::new(0),
            bucket: Mutex::new(Bucket {
                tokens: spec.operations,
                last_emptied: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    pub fn add_user(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    /// How many times the bucket was refilled by a phase boundary.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Try to take one token. Returns false if the caller should back off.
    pub fn consume_if_within_rate(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        if now.saturating_duration_since(bucket.last_emptied) >= self.spec.per {
            bucket.tokens = self.spec.operations;
            bucket.last_emptied = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Refill immediately and restart the period from now.
    pub fn reset_last_emptied(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = self.spec.operations;
        bucket.last_emptied = Instant::now();
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry of named limiters. One limiter per name, ever.
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<GlobalRateLimiter>>>,
    sealed: AtomicBool,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Get or create the limiter called `name` and count the caller as a user.
    pub fn acquire(&self, name: &str, spec: RateSpec) -> Result<Arc<GlobalRateLimiter>> {
        if self.is_sealed() {
            return Err(LoadcastError::logic(format!(
                "Cannot create rate-limiters after setup. Name tried: {}",
                name
            )));
        }

        let mut limiters = self.limiters.lock();
        let limiter = limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Created rate limiter '{}' ({})", name, spec);
                Arc::new(GlobalRateLimiter::new(name, spec))
            })
            .clone();

        if limiter.spec() != spec {
            warn!(
                "Rate limiter '{}' already exists with {}; ignoring requested {}",
                name,
                limiter.spec(),
                spec
            );
        }
        limiter.add_user();
        Ok(limiter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<GlobalRateLimiter>> {
        self.limiters.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseObserver for RateLimiterRegistry {
    fn on_phase_start(&self, phase: PhaseNumber) {
        let limiters: Vec<_> = self.limiters.lock().values().cloned().collect();
        for limiter in &limiters {
            limiter.reset_last_emptied();
        }
        debug!("Reset {} rate limiters for phase {}", limiters.len(), phase);
    }
}
