//! Sliding-window admission control shared across all ingress paths.
//!
//! Two tiers: `default` (100 req / 60 s) and `expensive` (10 req / 60 s),
//! selected by a path-prefix allowlist. The window is a per-identity sorted
//! set of arrival timestamps; admission runs exactly four operations in one
//! atomic script against the backing store: prune expired members, count,
//! reject at the limit with a `-1` sentinel, otherwise insert the new
//! member and refresh the key TTL.
//!
//! Failure model is fail-secure: when the backing store is unreachable the
//! gate returns [`GateError::Unavailable`] and the caller must reject the
//! request with a 503-equivalent. Store errors are never counted as
//! rate-limit denials.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use sf_core::config::RateWindowConfig;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GateError {
    /// The identity exhausted its window.
    #[error("rate limit exceeded for `{identity}` – retry after {retry_after_secs}s")]
    RateLimited {
        identity: String,
        retry_after_secs: u64,
        reset_epoch_secs: u64,
    },
    /// The backing store could not be reached. Callers must fail secure.
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A rate-limit identity, resolved in priority order: bearer-token subject
/// claim, API-key prefix (first 8 chars), client IP, `unknown`.
///
/// Token parsing happens at the transport layer; this type receives the
/// already-extracted claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn resolve(
        bearer_subject: Option<&str>,
        api_key: Option<&str>,
        client_ip: Option<&str>,
    ) -> Self {
        if let Some(sub) = bearer_subject.filter(|s| !s.is_empty()) {
            return Self(format!("sub:{sub}"));
        }
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let prefix: String = key.chars().take(8).collect();
            return Self(format!("key:{prefix}"));
        }
        if let Some(ip) = client_ip.filter(|ip| !ip.is_empty()) {
            return Self(format!("ip:{ip}"));
        }
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// WindowStore
// ---------------------------------------------------------------------------

/// Backing store for sliding windows. `admit` is the whole four-op script
/// and must execute atomically per key: implementations either run it under
/// a per-key lock (in-process) or as a server-side script (shared store).
///
/// Returns the post-insert member count, or `-1` when the window is full.
pub trait WindowStore: Send + Sync {
    fn admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
        member: &str,
    ) -> Result<i64, String>;
}

/// In-process window store: one mutex-guarded timestamp deque per key.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Mutex<WindowState>>,
}

#[derive(Debug, Default)]
struct WindowState {
    entries: VecDeque<(u64, String)>,
    expires_at_ms: u64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowStore for MemoryWindowStore {
    fn admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
        member: &str,
    ) -> Result<i64, String> {
        let slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(WindowState::default()));
        let mut window = slot.lock().expect("window lock poisoned");

        // Key TTL emulation: a fully expired key starts fresh.
        if window.expires_at_ms != 0 && now_ms >= window.expires_at_ms {
            window.entries.clear();
        }

        // Op 1: drop members older than the window.
        let cutoff = now_ms.saturating_sub(window_ms);
        while window
            .entries
            .front()
            .is_some_and(|(score, _)| *score < cutoff)
        {
            window.entries.pop_front();
        }

        // Op 2 + 3: count, reject at the limit.
        let count = window.entries.len() as u32;
        if count >= limit {
            return Ok(-1);
        }

        // Op 4: insert and refresh TTL (ceil(window/1000)+1 seconds).
        window.entries.push_back((now_ms, member.to_string()));
        window.expires_at_ms = now_ms + window_ms + 1000;
        Ok(i64::from(count) + 1)
    }
}

// ---------------------------------------------------------------------------
// RateLimitGate
// ---------------------------------------------------------------------------

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub remaining: u32,
    pub reset_epoch_secs: u64,
}

pub struct RateLimitGate {
    default_cfg: RateWindowConfig,
    expensive_cfg: RateWindowConfig,
    expensive_prefixes: Vec<String>,
    store: Box<dyn WindowStore>,
}

impl RateLimitGate {
    pub fn new(default_cfg: RateWindowConfig, expensive_cfg: RateWindowConfig) -> Self {
        Self::with_store(default_cfg, expensive_cfg, Box::new(MemoryWindowStore::new()))
    }

    pub fn with_store(
        default_cfg: RateWindowConfig,
        expensive_cfg: RateWindowConfig,
        store: Box<dyn WindowStore>,
    ) -> Self {
        Self {
            default_cfg,
            expensive_cfg,
            expensive_prefixes: vec!["/api/generate".to_string()],
            store,
        }
    }

    /// Replace the path-prefix allowlist that selects the expensive tier.
    pub fn with_expensive_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.expensive_prefixes = prefixes;
        self
    }

    /// Admit or reject one request for `identity` on `path`.
    pub fn admit(&self, identity: &Identity, path: &str) -> Result<Admission, GateError> {
        let (tier, cfg) = self.tier_for(path);
        self.admit_at(identity, tier, cfg, chrono::Utc::now().timestamp_millis() as u64)
    }

    /// Clock-injected variant used by the fairness tests.
    pub fn admit_at(
        &self,
        identity: &Identity,
        tier: &str,
        cfg: RateWindowConfig,
        now_ms: u64,
    ) -> Result<Admission, GateError> {
        let key = format!("{tier}:{}", identity.as_str());
        let member = Uuid::new_v4().to_string();

        let count = self
            .store
            .admit(&key, now_ms, cfg.window_ms(), cfg.max, &member)
            .map_err(|e| {
                warn!(key = %key, error = %e, "rate limit store unavailable");
                GateError::Unavailable(e)
            })?;

        let reset_epoch_secs = (now_ms + cfg.window_ms()).div_ceil(1000);
        if count < 0 {
            warn!(identity = %identity.as_str(), tier, "rate limit exceeded");
            return Err(GateError::RateLimited {
                identity: identity.as_str().to_string(),
                retry_after_secs: cfg.window_secs,
                reset_epoch_secs,
            });
        }

        Ok(Admission {
            remaining: cfg.max.saturating_sub(count as u32),
            reset_epoch_secs,
        })
    }

    /// Select the tier and its config for a request path.
    pub fn tier_for(&self, path: &str) -> (&'static str, RateWindowConfig) {
        if self
            .expensive_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            ("expensive", self.expensive_cfg)
        } else {
            ("default", self.default_cfg)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
