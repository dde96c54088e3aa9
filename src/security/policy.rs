//! Security policy enforced on every tool dispatch.
//!
//! The policy gates dispatches on four axes: permission level (allowed at
//! all / needs confirmation), a path sandbox (allow/block prefix lists with
//! symlink resolution), blocked argument patterns, and a per-provider
//! token-bucket rate limit. Every decision lands in an in-memory audit log.
//!
//! `SecurityPolicy` is shared as `Arc<SecurityPolicy>`; all mutable state
//! (buckets, audit log) sits behind interior `Mutex`es.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::traits::{PermissionLevel, ToolDescriptor};

// ─── Config ──────────────────────────────────────────────────────────────────

/// What to do when a provider's rate bucket is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBehavior {
    /// Sleep until a token is available.
    Wait,
    /// Fail the dispatch immediately.
    #[default]
    Fail,
}

/// Declarative policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Levels that may be dispatched at all. Empty means everything up to
    /// `Dangerous` is allowed (subject to confirmation).
    pub allowed_levels: Vec<PermissionLevel>,
    /// Levels whose dispatch requires user confirmation.
    pub confirmation_levels: Vec<PermissionLevel>,
    /// When non-empty, every path argument must fall under one of these
    /// prefixes.
    pub sandbox_allow: Vec<PathBuf>,
    /// Path prefixes that are always denied.
    pub sandbox_block: Vec<PathBuf>,
    /// Regex rules matched against the serialized argument blob.
    pub blocked_patterns: Vec<String>,
    /// Per-provider dispatch budget per minute. `None` disables limiting.
    pub max_ops_per_minute: Option<u32>,
    pub rate_limit_behavior: RateLimitBehavior,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_levels: Vec::new(),
            confirmation_levels: vec![PermissionLevel::System, PermissionLevel::Dangerous],
            sandbox_allow: Vec::new(),
            sandbox_block: default_blocked_dirs(),
            blocked_patterns: default_blocked_patterns(),
            max_ops_per_minute: None,
            rate_limit_behavior: RateLimitBehavior::default(),
        }
    }
}

fn default_blocked_patterns() -> Vec<String> {
    vec![
        // Fork bombs.
        r":\(\)\s*\{\s*:\|:&\s*\}".to_string(),
        // Recursive deletions at the root. The blob is JSON-serialized, so a
        // trailing quote also ends the argument.
        r#"rm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rf][a-zA-Z]*\s+/(\s|$|\*|")"#.to_string(),
        // Raw disk writes.
        r"dd\s+.*of=/dev/".to_string(),
        r"mkfs(\.\w+)?\s".to_string(),
    ]
}

/// Platform-appropriate directories that should never be reachable.
fn default_blocked_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/etc"),
        PathBuf::from("/proc"),
        PathBuf::from("/sys"),
        PathBuf::from("/dev"),
    ];
    if let Some(home) = dirs::home_dir() {
        for sub in &[".ssh", ".aws", ".gnupg", ".config/gcloud"] {
            dirs.push(home.join(sub));
        }
    }
    dirs
}

// ─── Decisions & audit ───────────────────────────────────────────────────────

/// Outcome of the pre-dispatch policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The dispatch may proceed immediately.
    Allowed,
    /// The dispatch may proceed only after user confirmation.
    NeedsConfirmation,
    /// The dispatch is prohibited; the reason explains why.
    Denied(String),
}

/// One entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool_name: String,
    pub args: Value,
    pub level: PermissionLevel,
    pub decision: String,
    pub detail: Option<String>,
}

/// Outcome of a rate-limit acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAcquire {
    Ok,
    /// Caller should sleep for this long, then proceed.
    WaitFor(Duration),
    Denied,
}

// ─── Token bucket ────────────────────────────────────────────────────────────

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        Self {
            tokens: f64::from(per_minute),
            capacity: f64::from(per_minute),
            refill_per_sec: f64::from(per_minute) / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

// ─── SecurityPolicy ──────────────────────────────────────────────────────────

/// Compiled, shareable policy.
pub struct SecurityPolicy {
    config: SecurityConfig,
    patterns: Vec<Regex>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl SecurityPolicy {
    /// Compile a configuration. An invalid blocked-pattern regex is a
    /// configuration error.
    pub fn new(config: SecurityConfig) -> crate::error::Result<Self> {
        let mut patterns = Vec::with_capacity(config.blocked_patterns.len());
        for raw in &config.blocked_patterns {
            let compiled = Regex::new(raw).map_err(|e| {
                crate::error::EngineError::Config(format!("invalid blocked pattern '{raw}': {e}"))
            })?;
            patterns.push(compiled);
        }
        Ok(Self {
            config,
            patterns,
            buckets: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
        })
    }

    /// Policy with the default configuration.
    pub fn default_policy() -> Self {
        #[allow(clippy::expect_used)]
        Self::new(SecurityConfig::default()).expect("default patterns compile")
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Evaluate a dispatch before it reaches the provider: level gate, path
    /// sandbox over schema-hinted path arguments, and blocked patterns over
    /// the serialized argument blob.
    pub fn evaluate(&self, descriptor: &ToolDescriptor, args: &Value) -> PolicyDecision {
        if !self.level_allowed(descriptor.permission_level) {
            return PolicyDecision::Denied(format!(
                "permission level '{:?}' is not allowed by policy",
                descriptor.permission_level
            ));
        }

        for path in crate::tools::schema::path_arguments(&descriptor.input_schema, args) {
            if let Err(reason) = self.validate_path(Path::new(&path)) {
                return PolicyDecision::Denied(reason);
            }
        }

        let blob = args.to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&blob) {
                return PolicyDecision::Denied(format!(
                    "arguments match blocked pattern '{}'",
                    pattern.as_str()
                ));
            }
        }

        if descriptor.requires_confirmation
            || self
                .config
                .confirmation_levels
                .contains(&descriptor.permission_level)
        {
            return PolicyDecision::NeedsConfirmation;
        }

        PolicyDecision::Allowed
    }

    fn level_allowed(&self, level: PermissionLevel) -> bool {
        self.config.allowed_levels.is_empty() || self.config.allowed_levels.contains(&level)
    }

    /// Validate a single path argument against the sandbox: resolve to
    /// absolute form (following symlinks when the path exists), require an
    /// allowlist prefix match when an allowlist is configured, and deny any
    /// blocklist prefix match.
    pub fn validate_path(&self, path: &Path) -> Result<(), String> {
        let path_str = path.to_string_lossy();
        if path_str.contains('\0') {
            return Err("path contains null byte".into());
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        // Symlinks are resolved before prefix checks; a path that does not
        // exist yet is checked in its absolute spelling.
        let canonical = absolute.canonicalize().unwrap_or(absolute);

        for blocked in &self.config.sandbox_block {
            if canonical.starts_with(blocked) {
                return Err(format!("path is under blocked prefix '{}'", blocked.display()));
            }
        }

        if !self.config.sandbox_allow.is_empty()
            && !self
                .config
                .sandbox_allow
                .iter()
                .any(|allowed| canonical.starts_with(allowed))
        {
            return Err(format!(
                "path '{}' is outside the sandbox allowlist",
                canonical.display()
            ));
        }

        Ok(())
    }

    // ── Rate limiting ────────────────────────────────────────────────────────

    /// Try to take one rate-limit token for a provider.
    pub fn acquire(&self, provider_id: &str) -> RateAcquire {
        let Some(per_minute) = self.config.max_ops_per_minute else {
            return RateAcquire::Ok;
        };
        let mut buckets = match self.buckets.lock() {
            Ok(b) => b,
            Err(_) => return RateAcquire::Ok,
        };
        let bucket = buckets
            .entry(provider_id.to_string())
            .or_insert_with(|| TokenBucket::new(per_minute));
        match bucket.try_take() {
            Ok(()) => RateAcquire::Ok,
            Err(wait) => match self.config.rate_limit_behavior {
                RateLimitBehavior::Wait => RateAcquire::WaitFor(wait),
                RateLimitBehavior::Fail => RateAcquire::Denied,
            },
        }
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    /// Append an entry to the audit log.
    pub fn log_action(
        &self,
        tool_name: &str,
        args: Value,
        level: PermissionLevel,
        decision: &str,
        detail: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            tool_name: tool_name.to_string(),
            args,
            level,
            decision: decision.to_string(),
            detail: detail.map(str::to_string),
        };
        if let Ok(mut log) = self.audit.lock() {
            log.push(entry);
        }
    }

    /// Snapshot of the audit log, newest last.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().map(|l| l.clone()).unwrap_or_default()
    }
}
