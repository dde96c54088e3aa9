//! Dispatch-time security: permission gating, path sandbox, blocked
//! patterns, rate limiting, and the audit trail.

pub mod policy;

pub use policy::{
    AuditEntry, PolicyDecision, RateAcquire, RateLimitBehavior, SecurityConfig, SecurityPolicy,
};
