use ulid::Ulid;

use crate::model::{BookingStatus, ResourceKey, Span};

/// Which side of the duration bounds a request fell outside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationBound {
    Min(u32),
    Max(u32),
}

/// A rejection produced by the booking rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    DurationOutOfRange {
        duration_minutes: i64,
        bound: DurationBound,
    },
    InsufficientNotice {
        required_hours: u32,
    },
    TooFarInAdvance {
        max_days: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInterval,
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    ResourceConflict {
        resource: ResourceKey,
        interval: Span,
    },
    Rule(RuleViolation),
    PatternTooLarge {
        limit: usize,
    },
    LockTimeout {
        resource: ResourceKey,
    },
    StorageUnavailable(String),
    NotFound(Ulid),
    InvalidRequest(&'static str),
    UnknownResource(ResourceKey),
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Conflicts and lock timeouts may clear up on a fresh look at the state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceConflict { .. } | EngineError::LockTimeout { .. }
        )
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval => "invalid_interval",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ResourceConflict { .. } => "resource_conflict",
            EngineError::Rule(RuleViolation::DurationOutOfRange { .. }) => "duration_out_of_range",
            EngineError::Rule(RuleViolation::InsufficientNotice { .. }) => "insufficient_notice",
            EngineError::Rule(RuleViolation::TooFarInAdvance { .. }) => "too_far_in_advance",
            EngineError::PatternTooLarge { .. } => "pattern_too_large",
            EngineError::LockTimeout { .. } => "lock_timeout",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::UnknownResource(_) => "unknown_resource",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl From<RuleViolation> for EngineError {
    fn from(v: RuleViolation) -> Self {
        EngineError::Rule(v)
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::DurationOutOfRange {
                duration_minutes,
                bound: DurationBound::Min(min),
            } => write!(
                f,
                "duration {duration_minutes} min below minimum of {min} min"
            ),
            RuleViolation::DurationOutOfRange {
                duration_minutes,
                bound: DurationBound::Max(max),
            } => write!(
                f,
                "duration {duration_minutes} min above maximum of {max} min"
            ),
            RuleViolation::InsufficientNotice { required_hours } => {
                write!(f, "insufficient notice: at least {required_hours}h required")
            }
            RuleViolation::TooFarInAdvance { max_days } => {
                write!(f, "too far in advance: at most {max_days} days ahead")
            }
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval => write!(f, "invalid interval: end must be after start"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::ResourceConflict { resource, interval } => write!(
                f,
                "resource {resource} blocked during [{}, {})",
                interval.start, interval.end
            ),
            EngineError::Rule(v) => write!(f, "{v}"),
            EngineError::PatternTooLarge { limit } => {
                write!(f, "pattern expands to more than {limit} occurrences")
            }
            EngineError::LockTimeout { resource } => {
                write!(f, "timed out waiting for lock on {resource}")
            }
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::UnknownResource(r) => write!(f, "unknown or inactive resource: {r}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
