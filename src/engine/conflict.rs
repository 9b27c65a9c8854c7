use crate::limits::*;
use crate::model::*;

use super::availability::resolve_blocked;
use super::{Engine, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

fn check_text(text: &Option<String>) -> Result<(), EngineError> {
    if text.as_ref().is_some_and(|t| t.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("text too long"));
    }
    Ok(())
}

/// Shape checks that don't need any state: the resources a booking type needs are present.
pub(crate) fn validate_details(details: &BookingDetails) -> Result<(), EngineError> {
    match details.booking_type {
        BookingType::Training => {
            if details.student_id.is_none() {
                return Err(EngineError::InvalidRequest("training requires a student"));
            }
            if details.training_type == Some(TrainingType::Solo) {
                if details.aircraft_id.is_none() {
                    return Err(EngineError::InvalidRequest("solo training requires an aircraft"));
                }
            } else if details.instructor_id.is_none() {
                return Err(EngineError::InvalidRequest("training requires an instructor"));
            }
        }
        BookingType::Rental | BookingType::Maintenance => {
            if details.aircraft_id.is_none() {
                return Err(EngineError::InvalidRequest("booking type requires an aircraft"));
            }
        }
        BookingType::Other => {}
    }
    if details.preflight_minutes > MAX_BUFFER_MINUTES || details.postflight_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    check_text(&details.route)?;
    check_text(&details.notes)?;
    Ok(())
}

/// Fail with the first blocked stretch of `effective` on this resource.
pub(crate) fn check_no_conflict(rs: &ResourceState, effective: &Span) -> Result<(), EngineError> {
    if rs.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many intervals on resource"));
    }
    match resolve_blocked(rs, effective).first() {
        Some(blocked) => Err(EngineError::ResourceConflict {
            resource: rs.key,
            interval: *blocked,
        }),
        None => Ok(()),
    }
}

impl Engine {
    /// Reject any resource the directory doesn't know as active.
    pub(crate) async fn check_directory(&self, resources: &[ResourceKey]) -> Result<(), EngineError> {
        for key in resources {
            if !self.directory.is_active(key).await {
                return Err(EngineError::UnknownResource(*key));
            }
        }
        Ok(())
    }
}
