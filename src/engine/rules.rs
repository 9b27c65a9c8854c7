use std::cmp::Reverse;

use crate::model::*;

use super::error::{DurationBound, RuleViolation};

/// What a booking touches, for deciding which rules apply.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub booking_type: BookingType,
    pub resources: &'a [ResourceKey],
}

fn applies(rule: &BookingRule, ctx: &RuleContext<'_>) -> bool {
    if !rule.active {
        return false;
    }
    if let Some(bt) = rule.booking_type
        && bt != ctx.booking_type {
            return false;
        }
    match rule.rule_type {
        RuleType::General => true,
        RuleType::ResourceSpecific => rule
            .resource
            .is_some_and(|r| ctx.resources.contains(&r)),
    }
}

/// Active rules for the context in evaluation order: priority ascending,
/// ties to the most recently created.
pub fn applicable<'r>(rules: &'r [BookingRule], ctx: &RuleContext<'_>) -> Vec<&'r BookingRule> {
    let mut out: Vec<&BookingRule> = rules.iter().filter(|r| applies(r, ctx)).collect();
    out.sort_by_key(|r| (r.priority, Reverse(r.created_at), Reverse(r.id)));
    out
}

/// Thresholds after first-match resolution. `None` means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,
    pub min_notice_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
    pub free_cancellation_hours: Option<u32>,
    pub late_cancellation_fee_percent: Option<u8>,
}

/// Walk the ordered rules once; the first rule that speaks to a category owns it.
/// Duration bounds are one category, as are the cancellation terms.
pub fn resolve(rules: &[BookingRule], ctx: &RuleContext<'_>) -> Thresholds {
    let mut t = Thresholds::default();
    let mut duration_set = false;
    let mut cancellation_set = false;

    for rule in applicable(rules, ctx) {
        if !duration_set
            && (rule.min_duration_minutes.is_some() || rule.max_duration_minutes.is_some())
        {
            t.min_duration_minutes = rule.min_duration_minutes;
            t.max_duration_minutes = rule.max_duration_minutes;
            duration_set = true;
        }
        if t.min_notice_hours.is_none() {
            t.min_notice_hours = rule.min_notice_hours;
        }
        if t.max_advance_days.is_none() {
            t.max_advance_days = rule.max_advance_days;
        }
        if !cancellation_set && rule.free_cancellation_hours.is_some() {
            t.free_cancellation_hours = rule.free_cancellation_hours;
            t.late_cancellation_fee_percent = rule.late_cancellation_fee_percent;
            cancellation_set = true;
        }
    }
    t
}

impl Thresholds {
    /// Check a candidate interval: duration, then notice, then horizon.
    pub fn check(&self, span: &Span, now: Ms) -> Result<(), RuleViolation> {
        let duration = span.duration_ms();
        let duration_minutes = duration / MINUTE_MS;

        if let Some(min) = self.min_duration_minutes
            && duration < min as Ms * MINUTE_MS {
                return Err(RuleViolation::DurationOutOfRange {
                    duration_minutes,
                    bound: DurationBound::Min(min),
                });
            }
        if let Some(max) = self.max_duration_minutes
            && duration > max as Ms * MINUTE_MS {
                return Err(RuleViolation::DurationOutOfRange {
                    duration_minutes,
                    bound: DurationBound::Max(max),
                });
            }
        if let Some(hours) = self.min_notice_hours
            && now + hours as Ms * HOUR_MS > span.start {
                return Err(RuleViolation::InsufficientNotice {
                    required_hours: hours,
                });
            }
        if let Some(days) = self.max_advance_days
            && span.start > now + days as Ms * DAY_MS {
                return Err(RuleViolation::TooFarInAdvance { max_days: days });
            }
        Ok(())
    }

    /// Cancellation bookkeeping for a booking starting at `scheduled_start`.
    pub fn cancellation(&self, scheduled_start: Ms, now: Ms) -> (bool, Option<u8>) {
        let Some(hours) = self.free_cancellation_hours else {
            return (true, None);
        };
        let within_free_window = now + hours as Ms * HOUR_MS <= scheduled_start;
        let fee = if within_free_window {
            None
        } else {
            self.late_cancellation_fee_percent
        };
        (within_free_window, fee)
    }
}

/// Pure rule check: deterministic for a given rule set and clock reading.
pub fn validate_against_rules(
    rules: &[BookingRule],
    ctx: &RuleContext<'_>,
    span: &Span,
    now: Ms,
) -> Result<(), RuleViolation> {
    resolve(rules, ctx).check(span, now)
}
