use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_within, resolve_blocked};
use super::recurrence::{expand, ExpansionBound};
use super::rules::{applicable, validate_against_rules, RuleContext};
use super::{Engine, EngineError};

fn check_window(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::InvalidInterval);
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Free sub-intervals of `window` for one resource, optionally dropping
    /// gaps shorter than `min_duration_ms`. A resource nothing has touched is
    /// free for the whole window.
    pub async fn check_availability(
        &self,
        resource: ResourceKey,
        window: Span,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        let mut free = match self.existing_resource(&resource) {
            Some(rs) => free_within(&*rs.read().await, &window),
            None => vec![window],
        };
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    /// Stretches of `window` where every resource in `resources` is free at once,
    /// e.g. an aircraft together with an instructor.
    pub async fn check_joint_availability(
        &self,
        resources: &[ResourceKey],
        window: Span,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        if resources.len() > MAX_WAITLIST_CANDIDATES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if resources.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_events: Vec<(Ms, i32)> = Vec::new();
        for key in resources {
            for s in self.check_availability(*key, window, None).await? {
                all_events.push((s.start, 1));
                all_events.push((s.end, -1));
            }
        }
        all_events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let threshold = resources.len() as i32;
        let mut result = Vec::new();
        let mut count: i32 = 0;
        let mut seg_start: Option<Ms> = None;

        for (time, delta) in &all_events {
            let prev = count;
            count += delta;

            if prev < threshold && count >= threshold {
                seg_start = Some(*time);
            } else if prev >= threshold && count < threshold
                && let Some(start) = seg_start.take()
                && *time > start {
                    let span = Span::new(start, *time);
                    if min_duration_ms.is_none_or(|d| span.duration_ms() >= d) {
                        result.push(span);
                    }
                }
        }

        Ok(result)
    }

    /// Blocked sub-intervals of `window` for one resource.
    pub async fn resolve_blocked(&self, resource: ResourceKey, window: Span) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        Ok(match self.existing_resource(&resource) {
            Some(rs) => resolve_blocked(&*rs.read().await, &window),
            None => Vec::new(),
        })
    }

    /// Occurrences of a stored pattern, capped by the configured ceiling.
    pub fn expand_pattern(&self, pattern_id: Ulid, until: Option<NaiveDate>) -> Result<Vec<Occurrence>, EngineError> {
        let pattern = self.get_pattern(pattern_id).ok_or(EngineError::NotFound(pattern_id))?;
        expand(
            &pattern,
            ExpansionBound {
                until,
                max_occurrences: self.settings.max_occurrences,
            },
        )
    }

    /// Dry-run the rule check for a prospective booking at the current time.
    pub fn validate_against_rules(&self, details: &BookingDetails, span: Span) -> Result<(), EngineError> {
        let resources = details.resources();
        let ctx = RuleContext {
            booking_type: details.booking_type,
            resources: &resources,
        };
        validate_against_rules(&self.rule_snapshot(), &ctx, &span, self.clock.now())?;
        Ok(())
    }

    pub fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.bookings.get(&id).map(|b| b.value().clone())
    }

    /// Bookings involving `resource` that overlap `window`, by start time.
    /// Includes released ones; filter on status for the live set.
    pub fn list_bookings(&self, resource: ResourceKey, window: Span) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.details.involves(&resource) && b.span().overlaps(&window))
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| (b.scheduled_start, b.id));
        out
    }

    pub fn get_pattern(&self, id: Ulid) -> Option<RecurringPattern> {
        self.patterns.get(&id).map(|p| p.value().clone())
    }

    /// Bookings generated from a pattern, by start time.
    pub fn list_series(&self, pattern_id: Ulid) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.recurring_pattern_id == Some(pattern_id))
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| (b.scheduled_start, b.id));
        out
    }

    pub fn list_availability(&self, resource: ResourceKey) -> Vec<Availability> {
        let mut out: Vec<Availability> = self
            .availability
            .iter()
            .filter(|a| a.resource == resource)
            .map(|a| a.value().clone())
            .collect();
        out.sort_by_key(|a| (a.span.start, a.id));
        out
    }

    /// All rules in evaluation order (inactive ones last).
    pub fn list_rules(&self) -> Vec<BookingRule> {
        let mut out = self.rule_snapshot();
        out.sort_by_key(|r| (!r.active, r.priority, std::cmp::Reverse(r.created_at), std::cmp::Reverse(r.id)));
        out
    }

    /// Rules that would govern a booking of this shape, in evaluation order.
    pub fn applicable_rules(&self, details: &BookingDetails) -> Vec<BookingRule> {
        let rules = self.rule_snapshot();
        let resources = details.resources();
        let ctx = RuleContext {
            booking_type: details.booking_type,
            resources: &resources,
        };
        applicable(&rules, &ctx).into_iter().cloned().collect()
    }

    /// Waitlist entries in arrival order.
    pub fn list_waitlist(&self, status: Option<WaitlistStatus>) -> Vec<WaitlistEntry> {
        let mut out: Vec<WaitlistEntry> = self
            .waitlist
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| (e.created_at, e.id));
        out
    }

    pub fn get_waitlist_entry(&self, id: Ulid) -> Option<WaitlistEntry> {
        self.waitlist.get(&id).map(|e| e.value().clone())
    }
}
