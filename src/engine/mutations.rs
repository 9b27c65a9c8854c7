use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_details, validate_span};
use super::locks::LockSet;
use super::recurrence::{expand, ExpansionBound};
use super::rules::{resolve, RuleContext};
use super::waitlist::match_waitlist;
use super::{Engine, EngineError, WalCommand};

// ── Request / outcome types ─────────────────────────────────────

/// How a recurring request treats occurrences that can't be booked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Any failing occurrence rejects the whole series.
    #[default]
    AllOrNothing,
    /// Failing occurrences are skipped and reported; the rest commit.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub organization_id: Ulid,
    #[serde(flatten)]
    pub details: BookingDetails,
    #[serde(default)]
    pub scheduled_start: Option<Ms>,
    #[serde(default)]
    pub scheduled_end: Option<Ms>,
    /// Mutually exclusive with an explicit start/end.
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub mode: CommitMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedOccurrence {
    pub occurrence: Occurrence,
    pub error: EngineError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSet {
    pub pattern: RecurringPattern,
    pub bookings: Vec<Booking>,
    pub skipped: Vec<SkippedOccurrence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Single(Booking),
    Series(BookingSet),
}

impl BookingOutcome {
    pub fn bookings(&self) -> &[Booking] {
        match self {
            BookingOutcome::Single(b) => std::slice::from_ref(b),
            BookingOutcome::Series(set) => &set.bookings,
        }
    }
}

/// A cancelled booking and the waitlist proposals its freed slot produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cancellation {
    pub booking: Booking,
    pub proposals: Vec<WaitlistMatchProposal>,
}

impl Engine {
    // ── Booking creation ───────────────────────────────────────

    /// Validate, conflict-check and commit a single booking or a recurring series.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingOutcome, EngineError> {
        let started = std::time::Instant::now();
        let result = self.create_booking_inner(&request).await;
        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => "create_booking")
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) => {
                metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL)
                    .increment(outcome.bookings().len() as u64);
            }
            Err(e) => {
                tracing::debug!("create_booking rejected: {e}");
                metrics::counter!(crate::observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.label())
                    .increment(1);
            }
        }
        result
    }

    async fn create_booking_inner(&self, request: &BookingRequest) -> Result<BookingOutcome, EngineError> {
        self.ensure_organization(request.organization_id)?;
        validate_details(&request.details)?;
        let resources = request.details.resources();

        match (&request.recurrence, request.scheduled_start, request.scheduled_end) {
            (None, Some(start), Some(end)) => {
                let span = Span::checked(start, end).ok_or(EngineError::InvalidInterval)?;
                validate_span(&span)?;
                self.check_directory(&resources).await?;
                let id = Ulid::new();
                let booking = self
                    .retry_once("create_booking", || self.commit_single(id, request, span))
                    .await?;
                tracing::info!("booking {id} scheduled [{}, {})", span.start, span.end);
                Ok(BookingOutcome::Single(booking))
            }
            (None, _, _) => Err(EngineError::InvalidRequest(
                "scheduled_start and scheduled_end are required",
            )),
            (Some(recurrence), None, None) => {
                self.check_directory(&resources).await?;
                let pattern = RecurringPattern {
                    id: Ulid::new(),
                    organization_id: self.organization_id,
                    recurrence: recurrence.clone(),
                    details: request.details.clone(),
                    created_at: self.clock.now(),
                };
                let bound = ExpansionBound::capped(self.settings.max_occurrences);
                let occurrences = expand(&pattern, bound)?;
                if occurrences.is_empty() {
                    return Err(EngineError::InvalidRequest("pattern produces no occurrences"));
                }
                for occurrence in &occurrences {
                    validate_span(&occurrence.span)?;
                }
                let set = self
                    .retry_once("create_series", || {
                        self.commit_series(&pattern, &occurrences, request.mode)
                    })
                    .await?;
                tracing::info!(
                    "pattern {} scheduled {} occurrences, skipped {}",
                    pattern.id,
                    set.bookings.len(),
                    set.skipped.len()
                );
                Ok(BookingOutcome::Series(set))
            }
            (Some(_), _, _) => Err(EngineError::InvalidRequest(
                "recurrence and explicit start/end are mutually exclusive",
            )),
        }
    }

    fn new_booking(&self, id: Ulid, details: &BookingDetails, span: Span, pattern_id: Option<Ulid>, now: Ms) -> Booking {
        Booking {
            id,
            organization_id: self.organization_id,
            details: details.clone(),
            scheduled_start: span.start,
            scheduled_end: span.end,
            status: BookingStatus::Scheduled,
            recurring_pattern_id: pattern_id,
            created_at: now,
            updated_at: now,
            cancellation: None,
        }
    }

    /// Rules, then lock every resource in order, check each, commit.
    async fn commit_single(&self, id: Ulid, request: &BookingRequest, span: Span) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let resources = request.details.resources();
        let rules = self.rule_snapshot();
        let ctx = RuleContext {
            booking_type: request.details.booking_type,
            resources: &resources,
        };
        resolve(&rules, &ctx).check(&span, now)?;

        let booking = self.new_booking(id, &request.details, span, None, now);
        let effective = booking.effective_span();

        let mut locks = self.lock_resources(&resources).await?;
        for key in &resources {
            if let Some(rs) = locks.get(key) {
                check_no_conflict(rs, &effective)?;
            }
        }

        let event = Event::BookingsCommitted {
            pattern: None,
            bookings: vec![booking.clone()],
        };
        self.persist_and_apply(&event, &mut locks).await?;
        Ok(booking)
    }

    /// Check every occurrence under one lock set and commit the accepted ones
    /// together with the pattern as a single WAL record.
    async fn commit_series(
        &self,
        pattern: &RecurringPattern,
        occurrences: &[Occurrence],
        mode: CommitMode,
    ) -> Result<BookingSet, EngineError> {
        let now = self.clock.now();
        let details = &pattern.details;
        let resources = details.resources();
        let rules = self.rule_snapshot();
        let ctx = RuleContext {
            booking_type: details.booking_type,
            resources: &resources,
        };
        let thresholds = resolve(&rules, &ctx);

        let mut locks = self.lock_resources(&resources).await?;

        // Scratch copies so occurrences are also checked against each other.
        let mut scratch: Vec<ResourceState> = resources
            .iter()
            .filter_map(|key| locks.get(key).cloned())
            .collect();

        let mut bookings = Vec::new();
        let mut skipped = Vec::new();

        for occurrence in occurrences {
            let effective = details.occupied(occurrence.span);
            let verdict = thresholds
                .check(&occurrence.span, now)
                .map_err(EngineError::from)
                .and_then(|()| scratch.iter().try_for_each(|rs| check_no_conflict(rs, &effective)));

            match verdict {
                Ok(()) => {
                    let booking = self.new_booking(Ulid::new(), details, occurrence.span, Some(pattern.id), now);
                    for rs in &mut scratch {
                        rs.insert_interval(Interval {
                            id: booking.id,
                            span: effective,
                            kind: IntervalKind::Booking,
                        });
                    }
                    bookings.push(booking);
                }
                Err(error) => match mode {
                    CommitMode::AllOrNothing => return Err(error),
                    CommitMode::BestEffort => {
                        tracing::debug!("pattern {}: skipping occurrence {}: {error}", pattern.id, occurrence.index);
                        skipped.push(SkippedOccurrence {
                            occurrence: *occurrence,
                            error,
                        });
                    }
                },
            }
        }

        if !bookings.is_empty() {
            let event = Event::BookingsCommitted {
                pattern: Some(pattern.clone()),
                bookings: bookings.clone(),
            };
            self.persist_and_apply(&event, &mut locks).await?;
        }

        Ok(BookingSet {
            pattern: pattern.clone(),
            bookings,
            skipped,
        })
    }

    // ── Status transitions ─────────────────────────────────────

    /// Move a booking along the state machine under its resource locks.
    async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let resources = self
            .bookings
            .get(&id)
            .map(|b| b.resources())
            .ok_or(EngineError::NotFound(id))?;
        let mut locks = self.lock_resources(&resources).await?;

        // Re-read under the locks: a concurrent transition may have won.
        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to,
            });
        }

        let now = self.clock.now();
        let cancellation = match to {
            BookingStatus::Cancelled => {
                let rules = self.rule_snapshot();
                let ctx = RuleContext {
                    booking_type: booking.details.booking_type,
                    resources: &resources,
                };
                let (within_free_window, late_fee_percent) =
                    resolve(&rules, &ctx).cancellation(booking.scheduled_start, now);
                Some(CancellationRecord {
                    reason,
                    cancelled_at: now,
                    within_free_window,
                    late_fee_percent,
                })
            }
            BookingStatus::NoShow if now < booking.scheduled_end => {
                return Err(EngineError::InvalidTransition {
                    from: booking.status,
                    to,
                });
            }
            _ => None,
        };

        let event = Event::BookingStatusChanged {
            id,
            status: to,
            at: now,
            cancellation,
        };
        self.persist_and_apply(&event, &mut locks).await?;
        drop(locks);

        self.bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.retry_once("confirm_booking", || self.transition(id, BookingStatus::Confirmed, None))
            .await
    }

    /// Check-in.
    pub async fn start_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.retry_once("start_booking", || self.transition(id, BookingStatus::InProgress, None))
            .await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.retry_once("complete_booking", || self.transition(id, BookingStatus::Completed, None))
            .await
    }

    /// Only valid once `scheduled_end` has passed.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.retry_once("mark_no_show", || self.transition(id, BookingStatus::NoShow, None))
            .await
    }

    /// Cancel a booking, then offer the freed slot to the waitlist.
    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Cancellation, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("text too long"));
        }
        let booking = self
            .retry_once("cancel_booking", || {
                self.transition(id, BookingStatus::Cancelled, reason.clone())
            })
            .await?;

        let late = booking
            .cancellation
            .as_ref()
            .is_some_and(CancellationRecord::late_fee_applies);
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "late" => if late { "true" } else { "false" })
            .increment(1);
        tracing::info!("booking {id} cancelled (late fee: {late})");

        // The cancellation is committed and its locks released at this point.
        let proposals = self.on_slot_freed(&booking.resources(), booking.span());
        Ok(Cancellation { booking, proposals })
    }

    /// Cancel every still-cancellable booking generated from a pattern.
    pub async fn cancel_series(&self, pattern_id: Ulid, reason: Option<String>) -> Result<Vec<Cancellation>, EngineError> {
        if !self.patterns.contains_key(&pattern_id) {
            return Err(EngineError::NotFound(pattern_id));
        }
        let mut ids: Vec<(Ms, Ulid)> = self
            .bookings
            .iter()
            .filter(|b| b.recurring_pattern_id == Some(pattern_id))
            .filter(|b| b.status.can_transition_to(BookingStatus::Cancelled))
            .map(|b| (b.scheduled_start, b.id))
            .collect();
        ids.sort();

        let mut cancelled = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            match self.cancel_booking(id, reason.clone()).await {
                Ok(c) => cancelled.push(c),
                // Lost a race with another transition; nothing left to cancel.
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    // ── Waitlist ───────────────────────────────────────────────

    /// Proposals for waiting entries that fit a slot freed on `resources`, one
    /// per entry. Read-only: entries stay WAITING until `accept_waitlist_match`.
    pub fn on_slot_freed(&self, resources: &[ResourceKey], interval: Span) -> Vec<WaitlistMatchProposal> {
        let entries: Vec<WaitlistEntry> = self.waitlist.iter().map(|e| e.value().clone()).collect();
        let proposals = match_waitlist(&entries, resources, &interval);
        for proposal in &proposals {
            self.notify.send(proposal.resource, &Notice::WaitlistMatch(proposal.clone()));
        }
        if !proposals.is_empty() {
            metrics::counter!(crate::observability::WAITLIST_PROPOSALS_TOTAL)
                .increment(proposals.len() as u64);
        }
        proposals
    }

    pub async fn add_waitlist_entry(&self, mut entry: WaitlistEntry) -> Result<WaitlistEntry, EngineError> {
        self.ensure_organization(entry.organization_id)?;
        if entry.preferred_span().is_none() || entry.duration_minutes == 0 {
            return Err(EngineError::InvalidInterval);
        }
        if entry.candidates.is_empty() {
            return Err(EngineError::InvalidRequest("waitlist entry needs at least one candidate resource"));
        }
        if entry.candidates.len() > MAX_WAITLIST_CANDIDATES {
            return Err(EngineError::LimitExceeded("too many candidate resources"));
        }
        entry.status = WaitlistStatus::Waiting;
        entry.created_at = self.clock.now();

        let event = Event::WaitlistEntryAdded { entry: entry.clone() };
        self.persist_and_apply(&event, &mut LockSet::empty()).await?;
        Ok(entry)
    }

    async fn set_waitlist_status(&self, id: Ulid, status: WaitlistStatus) -> Result<(), EngineError> {
        let current = self
            .waitlist
            .get(&id)
            .map(|e| e.status)
            .ok_or(EngineError::NotFound(id))?;
        if current != WaitlistStatus::Waiting {
            return Err(EngineError::InvalidRequest("waitlist entry is no longer waiting"));
        }
        let event = Event::WaitlistStatusChanged { id, status };
        self.persist_and_apply(&event, &mut LockSet::empty()).await
    }

    /// The external confirmation step: the client took the proposed slot.
    pub async fn accept_waitlist_match(&self, id: Ulid) -> Result<(), EngineError> {
        self.set_waitlist_status(id, WaitlistStatus::Matched).await
    }

    pub async fn cancel_waitlist_entry(&self, id: Ulid) -> Result<(), EngineError> {
        self.set_waitlist_status(id, WaitlistStatus::Cancelled).await
    }

    /// Expire waiting entries whose acceptable window has fully passed.
    pub async fn expire_waitlist(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let stale: Vec<Ulid> = self
            .waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting)
            .filter(|e| e.acceptable_span().is_none_or(|s| s.end <= now))
            .map(|e| e.id)
            .collect();
        for id in &stale {
            self.set_waitlist_status(*id, WaitlistStatus::Expired).await?;
        }
        Ok(stale)
    }

    // ── Administrative inputs ──────────────────────────────────

    /// Insert or replace an availability window.
    pub async fn add_availability(&self, availability: Availability) -> Result<(), EngineError> {
        self.ensure_organization(availability.organization_id)?;
        if availability.span.start >= availability.span.end {
            return Err(EngineError::InvalidInterval);
        }
        if availability.span.start < MIN_VALID_TIMESTAMP_MS || availability.span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if availability.reason.as_ref().is_some_and(|r| r.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("text too long"));
        }
        let mut keys = vec![availability.resource];
        if let Some(old) = self.availability.get(&availability.id) {
            keys.push(old.resource);
        }
        let mut locks = self.lock_resources(&keys).await?;
        let event = Event::AvailabilitySaved { availability };
        self.persist_and_apply(&event, &mut locks).await
    }

    pub async fn remove_availability(&self, id: Ulid) -> Result<(), EngineError> {
        let resource = self
            .availability
            .get(&id)
            .map(|a| a.resource)
            .ok_or(EngineError::NotFound(id))?;
        let mut locks = self.lock_resources(&[resource]).await?;
        let event = Event::AvailabilityRemoved { id, resource };
        self.persist_and_apply(&event, &mut locks).await
    }

    /// Set how many concurrent bookings a resource takes.
    pub async fn configure_resource(&self, resource: ResourceKey, capacity: u32) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidRequest("capacity must be at least 1"));
        }
        let mut locks = self.lock_resources(&[resource]).await?;
        let event = Event::ResourceConfigured { resource, capacity };
        self.persist_and_apply(&event, &mut locks).await
    }

    pub async fn save_rule(&self, rule: BookingRule) -> Result<(), EngineError> {
        self.ensure_organization(rule.organization_id)?;
        if let (Some(min), Some(max)) = (rule.min_duration_minutes, rule.max_duration_minutes)
            && min > max {
                return Err(EngineError::InvalidRequest("min duration exceeds max duration"));
            }
        if rule.rule_type == RuleType::ResourceSpecific && rule.resource.is_none() {
            return Err(EngineError::InvalidRequest("resource-specific rule needs a resource"));
        }
        if rule.late_cancellation_fee_percent.is_some_and(|p| p > 100) {
            return Err(EngineError::InvalidRequest("fee percent above 100"));
        }
        let event = Event::RuleSaved { rule };
        self.persist_and_apply(&event, &mut LockSet::empty()).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.rules.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id };
        self.persist_and_apply(&event, &mut LockSet::empty()).await
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Scheduled/confirmed bookings whose end passed more than the grace period ago.
    pub fn collect_overdue(&self, now: Ms) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|b| matches!(b.status, BookingStatus::Scheduled | BookingStatus::Confirmed))
            .filter(|b| b.scheduled_end + self.settings.no_show_grace_ms <= now)
            .map(|b| b.id)
            .collect()
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        // Resource locks may be held by commits waiting on the gate, so capacity
        // comes from the map rather than the timelines.
        for c in self.capacities.iter() {
            events.push(Event::ResourceConfigured {
                resource: *c.key(),
                capacity: *c.value(),
            });
        }
        for a in self.availability.iter() {
            events.push(Event::AvailabilitySaved { availability: a.value().clone() });
        }
        for r in self.rules.iter() {
            events.push(Event::RuleSaved { rule: r.value().clone() });
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        bookings.sort_by_key(|b| (b.scheduled_start, b.id));
        for p in self.patterns.iter() {
            let series: Vec<Booking> = bookings
                .iter()
                .filter(|b| b.recurring_pattern_id == Some(p.id))
                .cloned()
                .collect();
            events.push(Event::BookingsCommitted {
                pattern: Some(p.value().clone()),
                bookings: series,
            });
        }
        for b in bookings.into_iter().filter(|b| b.recurring_pattern_id.is_none()) {
            events.push(Event::BookingsCommitted {
                pattern: None,
                bookings: vec![b],
            });
        }
        for e in self.waitlist.iter() {
            events.push(Event::WaitlistEntryAdded { entry: e.value().clone() });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
