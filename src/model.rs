use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Concurrent bookings any resource takes until `configure_resource` says otherwise.
pub const DEFAULT_CAPACITY: u32 = 1;

/// Combine a calendar date and a time of day into a UTC instant.
pub fn at(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    pub fn intersection(&self, other: &Span) -> Option<Span> {
        Span::checked(self.start.max(other.start), self.end.min(other.end))
    }

    /// Grow the span by `before` ms at the start and `after` ms at the end.
    pub fn widen(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Aircraft,
    Instructor,
    Student,
    Location,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Aircraft => "aircraft",
            ResourceKind::Instructor => "instructor",
            ResourceKind::Student => "student",
            ResourceKind::Location => "location",
        }
    }
}

/// One bookable dimension. Ordering is (kind, id) and is the lock acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: Ulid,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, id: Ulid) -> Self {
        Self { kind, id }
    }

    pub fn aircraft(id: Ulid) -> Self {
        Self::new(ResourceKind::Aircraft, id)
    }

    pub fn instructor(id: Ulid) -> Self {
        Self::new(ResourceKind::Instructor, id)
    }

    pub fn student(id: Ulid) -> Self {
        Self::new(ResourceKind::Student, id)
    }

    pub fn location(id: Ulid) -> Self {
        Self::new(ResourceKind::Location, id)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    Training,
    Rental,
    Maintenance,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingType {
    Dual,
    Solo,
    Ground,
    Simulator,
    Checkride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Edges of the booking state machine.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Scheduled, Confirmed)
                | (Confirmed, InProgress)
                | (InProgress, Completed)
                | (Scheduled | Confirmed, Cancelled)
                | (Scheduled | Confirmed, NoShow)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    /// Whether a booking in this status still holds its resources.
    /// Completed flights keep their slot in the history; cancelled and no-show ones free it.
    pub fn occupies(self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who and what a booking ties up. Shared by single requests, patterns and bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub location_id: Ulid,
    pub booking_type: BookingType,
    #[serde(default)]
    pub training_type: Option<TrainingType>,
    #[serde(default)]
    pub aircraft_id: Option<Ulid>,
    #[serde(default)]
    pub instructor_id: Option<Ulid>,
    #[serde(default)]
    pub student_id: Option<Ulid>,
    #[serde(default)]
    pub preflight_minutes: u32,
    #[serde(default)]
    pub postflight_minutes: u32,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BookingDetails {
    /// Every resource this booking occupies, sorted in lock order.
    pub fn resources(&self) -> Vec<ResourceKey> {
        let mut keys = vec![ResourceKey::location(self.location_id)];
        keys.extend(self.aircraft_id.map(ResourceKey::aircraft));
        keys.extend(self.instructor_id.map(ResourceKey::instructor));
        keys.extend(self.student_id.map(ResourceKey::student));
        keys.sort();
        keys
    }

    pub fn involves(&self, resource: &ResourceKey) -> bool {
        self.resources().contains(resource)
    }

    pub fn buffers_ms(&self) -> (Ms, Ms) {
        (
            self.preflight_minutes as Ms * MINUTE_MS,
            self.postflight_minutes as Ms * MINUTE_MS,
        )
    }

    /// The scheduled span widened by the pre/post-flight buffers.
    pub fn occupied(&self, scheduled: Span) -> Span {
        let (before, after) = self.buffers_ms();
        scheduled.widen(before, after)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub reason: Option<String>,
    pub cancelled_at: Ms,
    /// True when the cancellation came before the free-cancellation cutoff.
    pub within_free_window: bool,
    /// Fee percentage owed for a late cancellation; `None` when no fee applies.
    pub late_fee_percent: Option<u8>,
}

impl CancellationRecord {
    pub fn late_fee_applies(&self) -> bool {
        !self.within_free_window && self.late_fee_percent.is_some_and(|p| p > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub details: BookingDetails,
    pub scheduled_start: Ms,
    pub scheduled_end: Ms,
    pub status: BookingStatus,
    pub recurring_pattern_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancellation: Option<CancellationRecord>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.scheduled_start, self.scheduled_end)
    }

    pub fn effective_span(&self) -> Span {
        self.details.occupied(self.span())
    }

    pub fn resources(&self) -> Vec<ResourceKey> {
        self.details.resources()
    }
}

// ── Recurring patterns ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// The calendar part of a recurring pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    /// Every N days/weeks/months; 0 is treated as 1.
    #[serde(default = "one")]
    pub interval: u32,
    /// Selected weekdays for weekly patterns. Empty means the weekday of `start_date`.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub recurrence: Recurrence,
    pub details: BookingDetails,
    pub created_at: Ms,
}

/// One concrete, unsaved instance generated from a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub pattern_id: Ulid,
    /// Position in the expanded sequence, starting at 0.
    pub index: usize,
    pub date: NaiveDate,
    pub span: Span,
}

// ── Availability windows ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityType {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub resource: ResourceKey,
    pub availability_type: AvailabilityType,
    pub span: Span,
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Booking rules ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    General,
    ResourceSpecific,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRule {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub rule_type: RuleType,
    pub name: String,
    /// Lower is evaluated first.
    pub priority: i32,
    /// Target of a resource-specific rule.
    #[serde(default)]
    pub resource: Option<ResourceKey>,
    /// Restricts the rule to one booking type.
    #[serde(default)]
    pub booking_type: Option<BookingType>,
    #[serde(default)]
    pub min_duration_minutes: Option<u32>,
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,
    #[serde(default)]
    pub min_notice_hours: Option<u32>,
    #[serde(default)]
    pub max_advance_days: Option<u32>,
    #[serde(default)]
    pub free_cancellation_hours: Option<u32>,
    #[serde(default)]
    pub late_cancellation_fee_percent: Option<u8>,
    pub active: bool,
    pub created_at: Ms,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistStatus {
    Waiting,
    Matched,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub user_id: Ulid,
    pub requested_date: NaiveDate,
    pub preferred_start: NaiveTime,
    pub preferred_end: NaiveTime,
    pub duration_minutes: u32,
    pub booking_type: BookingType,
    pub candidates: Vec<ResourceKey>,
    #[serde(default)]
    pub flexibility_days: u32,
    pub status: WaitlistStatus,
    pub created_at: Ms,
}

impl WaitlistEntry {
    pub fn preferred_span(&self) -> Option<Span> {
        Span::checked(
            at(self.requested_date, self.preferred_start),
            at(self.requested_date, self.preferred_end),
        )
    }

    /// Preferred window widened by the flexibility days on both sides.
    pub fn acceptable_span(&self) -> Option<Span> {
        let flex = self.flexibility_days as Ms * DAY_MS;
        self.preferred_span().map(|s| s.widen(flex, flex))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistMatchProposal {
    pub entry_id: Ulid,
    pub user_id: Ulid,
    pub resource: ResourceKey,
    pub interval: Span,
}

// ── Resource timelines ───────────────────────────────────────────

/// What an interval on a resource timeline represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    /// Explicit open slot. Recorded, never subtracted.
    Available,
    /// Maintenance, leave and other closures.
    Unavailable,
    /// Effective occupied interval of a live booking.
    Booking,
}

/// One entry on a resource timeline; `id` is the availability or booking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub key: ResourceKey,
    /// Max concurrent bookings.
    pub capacity: u32,
    /// Availability windows and live bookings, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            capacity: DEFAULT_CAPACITY,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

/// WAL record format. Each variant is one atomic commit unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingsCommitted {
        pattern: Option<RecurringPattern>,
        bookings: Vec<Booking>,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        cancellation: Option<CancellationRecord>,
    },
    AvailabilitySaved {
        availability: Availability,
    },
    AvailabilityRemoved {
        id: Ulid,
        resource: ResourceKey,
    },
    ResourceConfigured {
        resource: ResourceKey,
        capacity: u32,
    },
    RuleSaved {
        rule: BookingRule,
    },
    RuleRemoved {
        id: Ulid,
    },
    WaitlistEntryAdded {
        entry: WaitlistEntry,
    },
    WaitlistStatusChanged {
        id: Ulid,
        status: WaitlistStatus,
    },
}

impl Event {
    pub fn label(&self) -> &'static str {
        match self {
            Event::BookingsCommitted { .. } => "bookings_committed",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::AvailabilitySaved { .. } => "availability_saved",
            Event::AvailabilityRemoved { .. } => "availability_removed",
            Event::ResourceConfigured { .. } => "resource_configured",
            Event::RuleSaved { .. } => "rule_saved",
            Event::RuleRemoved { .. } => "rule_removed",
            Event::WaitlistEntryAdded { .. } => "waitlist_entry_added",
            Event::WaitlistStatusChanged { .. } => "waitlist_status_changed",
        }
    }
}

/// What subscribers of a resource channel receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    BookingCommitted {
        booking_id: Ulid,
        resource: ResourceKey,
        span: Span,
    },
    BookingReleased {
        booking_id: Ulid,
        resource: ResourceKey,
        span: Span,
        status: BookingStatus,
    },
    WaitlistMatch(WaitlistMatchProposal),
}
