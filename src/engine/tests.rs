use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Weekday};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::clock::{AllowAll, FixedClock, ResourceDirectory};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;

// Monday
fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Instant on `day() + offset` days.
fn on(offset: u64, h: u32, m: u32) -> Ms {
    at(day().checked_add_days(chrono::Days::new(offset)).unwrap(), hm(h, m))
}

fn t(h: u32, m: u32) -> Ms {
    on(0, h, m)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("sortie_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    org: Ulid,
    path: PathBuf,
}

impl Fixture {
    fn new(name: &str) -> Self {
        Self::with(name, EngineSettings::default(), Arc::new(AllowAll))
    }

    fn with(name: &str, settings: EngineSettings, directory: Arc<dyn ResourceDirectory>) -> Self {
        let path = test_wal_path(name);
        // A week ahead of the test day so notice rules stay out of the way.
        let clock = Arc::new(FixedClock::new(at(NaiveDate::from_ymd_opt(2026, 5, 25).unwrap(), hm(8, 0))));
        let org = Ulid::new();
        let options = EngineOptions {
            settings,
            clock: clock.clone(),
            directory,
        };
        let engine = Arc::new(Engine::open(org, path.clone(), Arc::new(NotifyHub::new()), options).unwrap());
        Self {
            engine,
            clock,
            org,
            path,
        }
    }

    fn reopen(&self) -> Engine {
        let options = EngineOptions {
            settings: EngineSettings::default(),
            clock: self.clock.clone(),
            directory: Arc::new(AllowAll),
        };
        Engine::open(self.org, self.path.clone(), Arc::new(NotifyHub::new()), options).unwrap()
    }

    /// Each call flies from its own location so only the named resources collide.
    fn rental(&self, aircraft: Ulid) -> BookingDetails {
        BookingDetails {
            location_id: Ulid::new(),
            booking_type: BookingType::Rental,
            training_type: None,
            aircraft_id: Some(aircraft),
            instructor_id: None,
            student_id: None,
            preflight_minutes: 0,
            postflight_minutes: 0,
            route: None,
            notes: None,
        }
    }

    fn dual(&self, aircraft: Ulid, instructor: Ulid, student: Ulid) -> BookingDetails {
        BookingDetails {
            booking_type: BookingType::Training,
            training_type: Some(TrainingType::Dual),
            instructor_id: Some(instructor),
            student_id: Some(student),
            ..self.rental(aircraft)
        }
    }

    fn single(&self, details: BookingDetails, start: Ms, end: Ms) -> BookingRequest {
        BookingRequest {
            organization_id: self.org,
            details,
            scheduled_start: Some(start),
            scheduled_end: Some(end),
            recurrence: None,
            mode: CommitMode::AllOrNothing,
        }
    }

    fn series(&self, details: BookingDetails, recurrence: Recurrence, mode: CommitMode) -> BookingRequest {
        BookingRequest {
            organization_id: self.org,
            details,
            scheduled_start: None,
            scheduled_end: None,
            recurrence: Some(recurrence),
            mode,
        }
    }

    async fn book(&self, details: BookingDetails, start: Ms, end: Ms) -> Result<Booking, EngineError> {
        match self.engine.create_booking(self.single(details, start, end)).await? {
            BookingOutcome::Single(b) => Ok(b),
            BookingOutcome::Series(_) => panic!("single request produced a series"),
        }
    }

    fn rule(&self) -> BookingRule {
        BookingRule {
            id: Ulid::new(),
            organization_id: self.org,
            rule_type: RuleType::General,
            name: "club rules".into(),
            priority: 10,
            resource: None,
            booking_type: None,
            min_duration_minutes: None,
            max_duration_minutes: None,
            min_notice_hours: None,
            max_advance_days: None,
            free_cancellation_hours: None,
            late_cancellation_fee_percent: None,
            active: true,
            created_at: self.clock.now(),
        }
    }

    fn waitlist_entry(&self, candidates: Vec<ResourceKey>, start: NaiveTime, end: NaiveTime, minutes: u32) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            organization_id: self.org,
            user_id: Ulid::new(),
            requested_date: day(),
            preferred_start: start,
            preferred_end: end,
            duration_minutes: minutes,
            booking_type: BookingType::Rental,
            candidates,
            flexibility_days: 0,
            status: WaitlistStatus::Waiting,
            created_at: 0,
        }
    }
}

fn weekly(weekdays: Vec<Weekday>, weeks: u64, start: NaiveTime, end: NaiveTime) -> Recurrence {
    Recurrence {
        frequency: Frequency::Weekly,
        interval: 1,
        weekdays,
        start_date: day(),
        end_date: day().checked_add_days(chrono::Days::new(weeks * 7 - 1)).unwrap(),
        start_time: start,
        end_time: end,
    }
}

fn daily(days: u64, start: NaiveTime, end: NaiveTime) -> Recurrence {
    Recurrence {
        frequency: Frequency::Daily,
        interval: 1,
        weekdays: Vec::new(),
        start_date: day(),
        end_date: day().checked_add_days(chrono::Days::new(days - 1)).unwrap(),
        start_time: start,
        end_time: end,
    }
}

// ── Single bookings ──────────────────────────────────────

#[tokio::test]
async fn buffers_widen_the_blocked_span() {
    let fx = Fixture::new("buffers.wal");
    let aircraft = Ulid::new();
    let mut details = fx.rental(aircraft);
    details.preflight_minutes = 15;
    details.postflight_minutes = 15;

    let booking = fx.book(details, t(10, 0), t(12, 0)).await.unwrap();
    assert_eq!(booking.effective_span(), Span::new(t(9, 45), t(12, 15)));
    assert_eq!(booking.status, BookingStatus::Scheduled);

    let blocked = fx
        .engine
        .resolve_blocked(ResourceKey::aircraft(aircraft), Span::new(t(0, 0), t(23, 0)))
        .await
        .unwrap();
    assert_eq!(blocked, vec![Span::new(t(9, 45), t(12, 15))]);

    // The buffer itself conflicts.
    let err = fx.book(fx.rental(aircraft), t(12, 0), t(13, 0)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::ResourceConflict {
            resource: ResourceKey::aircraft(aircraft),
            interval: Span::new(t(12, 0), t(12, 15)),
        }
    );
}

#[tokio::test]
async fn overlap_conflicts_and_adjacent_fits() {
    let fx = Fixture::new("overlap.wal");
    let aircraft = Ulid::new();
    fx.book(fx.rental(aircraft), t(10, 0), t(12, 0)).await.unwrap();

    let err = fx.book(fx.rental(aircraft), t(11, 0), t(13, 0)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ResourceConflict { resource, .. } if resource == ResourceKey::aircraft(aircraft)
    ));

    assert_ok!(fx.book(fx.rental(aircraft), t(12, 0), t(13, 0)).await);
    assert_ok!(fx.book(fx.rental(aircraft), t(9, 0), t(10, 0)).await);
}

#[tokio::test]
async fn every_resource_is_checked() {
    let fx = Fixture::new("every_resource.wal");
    let (instructor, student) = (Ulid::new(), Ulid::new());
    fx.book(fx.dual(Ulid::new(), instructor, student), t(10, 0), t(12, 0))
        .await
        .unwrap();

    // Different aircraft and student, same instructor.
    let err = fx
        .book(fx.dual(Ulid::new(), instructor, Ulid::new()), t(11, 0), t(12, 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ResourceConflict { resource, .. } if resource == ResourceKey::instructor(instructor)
    ));

    // Nothing shared, nothing in the way.
    assert_ok!(
        fx.book(fx.dual(Ulid::new(), Ulid::new(), Ulid::new()), t(10, 0), t(12, 0))
            .await
    );
}

#[tokio::test]
async fn location_conflicts_like_any_resource() {
    let fx = Fixture::new("location.wal");
    let ramp = Ulid::new();
    let at_ramp = |aircraft| BookingDetails {
        location_id: ramp,
        ..fx.rental(aircraft)
    };
    fx.book(at_ramp(Ulid::new()), t(10, 0), t(12, 0)).await.unwrap();

    assert_eq!(
        fx.book(at_ramp(Ulid::new()), t(11, 0), t(13, 0)).await.unwrap_err(),
        EngineError::ResourceConflict {
            resource: ResourceKey::location(ramp),
            interval: Span::new(t(11, 0), t(12, 0)),
        }
    );
    assert_ok!(fx.book(at_ramp(Ulid::new()), t(12, 0), t(13, 0)).await);

    // A base with room for two flights opts in.
    fx.engine.configure_resource(ResourceKey::location(ramp), 2).await.unwrap();
    assert_ok!(fx.book(at_ramp(Ulid::new()), t(11, 0), t(12, 0)).await);
}

#[tokio::test]
async fn request_shape_is_validated() {
    let fx = Fixture::new("shape.wal");
    let aircraft = Ulid::new();

    assert_eq!(
        fx.book(fx.rental(aircraft), t(12, 0), t(12, 0)).await.unwrap_err(),
        EngineError::InvalidInterval
    );
    assert_eq!(
        fx.book(fx.rental(aircraft), t(12, 0), t(11, 0)).await.unwrap_err(),
        EngineError::InvalidInterval
    );

    let mut missing_end = fx.single(fx.rental(aircraft), t(10, 0), t(11, 0));
    missing_end.scheduled_end = None;
    assert!(matches!(
        fx.engine.create_booking(missing_end).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let mut both = fx.single(fx.rental(aircraft), t(10, 0), t(11, 0));
    both.recurrence = Some(daily(2, hm(10, 0), hm(11, 0)));
    assert!(matches!(
        fx.engine.create_booking(both).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let mut other_org = fx.single(fx.rental(aircraft), t(10, 0), t(11, 0));
    other_org.organization_id = Ulid::new();
    assert_eq!(
        fx.engine.create_booking(other_org).await.unwrap_err(),
        EngineError::InvalidRequest("organization mismatch")
    );

    let mut training = fx.rental(aircraft);
    training.booking_type = BookingType::Training;
    assert_err!(fx.book(training, t(10, 0), t(11, 0)).await);
    assert!(fx.engine.list_bookings(ResourceKey::aircraft(aircraft), Span::new(t(0, 0), t(23, 0))).is_empty());
}

struct GroundedFleet(Ulid);

#[async_trait]
impl ResourceDirectory for GroundedFleet {
    async fn is_active(&self, resource: &ResourceKey) -> bool {
        *resource != ResourceKey::aircraft(self.0)
    }
}

#[tokio::test]
async fn inactive_resource_rejected() {
    let grounded = Ulid::new();
    let fx = Fixture::with("directory.wal", EngineSettings::default(), Arc::new(GroundedFleet(grounded)));

    assert_eq!(
        fx.book(fx.rental(grounded), t(10, 0), t(11, 0)).await.unwrap_err(),
        EngineError::UnknownResource(ResourceKey::aircraft(grounded))
    );
    assert_ok!(fx.book(fx.rental(Ulid::new()), t(10, 0), t(11, 0)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_commit_once() {
    let fx = Fixture::new("concurrent.wal");
    let aircraft = Ulid::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = fx.engine.clone();
        let request = fx.single(fx.rental(aircraft), t(10, 0), t(12, 0));
        handles.push(tokio::spawn(async move { engine.create_booking(request).await }));
    }

    let mut committed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => committed += 1,
            Err(e) => assert!(matches!(e, EngineError::ResourceConflict { .. }), "unexpected {e}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(
        fx.engine
            .list_bookings(ResourceKey::aircraft(aircraft), Span::new(t(0, 0), t(23, 0)))
            .len(),
        1
    );
}

#[tokio::test]
async fn lock_timeout_surfaces_after_retry() {
    let settings = EngineSettings {
        lock_timeout_ms: 20,
        ..EngineSettings::default()
    };
    let fx = Fixture::with("lock_timeout.wal", settings, Arc::new(AllowAll));
    let aircraft = Ulid::new();

    let held = fx.engine.lock_resources(&[ResourceKey::aircraft(aircraft)]).await.unwrap();
    let err = fx.book(fx.rental(aircraft), t(10, 0), t(11, 0)).await.unwrap_err();
    assert_eq!(err, EngineError::LockTimeout { resource: ResourceKey::aircraft(aircraft) });
    assert!(err.is_retryable());
    drop(held);

    assert_ok!(fx.book(fx.rental(aircraft), t(10, 0), t(11, 0)).await);
}

#[tokio::test(start_paused = true)]
async fn lock_set_shares_one_deadline() {
    let settings = EngineSettings {
        lock_timeout_ms: 100,
        ..EngineSettings::default()
    };
    let fx = Fixture::with("lock_deadline.wal", settings, Arc::new(AllowAll));
    let aircraft = ResourceKey::aircraft(Ulid::new());
    let instructor = ResourceKey::instructor(Ulid::new());

    // The aircraft frees up after 80ms; the instructor never does.
    let (taken_tx, taken_rx) = tokio::sync::oneshot::channel();
    let engine = fx.engine.clone();
    let holder = tokio::spawn(async move {
        let held = engine.lock_resources(&[aircraft]).await.unwrap();
        taken_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        drop(held);
    });
    taken_rx.await.unwrap();
    let _instructor = fx.engine.lock_resources(&[instructor]).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = fx.engine.lock_resources(&[instructor, aircraft]).await.unwrap_err();
    assert_eq!(err, EngineError::LockTimeout { resource: instructor });
    // One shared deadline, not 80ms for the aircraft plus a fresh 100ms for the instructor.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(150), "waited {waited:?}");
    holder.await.unwrap();
}

#[tokio::test]
async fn commit_notifies_subscribers() {
    let fx = Fixture::new("notify_commit.wal");
    let aircraft = ResourceKey::aircraft(Ulid::new());
    let mut rx = fx.engine.notify.subscribe(aircraft);

    let booking = fx.book(fx.rental(aircraft.id), t(10, 0), t(11, 0)).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        Notice::BookingCommitted {
            booking_id: booking.id,
            resource: aircraft,
            span: Span::new(t(10, 0), t(11, 0)),
        }
    );
}

// ── Availability and capacity ────────────────────────────

fn window_for(fx: &Fixture, resource: ResourceKey, span: Span, kind: AvailabilityType) -> Availability {
    Availability {
        id: Ulid::new(),
        organization_id: fx.org,
        resource,
        availability_type: kind,
        span,
        reason: Some("100-hour inspection".into()),
    }
}

#[tokio::test]
async fn unavailable_window_blocks_until_removed() {
    let fx = Fixture::new("unavailable.wal");
    let aircraft = ResourceKey::aircraft(Ulid::new());
    let maintenance = window_for(&fx, aircraft, Span::new(t(8, 0), t(12, 0)), AvailabilityType::Unavailable);
    let id = maintenance.id;
    fx.engine.add_availability(maintenance).await.unwrap();

    let free = fx
        .engine
        .check_availability(aircraft, Span::new(t(6, 0), t(18, 0)), None)
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(t(6, 0), t(8, 0)), Span::new(t(12, 0), t(18, 0))]);

    let err = fx.book(fx.rental(aircraft.id), t(11, 0), t(13, 0)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::ResourceConflict {
            resource: aircraft,
            interval: Span::new(t(11, 0), t(12, 0)),
        }
    );

    fx.engine.remove_availability(id).await.unwrap();
    assert_ok!(fx.book(fx.rental(aircraft.id), t(11, 0), t(13, 0)).await);
    assert!(fx.engine.list_availability(aircraft).is_empty());
}

#[tokio::test]
async fn available_windows_do_not_block() {
    let fx = Fixture::new("available.wal");
    let instructor = ResourceKey::instructor(Ulid::new());
    fx.engine
        .add_availability(window_for(&fx, instructor, Span::new(t(9, 0), t(17, 0)), AvailabilityType::Available))
        .await
        .unwrap();

    let window = Span::new(t(6, 0), t(20, 0));
    assert_eq!(
        fx.engine.check_availability(instructor, window, None).await.unwrap(),
        vec![window]
    );
    assert_eq!(fx.engine.list_availability(instructor).len(), 1);
}

#[tokio::test]
async fn min_duration_filters_gaps() {
    let fx = Fixture::new("min_gap.wal");
    let aircraft = Ulid::new();
    fx.book(fx.rental(aircraft), t(9, 0), t(10, 0)).await.unwrap();
    fx.book(fx.rental(aircraft), t(10, 30), t(12, 0)).await.unwrap();

    let free = fx
        .engine
        .check_availability(ResourceKey::aircraft(aircraft), Span::new(t(8, 0), t(14, 0)), Some(HOUR_MS))
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(t(8, 0), t(9, 0)), Span::new(t(12, 0), t(14, 0))]);
}

#[tokio::test]
async fn joint_availability_intersects_resources() {
    let fx = Fixture::new("joint.wal");
    let (aircraft, instructor) = (Ulid::new(), Ulid::new());
    fx.book(fx.rental(aircraft), t(9, 0), t(11, 0)).await.unwrap();
    fx.book(fx.dual(Ulid::new(), instructor, Ulid::new()), t(13, 0), t(14, 0))
        .await
        .unwrap();

    let free = fx
        .engine
        .check_joint_availability(
            &[ResourceKey::aircraft(aircraft), ResourceKey::instructor(instructor)],
            Span::new(t(8, 0), t(16, 0)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        free,
        vec![
            Span::new(t(8, 0), t(9, 0)),
            Span::new(t(11, 0), t(13, 0)),
            Span::new(t(14, 0), t(16, 0)),
        ]
    );
}

#[tokio::test]
async fn capacity_allows_parallel_bookings() {
    let fx = Fixture::new("capacity.wal");
    let sim = Ulid::new();
    fx.engine.configure_resource(ResourceKey::aircraft(sim), 2).await.unwrap();

    fx.book(fx.rental(sim), t(10, 0), t(12, 0)).await.unwrap();
    fx.book(fx.rental(sim), t(11, 0), t(13, 0)).await.unwrap();
    let err = fx.book(fx.rental(sim), t(11, 30), t(11, 45)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::ResourceConflict {
            resource: ResourceKey::aircraft(sim),
            interval: Span::new(t(11, 30), t(11, 45)),
        }
    );
    assert_ok!(fx.book(fx.rental(sim), t(12, 0), t(13, 0)).await);

    assert!(matches!(
        fx.engine.configure_resource(ResourceKey::aircraft(sim), 0).await,
        Err(EngineError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn query_window_is_bounded() {
    let fx = Fixture::new("query_window.wal");
    let key = ResourceKey::aircraft(Ulid::new());
    assert_eq!(
        fx.engine
            .check_availability(key, Span::new(t(0, 0), t(0, 0) + MAX_QUERY_WINDOW_MS + 1), None)
            .await
            .unwrap_err(),
        EngineError::LimitExceeded("query window too wide")
    );
    // Untouched resources are free for the whole window.
    let window = Span::new(t(0, 0), t(23, 0));
    assert_eq!(fx.engine.check_availability(key, window, None).await.unwrap(), vec![window]);
}

// ── Rules ────────────────────────────────────────────────

#[tokio::test]
async fn min_notice_enforced() {
    let fx = Fixture::new("notice.wal");
    fx.engine
        .save_rule(BookingRule {
            min_notice_hours: Some(2),
            ..fx.rule()
        })
        .await
        .unwrap();
    fx.clock.set(t(8, 0));
    let aircraft = Ulid::new();

    assert_eq!(
        fx.book(fx.rental(aircraft), t(9, 0), t(10, 0)).await.unwrap_err(),
        EngineError::Rule(RuleViolation::InsufficientNotice { required_hours: 2 })
    );
    // Exactly two hours out is enough.
    assert_ok!(fx.book(fx.rental(aircraft), t(10, 0), t(11, 0)).await);
    assert_ok!(fx.book(fx.rental(aircraft), t(11, 0), t(12, 0)).await);
}

#[tokio::test]
async fn duration_and_horizon_rules() {
    let fx = Fixture::new("duration.wal");
    let aircraft = Ulid::new();
    fx.engine
        .save_rule(BookingRule {
            min_duration_minutes: Some(30),
            max_duration_minutes: Some(240),
            max_advance_days: Some(30),
            ..fx.rule()
        })
        .await
        .unwrap();

    assert_eq!(
        fx.book(fx.rental(aircraft), t(10, 0), t(10, 15)).await.unwrap_err(),
        EngineError::Rule(RuleViolation::DurationOutOfRange {
            duration_minutes: 15,
            bound: DurationBound::Min(30),
        })
    );
    assert_eq!(
        fx.book(fx.rental(aircraft), t(8, 0), t(13, 0)).await.unwrap_err(),
        EngineError::Rule(RuleViolation::DurationOutOfRange {
            duration_minutes: 300,
            bound: DurationBound::Max(240),
        })
    );
    assert_eq!(
        fx.book(fx.rental(aircraft), on(60, 10, 0), on(60, 11, 0)).await.unwrap_err(),
        EngineError::Rule(RuleViolation::TooFarInAdvance { max_days: 30 })
    );

    // Dry run agrees with the real path.
    assert_eq!(
        fx.engine.validate_against_rules(&fx.rental(aircraft), Span::new(t(10, 0), t(10, 15))),
        Err(EngineError::Rule(RuleViolation::DurationOutOfRange {
            duration_minutes: 15,
            bound: DurationBound::Min(30),
        }))
    );
    assert_ok!(fx.engine.validate_against_rules(&fx.rental(aircraft), Span::new(t(10, 0), t(11, 0))));
}

#[tokio::test]
async fn resource_specific_rule_wins_by_priority() {
    let fx = Fixture::new("rule_priority.wal");
    let (strict, relaxed) = (Ulid::new(), Ulid::new());
    fx.engine
        .save_rule(BookingRule {
            priority: 50,
            max_duration_minutes: Some(600),
            ..fx.rule()
        })
        .await
        .unwrap();
    fx.engine
        .save_rule(BookingRule {
            rule_type: RuleType::ResourceSpecific,
            resource: Some(ResourceKey::aircraft(strict)),
            priority: 1,
            max_duration_minutes: Some(60),
            ..fx.rule()
        })
        .await
        .unwrap();

    assert!(matches!(
        fx.book(fx.rental(strict), t(10, 0), t(12, 0)).await,
        Err(EngineError::Rule(RuleViolation::DurationOutOfRange { .. }))
    ));
    assert_ok!(fx.book(fx.rental(relaxed), t(10, 0), t(12, 0)).await);

    let listed = fx.engine.list_rules();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].priority, 1);
    assert_eq!(fx.engine.applicable_rules(&fx.rental(relaxed)).len(), 1);
}

#[tokio::test]
async fn removed_rule_stops_applying() {
    let fx = Fixture::new("rule_removed.wal");
    let rule = BookingRule {
        max_duration_minutes: Some(60),
        ..fx.rule()
    };
    let id = rule.id;
    fx.engine.save_rule(rule).await.unwrap();
    assert_err!(fx.book(fx.rental(Ulid::new()), t(10, 0), t(12, 0)).await);

    fx.engine.remove_rule(id).await.unwrap();
    assert_ok!(fx.book(fx.rental(Ulid::new()), t(10, 0), t(12, 0)).await);
    assert_eq!(fx.engine.remove_rule(id).await, Err(EngineError::NotFound(id)));
}

#[tokio::test]
async fn inconsistent_rule_rejected() {
    let fx = Fixture::new("rule_invalid.wal");
    let rule = BookingRule {
        min_duration_minutes: Some(120),
        max_duration_minutes: Some(60),
        ..fx.rule()
    };
    assert!(matches!(fx.engine.save_rule(rule).await, Err(EngineError::InvalidRequest(_))));
    let orphan = BookingRule {
        rule_type: RuleType::ResourceSpecific,
        ..fx.rule()
    };
    assert!(matches!(fx.engine.save_rule(orphan).await, Err(EngineError::InvalidRequest(_))));
}

// ── Status transitions ───────────────────────────────────

#[tokio::test]
async fn lifecycle_follows_state_machine() {
    let fx = Fixture::new("lifecycle.wal");
    let b = fx.book(fx.rental(Ulid::new()), t(10, 0), t(11, 0)).await.unwrap();

    assert_eq!(
        fx.engine.complete_booking(b.id).await.unwrap_err(),
        EngineError::InvalidTransition {
            from: BookingStatus::Scheduled,
            to: BookingStatus::Completed,
        }
    );
    assert_eq!(fx.engine.confirm_booking(b.id).await.unwrap().status, BookingStatus::Confirmed);
    assert_eq!(fx.engine.start_booking(b.id).await.unwrap().status, BookingStatus::InProgress);
    assert_eq!(
        fx.engine.cancel_booking(b.id, None).await.unwrap_err(),
        EngineError::InvalidTransition {
            from: BookingStatus::InProgress,
            to: BookingStatus::Cancelled,
        }
    );
    let done = fx.engine.complete_booking(b.id).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);

    // Completed flights keep their slot.
    assert!(
        fx.engine
            .check_availability(ResourceKey::aircraft(b.details.aircraft_id.unwrap()), b.span(), None)
            .await
            .unwrap()
            .is_empty()
    );

    let ghost = Ulid::new();
    assert_eq!(fx.engine.confirm_booking(ghost).await, Err(EngineError::NotFound(ghost)));
}

#[tokio::test]
async fn no_show_only_after_end() {
    let fx = Fixture::new("no_show.wal");
    let aircraft = Ulid::new();
    let b = fx.book(fx.rental(aircraft), t(10, 0), t(11, 0)).await.unwrap();

    fx.clock.set(t(10, 30));
    assert!(matches!(
        fx.engine.mark_no_show(b.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    fx.clock.set(t(11, 0));
    assert_eq!(fx.engine.mark_no_show(b.id).await.unwrap().status, BookingStatus::NoShow);
    assert_eq!(
        fx.engine
            .check_availability(ResourceKey::aircraft(aircraft), Span::new(t(10, 0), t(11, 0)), None)
            .await
            .unwrap(),
        vec![Span::new(t(10, 0), t(11, 0))]
    );
    assert_eq!(fx.engine.collect_overdue(t(23, 0)), Vec::<Ulid>::new());
}

#[tokio::test]
async fn overdue_respects_grace() {
    let fx = Fixture::new("overdue.wal");
    let b = fx.book(fx.rental(Ulid::new()), t(10, 0), t(11, 0)).await.unwrap();
    assert!(fx.engine.collect_overdue(t(11, 29)).is_empty());
    assert_eq!(fx.engine.collect_overdue(t(11, 30)), vec![b.id]);
}

// ── Cancellation and waitlist ────────────────────────────

#[tokio::test]
async fn cancellation_frees_slot_and_records_terms() {
    let fx = Fixture::new("cancel_terms.wal");
    fx.engine
        .save_rule(BookingRule {
            free_cancellation_hours: Some(24),
            late_cancellation_fee_percent: Some(50),
            ..fx.rule()
        })
        .await
        .unwrap();
    let aircraft = Ulid::new();
    let early = fx.book(fx.rental(aircraft), t(10, 0), t(11, 0)).await.unwrap();
    let late = fx.book(fx.rental(aircraft), t(14, 0), t(15, 0)).await.unwrap();

    let c = fx.engine.cancel_booking(early.id, Some("weather".into())).await.unwrap();
    let record = c.booking.cancellation.unwrap();
    assert!(record.within_free_window);
    assert_eq!(record.late_fee_percent, None);
    assert_eq!(record.reason.as_deref(), Some("weather"));

    fx.clock.set(t(6, 0));
    let c = fx.engine.cancel_booking(late.id, None).await.unwrap();
    let record = c.booking.cancellation.unwrap();
    assert!(!record.within_free_window);
    assert_eq!(record.late_fee_percent, Some(50));
    assert!(record.late_fee_applies());

    assert_ok!(fx.book(fx.rental(aircraft), t(10, 0), t(15, 0)).await);
    assert!(matches!(
        fx.engine.cancel_booking(early.id, None).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn cancellation_proposes_waitlist_match() {
    let fx = Fixture::new("waitlist_match.wal");
    let aircraft = ResourceKey::aircraft(Ulid::new());
    let other = ResourceKey::aircraft(Ulid::new());
    let b = fx.book(fx.rental(aircraft.id), t(10, 0), t(12, 0)).await.unwrap();

    let wanted = fx
        .engine
        .add_waitlist_entry(fx.waitlist_entry(vec![aircraft], hm(9, 0), hm(13, 0), 90))
        .await
        .unwrap();
    // Wants a different aircraft.
    fx.engine
        .add_waitlist_entry(fx.waitlist_entry(vec![other], hm(9, 0), hm(13, 0), 60))
        .await
        .unwrap();
    // Needs longer than the freed slot.
    fx.engine
        .add_waitlist_entry(fx.waitlist_entry(vec![aircraft], hm(9, 0), hm(13, 0), 180))
        .await
        .unwrap();

    let mut rx = fx.engine.notify.subscribe(aircraft);
    let c = fx.engine.cancel_booking(b.id, None).await.unwrap();
    assert_eq!(
        c.proposals,
        vec![WaitlistMatchProposal {
            entry_id: wanted.id,
            user_id: wanted.user_id,
            resource: aircraft,
            interval: Span::new(t(10, 0), t(12, 0)),
        }]
    );

    assert!(matches!(rx.recv().await.unwrap(), Notice::BookingReleased { status: BookingStatus::Cancelled, .. }));
    assert!(matches!(rx.recv().await.unwrap(), Notice::WaitlistMatch(p) if p.entry_id == wanted.id));

    // Proposing doesn't consume the entry; accepting does.
    assert_eq!(fx.engine.get_waitlist_entry(wanted.id).unwrap().status, WaitlistStatus::Waiting);
    fx.engine.accept_waitlist_match(wanted.id).await.unwrap();
    assert_eq!(fx.engine.get_waitlist_entry(wanted.id).unwrap().status, WaitlistStatus::Matched);
    assert!(matches!(
        fx.engine.accept_waitlist_match(wanted.id).await,
        Err(EngineError::InvalidRequest(_))
    ));
    assert_eq!(fx.engine.list_waitlist(Some(WaitlistStatus::Waiting)).len(), 2);
}

#[tokio::test]
async fn entry_naming_several_freed_resources_is_proposed_once() {
    let fx = Fixture::new("waitlist_dual.wal");
    let (aircraft, instructor) = (ResourceKey::aircraft(Ulid::new()), ResourceKey::instructor(Ulid::new()));
    let b = fx
        .book(fx.dual(aircraft.id, instructor.id, Ulid::new()), t(10, 0), t(12, 0))
        .await
        .unwrap();

    fx.clock.advance(MINUTE_MS);
    let either = fx
        .engine
        .add_waitlist_entry(fx.waitlist_entry(vec![instructor, aircraft], hm(9, 0), hm(13, 0), 60))
        .await
        .unwrap();
    fx.clock.advance(MINUTE_MS);
    let cfi_only = fx
        .engine
        .add_waitlist_entry(fx.waitlist_entry(vec![instructor], hm(9, 0), hm(13, 0), 60))
        .await
        .unwrap();

    let c = fx.engine.cancel_booking(b.id, None).await.unwrap();
    let named: Vec<(Ulid, ResourceKey)> = c.proposals.iter().map(|p| (p.entry_id, p.resource)).collect();
    assert_eq!(named, vec![(either.id, aircraft), (cfi_only.id, instructor)]);
}

#[tokio::test]
async fn cancellation_without_waiters_proposes_nothing() {
    let fx = Fixture::new("waitlist_empty.wal");
    let b = fx.book(fx.rental(Ulid::new()), t(10, 0), t(12, 0)).await.unwrap();
    fx.engine
        .add_waitlist_entry(fx.waitlist_entry(vec![ResourceKey::aircraft(Ulid::new())], hm(10, 0), hm(12, 0), 60))
        .await
        .unwrap();

    let c = fx.engine.cancel_booking(b.id, None).await.unwrap();
    assert!(c.proposals.is_empty());
}

#[tokio::test]
async fn waitlist_entries_are_validated_and_ordered() {
    let fx = Fixture::new("waitlist_order.wal");
    let key = ResourceKey::aircraft(Ulid::new());

    assert_eq!(
        fx.engine
            .add_waitlist_entry(fx.waitlist_entry(vec![key], hm(12, 0), hm(10, 0), 60))
            .await,
        Err(EngineError::InvalidInterval)
    );
    assert!(matches!(
        fx.engine
            .add_waitlist_entry(fx.waitlist_entry(Vec::new(), hm(10, 0), hm(12, 0), 60))
            .await,
        Err(EngineError::InvalidRequest(_))
    ));

    let first = fx
        .engine
        .add_waitlist_entry(fx.waitlist_entry(vec![key], hm(10, 0), hm(12, 0), 60))
        .await
        .unwrap();
    fx.clock.advance(MINUTE_MS);
    let mut matched_status = fx.waitlist_entry(vec![key], hm(10, 0), hm(12, 0), 60);
    matched_status.status = WaitlistStatus::Matched;
    let second = fx.engine.add_waitlist_entry(matched_status).await.unwrap();
    assert_eq!(second.status, WaitlistStatus::Waiting);

    let ids: Vec<Ulid> = fx.engine.list_waitlist(None).iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);

    fx.engine.cancel_waitlist_entry(first.id).await.unwrap();
    assert_eq!(fx.engine.list_waitlist(Some(WaitlistStatus::Cancelled)).len(), 1);
}

#[tokio::test]
async fn waitlist_expires_after_window() {
    let fx = Fixture::new("waitlist_expiry.wal");
    let mut entry = fx.waitlist_entry(vec![ResourceKey::aircraft(Ulid::new())], hm(10, 0), hm(12, 0), 60);
    entry.flexibility_days = 1;
    let entry = fx.engine.add_waitlist_entry(entry).await.unwrap();

    assert!(fx.engine.expire_waitlist(on(1, 11, 0)).await.unwrap().is_empty());
    assert_eq!(fx.engine.expire_waitlist(on(1, 12, 0)).await.unwrap(), vec![entry.id]);
    assert_eq!(fx.engine.get_waitlist_entry(entry.id).unwrap().status, WaitlistStatus::Expired);
}

// ── Recurring series ─────────────────────────────────────

#[tokio::test]
async fn series_commits_every_occurrence() {
    let fx = Fixture::new("series.wal");
    let (aircraft, instructor, student) = (Ulid::new(), Ulid::new(), Ulid::new());
    let request = fx.series(
        fx.dual(aircraft, instructor, student),
        weekly(vec![Weekday::Mon, Weekday::Wed], 4, hm(10, 0), hm(11, 30)),
        CommitMode::AllOrNothing,
    );

    let BookingOutcome::Series(set) = fx.engine.create_booking(request).await.unwrap() else {
        panic!("expected a series");
    };
    assert_eq!(set.bookings.len(), 8);
    assert!(set.skipped.is_empty());
    assert!(set.bookings.iter().all(|b| b.recurring_pattern_id == Some(set.pattern.id)));
    assert_eq!(set.bookings[0].span(), Span::new(t(10, 0), t(11, 30)));
    assert_eq!(set.bookings[1].span(), Span::new(on(2, 10, 0), on(2, 11, 30)));

    assert_eq!(fx.engine.get_pattern(set.pattern.id), Some(set.pattern.clone()));
    assert_eq!(fx.engine.list_series(set.pattern.id).len(), 8);
    let expanded = fx.engine.expand_pattern(set.pattern.id, None).unwrap();
    assert_eq!(expanded.len(), 8);
    assert_eq!(
        expanded.iter().map(|o| o.span).collect::<Vec<_>>(),
        set.bookings.iter().map(Booking::span).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn series_is_all_or_nothing_by_default() {
    let fx = Fixture::new("series_atomic.wal");
    let aircraft = Ulid::new();
    // Second Wednesday is taken.
    fx.book(fx.rental(aircraft), on(9, 10, 0), on(9, 11, 0)).await.unwrap();

    let recurrence = weekly(vec![Weekday::Mon, Weekday::Wed], 4, hm(10, 0), hm(11, 0));
    let err = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft), recurrence.clone(), CommitMode::AllOrNothing))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceConflict { .. }));

    let all = Span::new(t(0, 0), on(30, 0, 0));
    assert_eq!(fx.engine.list_bookings(ResourceKey::aircraft(aircraft), all).len(), 1);

    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft), recurrence, CommitMode::BestEffort))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    assert_eq!(set.bookings.len(), 7);
    assert_eq!(set.skipped.len(), 1);
    assert_eq!(set.skipped[0].occurrence.index, 3);
    assert_eq!(set.skipped[0].occurrence.span, Span::new(on(9, 10, 0), on(9, 11, 0)));
    assert!(matches!(set.skipped[0].error, EngineError::ResourceConflict { .. }));
    assert_eq!(fx.engine.list_bookings(ResourceKey::aircraft(aircraft), all).len(), 8);
}

#[tokio::test]
async fn series_occurrences_conflict_with_each_other() {
    let fx = Fixture::new("series_self.wal");
    let aircraft = Ulid::new();
    let mut details = fx.rental(aircraft);
    // Long enough to spill into the next day's slot.
    details.postflight_minutes = MAX_BUFFER_MINUTES;

    let err = fx
        .engine
        .create_booking(fx.series(details.clone(), daily(3, hm(10, 0), hm(11, 0)), CommitMode::AllOrNothing))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceConflict { .. }));

    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(details, daily(3, hm(10, 0), hm(11, 0)), CommitMode::BestEffort))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    let kept: Vec<Ms> = set.bookings.iter().map(|b| b.scheduled_start).collect();
    assert_eq!(kept, vec![on(0, 10, 0), on(2, 10, 0)]);
    assert_eq!(set.skipped[0].occurrence.index, 1);
}

#[tokio::test]
async fn best_effort_with_nothing_left_commits_nothing() {
    let fx = Fixture::new("series_empty.wal");
    let aircraft = Ulid::new();
    let blocker = window_for(
        &fx,
        ResourceKey::aircraft(aircraft),
        Span::new(t(0, 0), on(7, 0, 0)),
        AvailabilityType::Unavailable,
    );
    fx.engine.add_availability(blocker).await.unwrap();

    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft), daily(3, hm(10, 0), hm(11, 0)), CommitMode::BestEffort))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    assert!(set.bookings.is_empty());
    assert_eq!(set.skipped.len(), 3);
    assert_eq!(fx.engine.get_pattern(set.pattern.id), None);
}

#[tokio::test]
async fn oversized_series_rejected() {
    let settings = EngineSettings {
        max_occurrences: 10,
        ..EngineSettings::default()
    };
    let fx = Fixture::with("series_large.wal", settings, Arc::new(AllowAll));
    let err = fx
        .engine
        .create_booking(fx.series(fx.rental(Ulid::new()), daily(30, hm(10, 0), hm(11, 0)), CommitMode::BestEffort))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::PatternTooLarge { limit: 10 });
}

#[tokio::test]
async fn series_rules_apply_per_occurrence() {
    let fx = Fixture::new("series_rules.wal");
    fx.engine
        .save_rule(BookingRule {
            max_advance_days: Some(14),
            ..fx.rule()
        })
        .await
        .unwrap();
    fx.clock.set(t(10, 0));

    let recurrence = weekly(vec![Weekday::Mon], 4, hm(10, 0), hm(11, 0));
    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(Ulid::new()), recurrence, CommitMode::BestEffort))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    // Mondays at +0, +7 and +14 days fit; +21 is past the horizon.
    assert_eq!(set.bookings.len(), 3);
    assert_eq!(
        set.skipped[0].error,
        EngineError::Rule(RuleViolation::TooFarInAdvance { max_days: 14 })
    );
}

#[tokio::test]
async fn cancel_series_releases_remaining() {
    let fx = Fixture::new("cancel_series.wal");
    let aircraft = Ulid::new();
    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft), daily(4, hm(10, 0), hm(11, 0)), CommitMode::AllOrNothing))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    // First lesson already flown.
    let first = set.bookings[0].id;
    fx.engine.confirm_booking(first).await.unwrap();
    fx.engine.start_booking(first).await.unwrap();

    let cancelled = fx.engine.cancel_series(set.pattern.id, Some("student moved".into())).await.unwrap();
    assert_eq!(cancelled.len(), 3);
    assert_eq!(fx.engine.get_booking(first).unwrap().status, BookingStatus::InProgress);
    assert!(
        fx.engine
            .list_series(set.pattern.id)
            .iter()
            .skip(1)
            .all(|b| b.status == BookingStatus::Cancelled)
    );
    assert_ok!(fx.book(fx.rental(aircraft), on(3, 10, 0), on(3, 11, 0)).await);

    let missing = Ulid::new();
    assert_eq!(fx.engine.cancel_series(missing, None).await, Err(EngineError::NotFound(missing)));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let fx = Fixture::new("restart.wal");
    let aircraft = ResourceKey::aircraft(Ulid::new());
    let kept = fx.book(fx.rental(aircraft.id), t(10, 0), t(11, 0)).await.unwrap();
    let gone = fx.book(fx.rental(aircraft.id), t(12, 0), t(13, 0)).await.unwrap();
    fx.engine.cancel_booking(gone.id, None).await.unwrap();
    fx.engine.configure_resource(aircraft, 2).await.unwrap();
    fx.engine.save_rule(BookingRule { max_duration_minutes: Some(240), ..fx.rule() }).await.unwrap();
    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft.id), daily(2, hm(15, 0), hm(16, 0)), CommitMode::AllOrNothing))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    let entry = fx
        .engine
        .add_waitlist_entry(fx.waitlist_entry(vec![aircraft], hm(8, 0), hm(9, 0), 60))
        .await
        .unwrap();

    let engine = fx.reopen();
    assert_eq!(engine.get_booking(kept.id), Some(kept.clone()));
    assert_eq!(engine.get_booking(gone.id).unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine.get_pattern(set.pattern.id), Some(set.pattern.clone()));
    assert_eq!(engine.list_series(set.pattern.id).len(), 2);
    assert_eq!(engine.list_rules().len(), 1);
    assert_eq!(engine.get_waitlist_entry(entry.id), Some(entry));
    assert_eq!(
        engine
            .check_availability(aircraft, Span::new(t(9, 0), t(14, 0)), None)
            .await
            .unwrap(),
        vec![Span::new(t(9, 0), t(14, 0))],
        "capacity 2 survives, so one booking leaves the aircraft free"
    );
}

#[tokio::test]
async fn replay_keeps_conflicts() {
    let fx = Fixture::new("restart_conflict.wal");
    let aircraft = Ulid::new();
    fx.book(fx.rental(aircraft), t(10, 0), t(12, 0)).await.unwrap();

    let engine = fx.reopen();
    let err = engine
        .create_booking(fx.single(fx.rental(aircraft), t(11, 0), t(13, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceConflict { .. }));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let fx = Fixture::new("compact.wal");
    let aircraft = ResourceKey::aircraft(Ulid::new());
    fx.engine.configure_resource(aircraft, 3).await.unwrap();
    for i in 0..10 {
        let b = fx.book(fx.rental(aircraft.id), on(i, 10, 0), on(i, 11, 0)).await.unwrap();
        fx.engine.cancel_booking(b.id, None).await.unwrap();
    }
    let kept = fx.book(fx.rental(aircraft.id), t(14, 0), t(15, 0)).await.unwrap();
    let BookingOutcome::Series(set) = fx
        .engine
        .create_booking(fx.series(fx.rental(aircraft.id), daily(3, hm(16, 0), hm(17, 0)), CommitMode::AllOrNothing))
        .await
        .unwrap()
    else {
        panic!("expected a series");
    };
    let window = Span::new(t(0, 0), on(12, 0, 0));
    let before = fx.engine.list_bookings(aircraft, window);
    assert!(fx.engine.wal_appends_since_compact().await > 0);

    let size_before = std::fs::metadata(&fx.path).unwrap().len();
    fx.engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&fx.path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the new file.
    let late = fx.book(fx.rental(aircraft.id), t(18, 0), t(19, 0)).await.unwrap();

    let engine = fx.reopen();
    let mut after = engine.list_bookings(aircraft, window);
    after.retain(|b| b.id != late.id);
    assert_eq!(after, before);
    assert_eq!(engine.get_booking(kept.id), Some(kept));
    assert_eq!(engine.list_series(set.pattern.id).len(), 3);
    assert!(engine.get_booking(late.id).is_some());

    // A second booking beside `kept` only fits if capacity 3 came back.
    assert_ok!(
        engine
            .create_booking(fx.single(fx.rental(aircraft.id), t(14, 0), t(15, 0)))
            .await
    );
}
