mod availability;
mod conflict;
mod error;
mod locks;
mod mutations;
mod queries;
mod recurrence;
mod rules;
mod waitlist;
#[cfg(test)]
mod tests;

pub use availability::{
    compute_saturated_spans, free_within, merge_overlapping, normalize, resolve_blocked, subtract,
    subtract_intervals,
};
pub use error::{DurationBound, EngineError, RuleViolation};
pub use mutations::{BookingOutcome, BookingRequest, BookingSet, Cancellation, CommitMode, SkippedOccurrence};
pub use recurrence::{expand, ExpansionBound, Occurrences};
pub use rules::{applicable, resolve, validate_against_rules, RuleContext, Thresholds};
pub use waitlist::match_waitlist;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::{AllowAll, Clock, ResourceDirectory, SystemClock};
use crate::limits::DEFAULT_MAX_OCCURRENCES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use locks::LockSet;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Per-engine knobs, usually taken from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub lock_timeout_ms: u64,
    pub max_occurrences: usize,
    /// How long after `scheduled_end` an unstarted booking becomes a no-show.
    pub no_show_grace_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
            no_show_grace_ms: 30 * MINUTE_MS,
        }
    }
}

/// Injected collaborators.
#[derive(Clone)]
pub struct EngineOptions {
    pub settings: EngineSettings,
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn ResourceDirectory>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            settings: EngineSettings::default(),
            clock: Arc::new(SystemClock),
            directory: Arc::new(AllowAll),
        }
    }
}

/// Scheduling engine for one organization.
pub struct Engine {
    pub organization_id: Ulid,
    pub(crate) settings: EngineSettings,
    pub notify: Arc<NotifyHub>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) directory: Arc<dyn ResourceDirectory>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) resources: DashMap<ResourceKey, SharedResourceState>,
    /// Capacities set through `configure_resource`.
    pub(super) capacities: DashMap<ResourceKey, u32>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) patterns: DashMap<Ulid, RecurringPattern>,
    pub(super) availability: DashMap<Ulid, Availability>,
    pub(super) rules: DashMap<Ulid, BookingRule>,
    pub(super) waitlist: DashMap<Ulid, WaitlistEntry>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(
        organization_id: Ulid,
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            organization_id,
            settings: options.settings,
            notify,
            clock: options.clock,
            directory: options.directory,
            wal_tx,
            commit_gate: RwLock::new(()),
            resources: DashMap::new(),
            capacities: DashMap::new(),
            bookings: DashMap::new(),
            patterns: DashMap::new(),
            availability: DashMap::new(),
            rules: DashMap::new(),
            waitlist: DashMap::new(),
        };

        // We're the sole owner of every lock here, so try_write always succeeds.
        // Never block: this may run inside an async context (lazy tenant creation).
        for event in &events {
            let keys = engine.event_resources(event);
            let mut locks = engine
                .try_lock_resources(&keys)
                .ok_or_else(|| io::Error::other("replay: resource lock contended"))?;
            engine.apply_event(event, &mut locks);
        }
        if !events.is_empty() {
            tracing::info!(
                "organization {organization_id}: replayed {} events, {} bookings",
                events.len(),
                engine.bookings.len()
            );
        }

        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Timeline for a resource, created empty on first use.
    pub(crate) fn resource(&self, key: &ResourceKey) -> SharedResourceState {
        self.resources
            .entry(*key)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(*key))))
            .value()
            .clone()
    }

    /// Timeline for a resource, if anything has ever touched it.
    pub(crate) fn existing_resource(&self, key: &ResourceKey) -> Option<SharedResourceState> {
        self.resources.get(key).map(|e| e.value().clone())
    }

    pub(crate) fn ensure_organization(&self, organization_id: Ulid) -> Result<(), EngineError> {
        if organization_id != self.organization_id {
            return Err(EngineError::InvalidRequest("organization mismatch"));
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    /// WAL-append, then apply, then notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        locks: &mut LockSet,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        for (resource, notice) in self.apply_event(event, locks) {
            self.notify.send(resource, &notice);
        }
        Ok(())
    }

    /// Resources whose timelines an event touches.
    fn event_resources(&self, event: &Event) -> Vec<ResourceKey> {
        match event {
            Event::BookingsCommitted { bookings, .. } => {
                bookings.iter().flat_map(|b| b.resources()).collect()
            }
            Event::BookingStatusChanged { id, .. } => self
                .bookings
                .get(id)
                .map(|b| b.resources())
                .unwrap_or_default(),
            Event::AvailabilitySaved { availability } => {
                let mut keys = vec![availability.resource];
                if let Some(old) = self.availability.get(&availability.id) {
                    keys.push(old.resource);
                }
                keys
            }
            Event::AvailabilityRemoved { resource, .. } => vec![*resource],
            Event::ResourceConfigured { resource, .. } => vec![*resource],
            Event::RuleSaved { .. }
            | Event::RuleRemoved { .. }
            | Event::WaitlistEntryAdded { .. }
            | Event::WaitlistStatusChanged { .. } => Vec::new(),
        }
    }

    /// Apply an event to in-memory state. Caller holds write locks for
    /// every resource in `event_resources(event)`.
    fn apply_event(&self, event: &Event, locks: &mut LockSet) -> Vec<(ResourceKey, Notice)> {
        let mut notices = Vec::new();
        match event {
            Event::BookingsCommitted { pattern, bookings } => {
                if let Some(p) = pattern {
                    self.patterns.insert(p.id, p.clone());
                }
                for booking in bookings {
                    if booking.status.occupies() {
                        let span = booking.effective_span();
                        for key in booking.resources() {
                            if let Some(rs) = locks.get_mut(&key) {
                                rs.insert_interval(Interval {
                                    id: booking.id,
                                    span,
                                    kind: IntervalKind::Booking,
                                });
                            }
                            notices.push((
                                key,
                                Notice::BookingCommitted {
                                    booking_id: booking.id,
                                    resource: key,
                                    span: booking.span(),
                                },
                            ));
                        }
                    }
                    self.bookings.insert(booking.id, booking.clone());
                }
            }
            Event::BookingStatusChanged {
                id,
                status,
                at,
                cancellation,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    let released = booking.status.occupies() && !status.occupies();
                    booking.status = *status;
                    booking.updated_at = *at;
                    if cancellation.is_some() {
                        booking.cancellation = cancellation.clone();
                    }
                    if released {
                        for key in booking.resources() {
                            if let Some(rs) = locks.get_mut(&key) {
                                rs.remove_interval(*id);
                            }
                            notices.push((
                                key,
                                Notice::BookingReleased {
                                    booking_id: *id,
                                    resource: key,
                                    span: booking.span(),
                                    status: *status,
                                },
                            ));
                        }
                    }
                }
            }
            Event::AvailabilitySaved { availability } => {
                if let Some(old) = self.availability.insert(availability.id, availability.clone())
                    && let Some(rs) = locks.get_mut(&old.resource) {
                        rs.remove_interval(old.id);
                    }
                if let Some(rs) = locks.get_mut(&availability.resource) {
                    let kind = match availability.availability_type {
                        AvailabilityType::Available => IntervalKind::Available,
                        AvailabilityType::Unavailable => IntervalKind::Unavailable,
                    };
                    rs.insert_interval(Interval {
                        id: availability.id,
                        span: availability.span,
                        kind,
                    });
                }
            }
            Event::AvailabilityRemoved { id, resource } => {
                self.availability.remove(id);
                if let Some(rs) = locks.get_mut(resource) {
                    rs.remove_interval(*id);
                }
            }
            Event::ResourceConfigured { resource, capacity } => {
                self.capacities.insert(*resource, *capacity);
                if let Some(rs) = locks.get_mut(resource) {
                    rs.capacity = *capacity;
                }
            }
            Event::RuleSaved { rule } => {
                self.rules.insert(rule.id, rule.clone());
            }
            Event::RuleRemoved { id } => {
                self.rules.remove(id);
            }
            Event::WaitlistEntryAdded { entry } => {
                self.waitlist.insert(entry.id, entry.clone());
            }
            Event::WaitlistStatusChanged { id, status } => {
                if let Some(mut entry) = self.waitlist.get_mut(id) {
                    entry.status = *status;
                }
            }
        }
        notices
    }

    /// Current rule set, in no particular order.
    pub(crate) fn rule_snapshot(&self) -> Vec<BookingRule> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }

    /// Run `op`, and run it once more if it fails with a retryable error.
    /// Each attempt re-reads current state.
    pub(super) async fn retry_once<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        match f().await {
            Err(e) if e.is_retryable() => {
                tracing::debug!("{op}: retrying after {e}");
                metrics::counter!(crate::observability::RETRIES_TOTAL, "op" => op).increment(1);
                f().await
            }
            other => other,
        }
    }
}
