use std::sync::Arc;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::info;
use ulid::Ulid;

use sortie::clock::{AllowAll, SystemClock};
use sortie::config::Config;
use sortie::engine::{BookingOutcome, BookingRequest, Engine, EngineError};
use sortie::model::*;
use sortie::tenant::TenantManager;

const MAX_LINE_LEN: usize = 1 << 20;

/// One line of input. Every operation is routed by `organization_id`.
#[derive(Debug, Deserialize)]
struct Request {
    organization_id: Ulid,
    #[serde(flatten)]
    command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    CreateBooking { booking: BookingRequest },
    ConfirmBooking { id: Ulid },
    StartBooking { id: Ulid },
    CompleteBooking { id: Ulid },
    MarkNoShow { id: Ulid },
    CancelBooking { id: Ulid, #[serde(default)] reason: Option<String> },
    CancelSeries { pattern_id: Ulid, #[serde(default)] reason: Option<String> },
    CheckAvailability { resource: ResourceKey, start: Ms, end: Ms, #[serde(default)] min_duration_ms: Option<Ms> },
    CheckJointAvailability { resources: Vec<ResourceKey>, start: Ms, end: Ms, #[serde(default)] min_duration_ms: Option<Ms> },
    ResolveBlocked { resource: ResourceKey, start: Ms, end: Ms },
    ExpandPattern { pattern_id: Ulid, #[serde(default)] until: Option<NaiveDate> },
    ValidateAgainstRules { details: BookingDetails, start: Ms, end: Ms },
    AddAvailability { availability: Availability },
    RemoveAvailability { id: Ulid },
    ConfigureResource { resource: ResourceKey, capacity: u32 },
    SaveRule { rule: BookingRule },
    RemoveRule { id: Ulid },
    AddWaitlistEntry { entry: WaitlistEntry },
    AcceptWaitlistMatch { id: Ulid },
    CancelWaitlistEntry { id: Ulid },
    GetBooking { id: Ulid },
    GetPattern { id: Ulid },
    ListBookings { resource: ResourceKey, start: Ms, end: Ms },
    ListSeries { pattern_id: Ulid },
    ListWaitlist { #[serde(default)] status: Option<WaitlistStatus> },
    ListRules,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::CreateBooking { .. } => "create_booking",
            Command::ConfirmBooking { .. } => "confirm_booking",
            Command::StartBooking { .. } => "start_booking",
            Command::CompleteBooking { .. } => "complete_booking",
            Command::MarkNoShow { .. } => "mark_no_show",
            Command::CancelBooking { .. } => "cancel_booking",
            Command::CancelSeries { .. } => "cancel_series",
            Command::CheckAvailability { .. } => "check_availability",
            Command::CheckJointAvailability { .. } => "check_joint_availability",
            Command::ResolveBlocked { .. } => "resolve_blocked",
            Command::ExpandPattern { .. } => "expand_pattern",
            Command::ValidateAgainstRules { .. } => "validate_against_rules",
            Command::AddAvailability { .. } => "add_availability",
            Command::RemoveAvailability { .. } => "remove_availability",
            Command::ConfigureResource { .. } => "configure_resource",
            Command::SaveRule { .. } => "save_rule",
            Command::RemoveRule { .. } => "remove_rule",
            Command::AddWaitlistEntry { .. } => "add_waitlist_entry",
            Command::AcceptWaitlistMatch { .. } => "accept_waitlist_match",
            Command::CancelWaitlistEntry { .. } => "cancel_waitlist_entry",
            Command::GetBooking { .. } => "get_booking",
            Command::GetPattern { .. } => "get_pattern",
            Command::ListBookings { .. } => "list_bookings",
            Command::ListSeries { .. } => "list_series",
            Command::ListWaitlist { .. } => "list_waitlist",
            Command::ListRules => "list_rules",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Ok(Value),
    Error { kind: &'static str, message: String },
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        Reply::Error {
            kind: e.label(),
            message: e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SkippedReply {
    index: usize,
    date: NaiveDate,
    span: Span,
    kind: &'static str,
    message: String,
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|_| EngineError::InvalidRequest("response not serializable"))
}

fn outcome_json(outcome: &BookingOutcome) -> Result<Value, EngineError> {
    match outcome {
        BookingOutcome::Single(booking) => Ok(serde_json::json!({ "booking": to_json(booking)? })),
        BookingOutcome::Series(set) => {
            let skipped: Vec<SkippedReply> = set
                .skipped
                .iter()
                .map(|s| SkippedReply {
                    index: s.occurrence.index,
                    date: s.occurrence.date,
                    span: s.occurrence.span,
                    kind: s.error.label(),
                    message: s.error.to_string(),
                })
                .collect();
            Ok(serde_json::json!({
                "pattern": to_json(&set.pattern)?,
                "bookings": to_json(&set.bookings)?,
                "skipped": to_json(&skipped)?,
            }))
        }
    }
}

fn window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or(EngineError::InvalidInterval)
}

async fn execute(engine: &Engine, command: Command) -> Result<Value, EngineError> {
    match command {
        Command::CreateBooking { booking } => outcome_json(&engine.create_booking(booking).await?),
        Command::ConfirmBooking { id } => to_json(&engine.confirm_booking(id).await?),
        Command::StartBooking { id } => to_json(&engine.start_booking(id).await?),
        Command::CompleteBooking { id } => to_json(&engine.complete_booking(id).await?),
        Command::MarkNoShow { id } => to_json(&engine.mark_no_show(id).await?),
        Command::CancelBooking { id, reason } => to_json(&engine.cancel_booking(id, reason).await?),
        Command::CancelSeries { pattern_id, reason } => {
            to_json(&engine.cancel_series(pattern_id, reason).await?)
        }
        Command::CheckAvailability { resource, start, end, min_duration_ms } => to_json(
            &engine
                .check_availability(resource, window(start, end)?, min_duration_ms)
                .await?,
        ),
        Command::CheckJointAvailability { resources, start, end, min_duration_ms } => to_json(
            &engine
                .check_joint_availability(&resources, window(start, end)?, min_duration_ms)
                .await?,
        ),
        Command::ResolveBlocked { resource, start, end } => {
            to_json(&engine.resolve_blocked(resource, window(start, end)?).await?)
        }
        Command::ExpandPattern { pattern_id, until } => {
            to_json(&engine.expand_pattern(pattern_id, until)?)
        }
        Command::ValidateAgainstRules { details, start, end } => {
            engine.validate_against_rules(&details, window(start, end)?)?;
            Ok(Value::Null)
        }
        Command::AddAvailability { availability } => {
            engine.add_availability(availability).await?;
            Ok(Value::Null)
        }
        Command::RemoveAvailability { id } => {
            engine.remove_availability(id).await?;
            Ok(Value::Null)
        }
        Command::ConfigureResource { resource, capacity } => {
            engine.configure_resource(resource, capacity).await?;
            Ok(Value::Null)
        }
        Command::SaveRule { rule } => {
            engine.save_rule(rule).await?;
            Ok(Value::Null)
        }
        Command::RemoveRule { id } => {
            engine.remove_rule(id).await?;
            Ok(Value::Null)
        }
        Command::AddWaitlistEntry { entry } => to_json(&engine.add_waitlist_entry(entry).await?),
        Command::AcceptWaitlistMatch { id } => {
            engine.accept_waitlist_match(id).await?;
            Ok(Value::Null)
        }
        Command::CancelWaitlistEntry { id } => {
            engine.cancel_waitlist_entry(id).await?;
            Ok(Value::Null)
        }
        Command::GetBooking { id } => to_json(&engine.get_booking(id).ok_or(EngineError::NotFound(id))?),
        Command::GetPattern { id } => to_json(&engine.get_pattern(id).ok_or(EngineError::NotFound(id))?),
        Command::ListBookings { resource, start, end } => {
            to_json(&engine.list_bookings(resource, window(start, end)?))
        }
        Command::ListSeries { pattern_id } => to_json(&engine.list_series(pattern_id)),
        Command::ListWaitlist { status } => to_json(&engine.list_waitlist(status)),
        Command::ListRules => to_json(&engine.list_rules()),
    }
}

async fn handle_line(tenants: &TenantManager, line: &str) -> Reply {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return Reply::Error {
                kind: "malformed_request",
                message: e.to_string(),
            };
        }
    };
    let engine = match tenants.get_or_create(request.organization_id) {
        Ok(engine) => engine,
        Err(e) => return EngineError::StorageUnavailable(e.to_string()).into(),
    };

    let label = request.command.label();
    let reply = match execute(&engine, request.command).await {
        Ok(value) => Reply::Ok(value),
        Err(e) => e.into(),
    };
    let status = if matches!(reply, Reply::Ok(_)) { "ok" } else { "error" };
    metrics::counter!(sortie::observability::COMMANDS_TOTAL, "command" => label, "status" => status)
        .increment(1);
    reply
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries replies; logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    sortie::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let tenants = Arc::new(TenantManager::from_config(
        &config,
        Arc::new(SystemClock),
        Arc::new(AllowAll),
    ));
    info!("sortie reading operations from stdin");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout_ms: {}", config.lock_timeout_ms);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut replies = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next() => {
                let reply = match line {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&tenants, &line).await,
                    Some(Err(e)) => {
                        tracing::warn!("unreadable input line: {e}");
                        Reply::Error { kind: "malformed_request", message: e.to_string() }
                    }
                    None => break,
                };
                replies.send(serde_json::to_string(&reply)?).await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("sortie stopped");
    Ok(())
}
