//! Timer-triggered message scheduler.
//!
//! A secondary consumer that turns JSON job-control messages into timer
//! tasks.  Control messages arrive on the registry conduit named
//! [`CONTROL_CHANNEL`]; each accepted job posts its `reply_args` to a named
//! reply channel when its trigger fires.  The scheduler depends only on the
//! channel layer; the HTTP and WebSocket bridges never touch it.
//!
//! # Job control protocol
//!
//! ```json
//! { "method": "add", "id": "tick", "trigger": "interval", "seconds": 30,
//!   "reply_channel": "schedule.tick", "reply_args": {"kind": "tick"} }
//! { "method": "remove", "id": "tick" }
//! ```
//!
//! Triggers:
//!
//! | Trigger    | Arguments                                                | Fires      |
//! |------------|----------------------------------------------------------|------------|
//! | `interval` | `weeks`/`days`/`hours`/`minutes`/`seconds` (integers)    | repeating  |
//! | `date`     | `run_date` (RFC 3339 string)                             | once       |
//! | `cron`     | `second`/`minute`/`hour`/`day`/`month`/`day_of_week`/`year` (integers) | repeating |
//!
//! A malformed control message is logged and skipped, never fatal: the
//! scheduler outlives bad producers.  `reply_channel` must start with
//! `schedule.` so scheduled traffic cannot be injected into connection
//! conduits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::{ChannelRegistry, ConduitReceiver};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the registry conduit the scheduler consumes.
pub const CONTROL_CHANNEL: &str = "schedule";

const REPLY_PREFIX: &str = "schedule.";

const BASE_KEYS: &[&str] = &["method", "id", "trigger", "reply_channel", "reply_args"];
const INTERVAL_ARGS: &[&str] = &["weeks", "days", "hours", "minutes", "seconds"];
const DATE_ARGS: &[&str] = &["run_date"];
const CRON_ARGS: &[&str] = &[
    "second",
    "minute",
    "hour",
    "day",
    "month",
    "day_of_week",
    "year",
];

// Upper bound on the cron scan: one leap year of minutes.
const CRON_SCAN_MINUTES: i64 = 366 * 24 * 60;

// ── Validation ────────────────────────────────────────────────────────────────

/// Why a job-control message was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job control message is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(String),

    #[error("reply channel '{0}' must start with '{REPLY_PREFIX}'")]
    BadReplyChannel(String),

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("argument '{key}' is not valid for trigger '{trigger}'")]
    BadArgument { trigger: &'static str, key: String },

    #[error("run_date '{0}' is not an RFC 3339 timestamp")]
    BadRunDate(String),

    #[error("interval trigger must name a positive period")]
    ZeroInterval,

    #[error("unknown method '{0}'")]
    UnknownMethod(String),
}

/// Field matchers for a cron trigger.  `None` matches every value.
///
/// `day_of_week` counts from Monday = 0, matching the usual scheduler
/// convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronFields {
    pub second: Option<u32>,
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day: Option<u32>,
    pub month: Option<u32>,
    pub day_of_week: Option<u32>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval { period: Duration },
    Date { run_date: DateTime<Utc> },
    Cron(CronFields),
}

/// A validated `add` job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: String,
    pub trigger: Trigger,
    pub reply_channel: String,
    pub reply_args: Value,
}

#[derive(Debug, PartialEq, Eq)]
enum Control {
    Add(JobSpec),
    Remove { id: String },
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, JobError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(JobError::WrongType(key.to_string())),
        None => Err(JobError::MissingField(key)),
    }
}

fn int_arg(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<u64>, JobError> {
    match obj.get(key) {
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| JobError::WrongType(key.to_string())),
        None => Ok(None),
    }
}

/// Checks that every non-base key belongs to the trigger's argument set.
fn check_argument_names(
    obj: &serde_json::Map<String, Value>,
    trigger: &'static str,
    allowed: &[&str],
) -> Result<(), JobError> {
    for key in obj.keys() {
        if !BASE_KEYS.contains(&key.as_str()) && !allowed.contains(&key.as_str()) {
            return Err(JobError::BadArgument {
                trigger,
                key: key.clone(),
            });
        }
    }
    Ok(())
}

fn parse_trigger(obj: &serde_json::Map<String, Value>) -> Result<Trigger, JobError> {
    match require_str(obj, "trigger")? {
        "interval" => {
            check_argument_names(obj, "interval", INTERVAL_ARGS)?;
            let weeks = int_arg(obj, "weeks")?.unwrap_or(0);
            let days = int_arg(obj, "days")?.unwrap_or(0);
            let hours = int_arg(obj, "hours")?.unwrap_or(0);
            let minutes = int_arg(obj, "minutes")?.unwrap_or(0);
            let seconds = int_arg(obj, "seconds")?.unwrap_or(0);
            let total =
                weeks * 604_800 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds;
            if total == 0 {
                return Err(JobError::ZeroInterval);
            }
            Ok(Trigger::Interval {
                period: Duration::from_secs(total),
            })
        }
        "date" => {
            check_argument_names(obj, "date", DATE_ARGS)?;
            let raw = require_str(obj, "run_date")?;
            let run_date = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| JobError::BadRunDate(raw.to_string()))?
                .with_timezone(&Utc);
            Ok(Trigger::Date { run_date })
        }
        "cron" => {
            check_argument_names(obj, "cron", CRON_ARGS)?;
            let fields = CronFields {
                second: int_arg(obj, "second")?.map(|v| v as u32),
                minute: int_arg(obj, "minute")?.map(|v| v as u32),
                hour: int_arg(obj, "hour")?.map(|v| v as u32),
                day: int_arg(obj, "day")?.map(|v| v as u32),
                month: int_arg(obj, "month")?.map(|v| v as u32),
                day_of_week: int_arg(obj, "day_of_week")?.map(|v| v as u32),
                year: int_arg(obj, "year")?.map(|v| v as i32),
            };
            Ok(Trigger::Cron(fields))
        }
        other => Err(JobError::UnknownTrigger(other.to_string())),
    }
}

fn parse_control(msg: &Value) -> Result<Control, JobError> {
    let obj = msg.as_object().ok_or(JobError::NotAnObject)?;
    match require_str(obj, "method")? {
        "add" => {
            let id = require_str(obj, "id")?.to_string();
            let reply_channel = require_str(obj, "reply_channel")?.to_string();
            if !reply_channel.starts_with(REPLY_PREFIX) {
                return Err(JobError::BadReplyChannel(reply_channel));
            }
            let reply_args = obj
                .get("reply_args")
                .cloned()
                .ok_or(JobError::MissingField("reply_args"))?;
            let trigger = parse_trigger(obj)?;
            Ok(Control::Add(JobSpec {
                id,
                trigger,
                reply_channel,
                reply_args,
            }))
        }
        "remove" => Ok(Control::Remove {
            id: require_str(obj, "id")?.to_string(),
        }),
        other => Err(JobError::UnknownMethod(other.to_string())),
    }
}

// ── Cron arithmetic ───────────────────────────────────────────────────────────

fn cron_matches(fields: &CronFields, t: DateTime<Utc>) -> bool {
    fields.minute.map_or(true, |m| t.minute() == m)
        && fields.hour.map_or(true, |h| t.hour() == h)
        && fields.day.map_or(true, |d| t.day() == d)
        && fields.month.map_or(true, |m| t.month() == m)
        && fields
            .day_of_week
            .map_or(true, |d| t.weekday().num_days_from_monday() == d)
        && fields.year.map_or(true, |y| t.year() == y)
}

/// First fire time strictly after `after`, scanning minute by minute with the
/// `second` field applied as an offset into the matched minute.  `None` when
/// nothing matches within a year, for example a fixed year in the past.
pub fn next_cron_fire(fields: &CronFields, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let second = fields.second.unwrap_or(0).min(59);
    let mut candidate = after.with_second(0)?.with_nanosecond(0)?;
    for _ in 0..CRON_SCAN_MINUTES {
        if cron_matches(fields, candidate) {
            let fire_at = candidate + chrono::Duration::seconds(i64::from(second));
            if fire_at > after {
                return Some(fire_at);
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Consumes job-control messages and runs one timer task per live job.
pub struct Scheduler {
    registry: Arc<ChannelRegistry<Value>>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(registry: Arc<ChannelRegistry<Value>>) -> Self {
        Self {
            registry,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes control messages until the conduit closes.
    pub async fn run(self: Arc<Self>, mut control: ConduitReceiver<Value>) {
        info!("scheduler consuming job control messages");
        while let Ok(msg) = control.recv(None).await {
            self.handle(msg).await;
        }
        debug!("scheduler control channel closed");
    }

    /// Applies one control message.  Rejections are logged, never fatal.
    pub async fn handle(&self, msg: Value) {
        match parse_control(&msg) {
            Ok(Control::Add(spec)) => self.add(spec).await,
            Ok(Control::Remove { id }) => self.remove(&id).await,
            Err(err) => warn!("rejected job control message: {err}"),
        }
    }

    async fn add(&self, spec: JobSpec) {
        let id = spec.id.clone();
        info!(job = %id, channel = %spec.reply_channel, "scheduling job");
        let handle = tokio::spawn(run_job(Arc::clone(&self.registry), spec));
        if let Some(old) = self.jobs.lock().await.insert(id.clone(), handle) {
            debug!(job = %id, "replacing existing job");
            old.abort();
        }
    }

    async fn remove(&self, id: &str) {
        match self.jobs.lock().await.remove(id) {
            Some(handle) => {
                handle.abort();
                info!(job = %id, "job removed");
            }
            None => warn!(job = %id, "remove for unknown job"),
        }
    }

    /// Aborts every live job.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for (id, handle) in jobs.drain() {
            debug!(job = %id, "stopping job");
            handle.abort();
        }
    }

    /// Number of live jobs.  Diagnostics and tests.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

async fn run_job(registry: Arc<ChannelRegistry<Value>>, spec: JobSpec) {
    match spec.trigger {
        Trigger::Interval { period } => loop {
            tokio::time::sleep(period).await;
            post(&registry, &spec.reply_channel, spec.reply_args.clone());
        },
        Trigger::Date { run_date } => {
            // A run_date already in the past fires immediately.
            if let Ok(delay) = (run_date - Utc::now()).to_std() {
                tokio::time::sleep(delay).await;
            }
            post(&registry, &spec.reply_channel, spec.reply_args);
        }
        Trigger::Cron(fields) => loop {
            let now = Utc::now();
            let Some(fire_at) = next_cron_fire(&fields, now) else {
                warn!(job = %spec.id, "cron trigger will never fire again");
                return;
            };
            if let Ok(delay) = (fire_at - now).to_std() {
                tokio::time::sleep(delay).await;
            }
            post(&registry, &spec.reply_channel, spec.reply_args.clone());
        },
    }
}

fn post(registry: &ChannelRegistry<Value>, channel: &str, args: Value) {
    if let Err(err) = registry.send(channel, args) {
        warn!(%channel, "failed to post scheduled message: {err}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_interval_job_sums_all_units() {
        let msg = json!({
            "method": "add",
            "id": "tick",
            "trigger": "interval",
            "minutes": 2,
            "seconds": 5,
            "reply_channel": "schedule.tick",
            "reply_args": {"kind": "tick"},
        });

        let control = parse_control(&msg).expect("valid job");
        match control {
            Control::Add(spec) => {
                assert_eq!(spec.id, "tick");
                assert_eq!(
                    spec.trigger,
                    Trigger::Interval {
                        period: Duration::from_secs(125)
                    }
                );
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_reply_channel_without_prefix() {
        let msg = json!({
            "method": "add",
            "id": "bad",
            "trigger": "interval",
            "seconds": 1,
            "reply_channel": "app.sneaky",
            "reply_args": {},
        });

        assert_eq!(
            parse_control(&msg),
            Err(JobError::BadReplyChannel("app.sneaky".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_trigger() {
        let msg = json!({
            "method": "add",
            "id": "bad",
            "trigger": "lunar",
            "reply_channel": "schedule.x",
            "reply_args": {},
        });

        assert_eq!(
            parse_control(&msg),
            Err(JobError::UnknownTrigger("lunar".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_argument_from_other_trigger() {
        // run_date belongs to the date trigger, not interval.
        let msg = json!({
            "method": "add",
            "id": "bad",
            "trigger": "interval",
            "seconds": 1,
            "run_date": "2030-01-01T00:00:00Z",
            "reply_channel": "schedule.x",
            "reply_args": {},
        });

        assert_eq!(
            parse_control(&msg),
            Err(JobError::BadArgument {
                trigger: "interval",
                key: "run_date".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_rejects_string_valued_cron_field() {
        let msg = json!({
            "method": "add",
            "id": "bad",
            "trigger": "cron",
            "minute": "*/5",
            "reply_channel": "schedule.x",
            "reply_args": {},
        });

        assert_eq!(
            parse_control(&msg),
            Err(JobError::WrongType("minute".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_zero_length_interval() {
        let msg = json!({
            "method": "add",
            "id": "bad",
            "trigger": "interval",
            "reply_channel": "schedule.x",
            "reply_args": {},
        });

        assert_eq!(parse_control(&msg), Err(JobError::ZeroInterval));
    }

    #[test]
    fn test_parse_rejects_missing_id_and_unknown_method() {
        let missing_id = json!({
            "method": "add",
            "trigger": "interval",
            "seconds": 1,
            "reply_channel": "schedule.x",
            "reply_args": {},
        });
        assert_eq!(parse_control(&missing_id), Err(JobError::MissingField("id")));

        let bad_method = json!({"method": "pause", "id": "x"});
        assert_eq!(
            parse_control(&bad_method),
            Err(JobError::UnknownMethod("pause".to_string()))
        );
    }

    #[test]
    fn test_parse_date_job_reads_rfc3339() {
        let msg = json!({
            "method": "add",
            "id": "once",
            "trigger": "date",
            "run_date": "2030-06-01T12:00:00Z",
            "reply_channel": "schedule.once",
            "reply_args": 7,
        });

        let control = parse_control(&msg).expect("valid job");
        match control {
            Control::Add(spec) => {
                assert_eq!(
                    spec.trigger,
                    Trigger::Date {
                        run_date: Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()
                    }
                );
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn test_next_cron_fire_picks_next_matching_minute() {
        let fields = CronFields {
            minute: Some(30),
            ..CronFields::default()
        };
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 5, 0).unwrap();

        assert_eq!(
            next_cron_fire(&fields, after),
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_next_cron_fire_applies_second_offset_within_current_minute() {
        let fields = CronFields {
            second: Some(30),
            ..CronFields::default()
        };
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 5, 10).unwrap();

        // Second 30 of the current minute is still ahead of 12:05:10.
        assert_eq!(
            next_cron_fire(&fields, after),
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 12, 5, 30).unwrap())
        );
    }

    #[test]
    fn test_next_cron_fire_honours_day_of_week() {
        // 2026-03-10 is a Tuesday; Monday = 0, so Friday = 4.
        let fields = CronFields {
            day_of_week: Some(4),
            hour: Some(9),
            minute: Some(0),
            ..CronFields::default()
        };
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        assert_eq!(
            next_cron_fire(&fields, after),
            Some(Utc.with_ymd_and_hms(2026, 3, 13, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_cron_fire_returns_none_for_past_year() {
        let fields = CronFields {
            year: Some(2001),
            ..CronFields::default()
        };
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        assert_eq!(next_cron_fire(&fields, after), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_job_posts_reply_args_repeatedly() {
        let registry = Arc::new(ChannelRegistry::<Value>::new());
        let mut reply_rx = registry.register("schedule.tick", 8);
        let scheduler = Scheduler::new(Arc::clone(&registry));

        scheduler
            .handle(json!({
                "method": "add",
                "id": "tick",
                "trigger": "interval",
                "seconds": 10,
                "reply_channel": "schedule.tick",
                "reply_args": {"kind": "tick"},
            }))
            .await;
        assert_eq!(scheduler.job_count().await, 1);

        for _ in 0..2 {
            let msg = reply_rx
                .recv(Some(Duration::from_secs(30)))
                .await
                .expect("scheduled message");
            assert_eq!(msg, json!({"kind": "tick"}));
        }

        scheduler.shutdown().await;
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_the_timer() {
        let registry = Arc::new(ChannelRegistry::<Value>::new());
        let mut reply_rx = registry.register("schedule.gone", 8);
        let scheduler = Scheduler::new(Arc::clone(&registry));

        scheduler
            .handle(json!({
                "method": "add",
                "id": "gone",
                "trigger": "interval",
                "seconds": 60,
                "reply_channel": "schedule.gone",
                "reply_args": 1,
            }))
            .await;
        scheduler.handle(json!({"method": "remove", "id": "gone"})).await;
        assert_eq!(scheduler.job_count().await, 0);

        // No message may arrive after removal.
        let result = reply_rx.recv(Some(Duration::from_secs(120))).await;
        assert!(result.is_err(), "removed job must not fire, got {result:?}");
    }

    #[tokio::test]
    async fn test_rejected_message_spawns_no_job() {
        let registry = Arc::new(ChannelRegistry::<Value>::new());
        let scheduler = Scheduler::new(registry);

        scheduler.handle(json!("not an object")).await;
        scheduler
            .handle(json!({"method": "add", "id": "x", "trigger": "nope",
                           "reply_channel": "schedule.x", "reply_args": {}}))
            .await;

        assert_eq!(scheduler.job_count().await, 0);
    }
}
