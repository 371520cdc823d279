//! Time-triggered outbound messages.
//!
//! Each enabled job runs on its own task: compute the next slot after "now"
//! in the configured timezone, sleep until then, fire. Slots missed while the
//! process was down are never fired retroactively, and the cursor advances
//! past every fired slot so no slot fires twice.
//!
//! A firing renders the job template and hands one message per destination
//! to the [`MessageSink`] (the dispatcher) on a separate task, so a slow send
//! never delays the job's next slot or any other job.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use meshbot_core::{Destination, MessageSink, OutboundMessage, Origin, render_template};

use crate::config::{
    ConfigError, ConfigResult, HeartbeatConfig, HeartbeatMode, MeshConfig, ScheduleItemConfig,
};

// =============================================================================
// Parsing
// =============================================================================

/// Parses an IANA timezone name.
pub fn parse_timezone(name: &str) -> ConfigResult<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::validation(format!("unknown timezone '{name}'")))
}

/// Parses `HH:MM` (24h).
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let (h, m) = raw.trim().split_once(':')?;
    let (h, m) = (h.parse().ok()?, m.parse().ok()?);
    NaiveTime::from_hms_opt(h, m, 0)
}

/// Parses a weekday by its first three letters (`mon`, `Monday`, ...).
pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    let key: String = raw.trim().to_lowercase().chars().take(3).collect();
    match key.as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Parses a 6 field (with seconds) or 5 field cron expression.
///
/// Five fields get a zero seconds field and a wildcard year.
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let expr = expr.trim();
    Schedule::from_str(expr).or_else(|_| Schedule::from_str(&format!("0 {expr} *")))
}

// =============================================================================
// Triggers
// =============================================================================

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every day at a local time, optionally only on some weekdays.
    Daily {
        /// Local time of day.
        at: NaiveTime,
        /// Allowed weekdays; empty means all.
        days: Vec<Weekday>,
    },
    /// A cron schedule evaluated in local time.
    Cron(Box<Schedule>),
    /// A fixed interval.
    Every(Duration),
}

impl Trigger {
    /// The first slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Daily { at, days } => {
                let today = after.with_timezone(&tz).date_naive();
                (0..=7)
                    .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
                    .filter(|date| days.is_empty() || days.contains(&date.weekday()))
                    .filter_map(|date| tz.from_local_datetime(&date.and_time(*at)).earliest())
                    .map(|local| local.with_timezone(&Utc))
                    .find(|slot| *slot > after)
            }
            Self::Cron(schedule) => schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|slot| slot.with_timezone(&Utc)),
            Self::Every(interval) => TimeDelta::from_std(*interval)
                .ok()
                .filter(|d| *d > TimeDelta::zero())
                .map(|d| after + d),
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A configured job, ready to run.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// Name for logs and `{job}`.
    pub name: String,
    /// When it fires.
    pub trigger: Trigger,
    /// Message template.
    pub template: String,
    /// Where each firing is sent.
    pub destinations: Vec<Destination>,
    /// Channel index.
    pub channel: u32,
    /// Radio node to send through.
    pub node: Option<String>,
}

impl ScheduledJob {
    /// Builds a job from a `[[schedules.items]]` entry. `index` names unnamed jobs.
    pub fn from_item(index: usize, item: &ScheduleItemConfig) -> ConfigResult<Self> {
        let name = match item.name.trim() {
            "" => format!("job{}", index + 1),
            name => name.to_string(),
        };
        let invalid = |reason: String| ConfigError::invalid_schedule(&name, reason);

        let trigger = if let Some(expr) = item.cron.as_deref() {
            let schedule =
                parse_cron(expr).map_err(|e| invalid(format!("invalid cron '{expr}': {e}")))?;
            Trigger::Cron(Box::new(schedule))
        } else if let Some(secs) = item.every_seconds {
            if secs == 0 {
                return Err(invalid("every_seconds must be greater than 0".into()));
            }
            Trigger::Every(Duration::from_secs(secs))
        } else {
            let at = parse_time(&item.time)
                .ok_or_else(|| invalid(format!("invalid time '{}', expected HH:MM", item.time)))?;
            let days = item
                .days
                .iter()
                .map(|d| parse_weekday(d).ok_or_else(|| invalid(format!("unknown weekday '{d}'"))))
                .collect::<ConfigResult<Vec<_>>>()?;
            Trigger::Daily { at, days }
        };

        if item.text.trim().is_empty() {
            return Err(invalid("text is empty".into()));
        }

        Ok(Self {
            trigger,
            template: item.text.clone(),
            destinations: item
                .destinations()
                .iter()
                .map(|d| Destination::parse(d))
                .collect(),
            channel: item.channel,
            node: non_empty(item.node.as_deref()),
            name,
        })
    }

    /// The heartbeat as an interval job, or `None` when disabled.
    pub fn heartbeat(config: &HeartbeatConfig) -> ConfigResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        if config.interval_seconds == 0 {
            return Err(ConfigError::invalid_schedule(
                "heartbeat",
                "interval_seconds must be greater than 0",
            ));
        }
        let destinations = match config.mode {
            HeartbeatMode::Broadcast => vec![Destination::Broadcast],
            HeartbeatMode::Dm => config
                .targets
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(Destination::parse)
                .collect(),
        };
        let template = match config.message.trim() {
            "" => HeartbeatConfig::default().message,
            message => message.to_string(),
        };
        Ok(Some(Self {
            name: "heartbeat".to_string(),
            trigger: Trigger::Every(Duration::from_secs(config.interval_seconds)),
            template,
            destinations,
            channel: config.channel,
            node: non_empty(config.node.as_deref()),
        }))
    }

    /// Messages for a firing at local time `at`.
    pub fn messages(&self, at: &DateTime<Tz>) -> Vec<OutboundMessage> {
        let text = render_job_text(&self.template, &self.name, at);
        self.destinations
            .iter()
            .map(|target| OutboundMessage {
                target: target.clone(),
                channel: self.channel,
                text: text.clone(),
                node: self.node.clone(),
            })
            .collect()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Renders `{date}`, `{time}`, `{weekday}` and `{job}`.
pub fn render_job_text(template: &str, job: &str, at: &DateTime<Tz>) -> String {
    let date = at.format("%Y-%m-%d").to_string();
    let time = at.format("%H:%M").to_string();
    let weekday = at.format("%A").to_string();
    render_template(
        template,
        &[("date", &date), ("time", &time), ("weekday", &weekday), ("job", job)],
    )
}

/// Builds every job the configuration enables: schedule items when
/// `schedules.enabled`, plus the heartbeat.
pub fn jobs_from_config(config: &MeshConfig) -> ConfigResult<Vec<ScheduledJob>> {
    let mut jobs = Vec::new();
    if config.schedules.enabled {
        for (idx, item) in config.schedules.items.iter().enumerate() {
            if item.enabled {
                jobs.push(ScheduledJob::from_item(idx, item)?);
            }
        }
    }
    if let Some(heartbeat) = ScheduledJob::heartbeat(&config.heartbeat)? {
        jobs.push(heartbeat);
    }
    Ok(jobs)
}

// =============================================================================
// Scheduler
// =============================================================================

/// Runs scheduled jobs against a message sink.
pub struct Scheduler {
    jobs: Vec<Arc<ScheduledJob>>,
    tz: Tz,
    sink: Arc<dyn MessageSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Creates a scheduler. Nothing runs until [`Scheduler::start`].
    pub fn new(jobs: Vec<ScheduledJob>, tz: Tz, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            jobs: jobs.into_iter().map(Arc::new).collect(),
            tz,
            sink,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Creates a scheduler for the configured jobs and timezone.
    pub fn from_config(config: &MeshConfig, sink: Arc<dyn MessageSink>) -> ConfigResult<Self> {
        let tz = parse_timezone(&config.schedules.timezone)?;
        Ok(Self::new(jobs_from_config(config)?, tz, sink))
    }

    /// Number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// `true` when there is nothing to schedule.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Spawns one task per job.
    pub fn start(&self) {
        for job in &self.jobs {
            let span = info_span!("job", job = %job.name);
            self.tracker.spawn(
                run_job(
                    Arc::clone(job),
                    self.tz,
                    Arc::clone(&self.sink),
                    self.cancel.clone(),
                    self.tracker.clone(),
                )
                .instrument(span),
            );
        }
        info!(jobs = self.jobs.len(), timezone = %self.tz, "Scheduler started");
    }

    /// Cancels every job and waits for firings already in progress.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

async fn run_job(
    job: Arc<ScheduledJob>,
    tz: Tz,
    sink: Arc<dyn MessageSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut cursor = Utc::now();
    loop {
        let Some(slot) = job.trigger.next_after(cursor, tz) else {
            warn!("Job has no future slot, stopping it");
            return;
        };
        debug!(next = %slot.with_timezone(&tz), "Next slot");

        let wait = (slot - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let local = slot.with_timezone(&tz);
        for message in job.messages(&local) {
            let sink = Arc::clone(&sink);
            let name = job.name.clone();
            tracker.spawn(async move {
                let result = sink.deliver(message, Origin::Scheduler).await;
                if result.is_ok() {
                    debug!(job = %name, parts = result.parts, "Scheduled message sent");
                } else {
                    warn!(job = %name, error = ?result.error, "Scheduled message failed");
                }
            });
        }
        info!(slot = %local, "Job fired");

        cursor = slot.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshbot_core::SendResult;
    use parking_lot::Mutex;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn berlin() -> Tz {
        parse_timezone("Europe/Berlin").unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(OutboundMessage, Origin)>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn deliver(&self, message: OutboundMessage, origin: Origin) -> SendResult {
            self.sent.lock().push((message, origin));
            SendResult {
                status: meshbot_core::SendStatus::Sent,
                message_id: None,
                parts: 1,
                error: None,
            }
        }
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_time("08:05"), NaiveTime::from_hms_opt(8, 5, 0));
        assert_eq!(parse_time("24:00"), None);
        assert_eq!(parse_time("8"), None);
        assert_eq!(parse_weekday("Monday"), Some(Weekday::Mon));
        assert_eq!(parse_weekday("so"), None);
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("nope").is_err());
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn test_daily_uses_local_time() {
        // 2024-05-06 is a Monday; Berlin is UTC+2 in May.
        let trigger = Trigger::Daily {
            at: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            days: vec![],
        };
        let next = trigger.next_after(utc("2024-05-06T05:00:00Z"), berlin()).unwrap();
        assert_eq!(next, utc("2024-05-06T06:00:00Z"));

        // Already past today's slot: tomorrow.
        let next = trigger.next_after(utc("2024-05-06T06:00:00Z"), berlin()).unwrap();
        assert_eq!(next, utc("2024-05-07T06:00:00Z"));
    }

    #[test]
    fn test_daily_respects_weekdays() {
        let trigger = Trigger::Daily {
            at: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            days: vec![Weekday::Fri],
        };
        let next = trigger.next_after(utc("2024-05-06T05:00:00Z"), berlin()).unwrap();
        assert_eq!(next, utc("2024-05-10T06:00:00Z"));

        // Friday after the slot: next Friday.
        let next = trigger.next_after(utc("2024-05-10T07:00:00Z"), berlin()).unwrap();
        assert_eq!(next, utc("2024-05-17T06:00:00Z"));
    }

    #[test]
    fn test_cron_in_timezone() {
        let trigger = Trigger::Cron(Box::new(parse_cron("30 9 * * *").unwrap()));
        let next = trigger.next_after(utc("2024-01-15T00:00:00Z"), berlin()).unwrap();
        // Berlin is UTC+1 in January.
        assert_eq!(next, utc("2024-01-15T08:30:00Z"));
    }

    #[test]
    fn test_every_is_relative() {
        let trigger = Trigger::Every(Duration::from_secs(300));
        let now = utc("2024-01-15T00:00:00Z");
        assert_eq!(trigger.next_after(now, berlin()), Some(utc("2024-01-15T00:05:00Z")));
        assert_eq!(Trigger::Every(Duration::ZERO).next_after(now, berlin()), None);
    }

    #[test]
    fn test_job_from_item() {
        let item = ScheduleItemConfig {
            time: "07:30".into(),
            days: vec!["sat".into(), "Sunday".into()],
            targets: vec!["!a".into(), "^all".into()],
            channel: 2,
            text: "{job}: {weekday} {date} {time}".into(),
            ..ScheduleItemConfig::default()
        };
        let job = ScheduledJob::from_item(0, &item).unwrap();
        assert_eq!(job.name, "job1");
        assert!(matches!(job.trigger, Trigger::Daily { ref days, .. } if days.len() == 2));

        let at = berlin().with_ymd_and_hms(2024, 5, 11, 7, 30, 0).unwrap();
        let messages = job.messages(&at);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].target, Destination::Node("!a".into()));
        assert_eq!(messages[1].target, Destination::Broadcast);
        assert_eq!(messages[0].channel, 2);
        assert_eq!(messages[0].text, "job1: Saturday 2024-05-11 07:30");
    }

    #[test]
    fn test_invalid_items_are_rejected() {
        let bad_day = ScheduleItemConfig {
            name: "x".into(),
            time: "07:30".into(),
            days: vec!["someday".into()],
            text: "t".into(),
            ..ScheduleItemConfig::default()
        };
        assert!(matches!(
            ScheduledJob::from_item(0, &bad_day),
            Err(ConfigError::InvalidSchedule { .. })
        ));

        let bad_cron = ScheduleItemConfig {
            cron: Some("61 * * * *".into()),
            text: "t".into(),
            ..ScheduleItemConfig::default()
        };
        assert!(ScheduledJob::from_item(0, &bad_cron).is_err());

        let bad_time = ScheduleItemConfig {
            time: "7 o'clock".into(),
            text: "t".into(),
            ..ScheduleItemConfig::default()
        };
        assert!(ScheduledJob::from_item(0, &bad_time).is_err());
    }

    #[test]
    fn test_heartbeat_job() {
        assert!(ScheduledJob::heartbeat(&HeartbeatConfig::default()).unwrap().is_none());

        let config = HeartbeatConfig {
            enabled: true,
            mode: HeartbeatMode::Dm,
            targets: vec!["!a".into(), " ".into(), "!b".into()],
            ..HeartbeatConfig::default()
        };
        let job = ScheduledJob::heartbeat(&config).unwrap().unwrap();
        assert_eq!(job.destinations.len(), 2);
        assert!(matches!(job.trigger, Trigger::Every(d) if d == Duration::from_secs(300)));

        let zero = HeartbeatConfig {
            enabled: true,
            interval_seconds: 0,
            ..HeartbeatConfig::default()
        };
        assert!(ScheduledJob::heartbeat(&zero).is_err());
    }

    #[tokio::test]
    async fn test_jobs_fire_independently_until_shutdown() {
        let job = |name: &str, channel| ScheduledJob {
            name: name.to_string(),
            trigger: Trigger::Every(Duration::from_millis(40)),
            template: "{job}".to_string(),
            destinations: vec![Destination::Broadcast],
            channel,
            node: None,
        };
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(vec![job("a", 1), job("b", 2)], berlin(), sink.clone());
        assert_eq!(scheduler.len(), 2);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown().await;

        let sent = sink.sent.lock().clone();
        let count = |text: &str| sent.iter().filter(|(m, _)| m.text == text).count();
        assert!(count("a") >= 2, "{sent:?}");
        assert!(count("b") >= 2, "{sent:?}");
        assert!(sent.iter().all(|(_, origin)| *origin == Origin::Scheduler));

        let after = sent.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.sent.lock().len(), after);
    }

    #[derive(Default)]
    struct MockRadio {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl meshbot_core::RadioTransport for MockRadio {
        fn name(&self) -> &str {
            "mock"
        }

        async fn send(
            &self,
            message: &OutboundMessage,
        ) -> meshbot_core::TransportResult<meshbot_core::SendReceipt> {
            self.sent.lock().push(message.clone());
            Ok(meshbot_core::SendReceipt::sent(None))
        }
    }

    #[tokio::test]
    async fn test_simultaneous_jobs_store_one_row_each() {
        use meshbot_core::{ConversationId, Direction, SharedStore, Store};
        use meshbot_framework::{DispatchSettings, Dispatcher};
        use meshbot_store::{SqliteStore, StoreOptions};

        let store: SharedStore =
            Arc::new(SqliteStore::open_in_memory(StoreOptions::default()).unwrap());
        let radio = Arc::new(MockRadio::default());
        let dispatcher = Arc::new(
            Dispatcher::builder(Arc::clone(&store), radio.clone())
                .settings(DispatchSettings {
                    part_delay: Duration::ZERO,
                    ..DispatchSettings::default()
                })
                .build(),
        );

        // Same interval, so both jobs share every slot. The window below
        // covers exactly one slot.
        let job = |name: &str, destination| ScheduledJob {
            name: name.to_string(),
            trigger: Trigger::Every(Duration::from_millis(400)),
            template: "{job} fired".to_string(),
            destinations: vec![destination],
            channel: 1,
            node: None,
        };
        let scheduler = Scheduler::new(
            vec![
                job("channel", Destination::Broadcast),
                job("direct", Destination::Node("!peer".into())),
            ],
            berlin(),
            dispatcher.clone(),
        );

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(600)).await;
        scheduler.shutdown().await;

        assert_eq!(radio.sent.lock().len(), 2);

        let channel = store.read_history(&ConversationId::Channel(1), 10).await.unwrap();
        assert_eq!(channel.len(), 1);
        assert_eq!(channel[0].direction, Direction::Out);
        assert_eq!(channel[0].body, "channel fired");

        let direct = store
            .read_history(&ConversationId::Direct("!peer".into()), 10)
            .await
            .unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].direction, Direction::Out);
        assert_eq!(direct[0].body, "direct fired");

        dispatcher.shutdown().await;
    }
}
