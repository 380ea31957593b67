use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;

use crate::config::{parse_daily_at, parse_human_duration, TriggerConfig};
use crate::error::{KeeperError, Result};

/// A timing rule: when should the task fire next?
pub trait Trigger: Send + Sync + fmt::Display {
    /// First firing time strictly after `now`, before jitter.
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Fires every fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    every: Duration,
}

impl Interval {
    pub fn new(every: Duration) -> Self {
        Self { every }
    }
}

impl Trigger for Interval {
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.every)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {}s", self.every.as_secs())
    }
}

/// Fires once a day at a UTC wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct DailyAt {
    at: NaiveTime,
}

impl DailyAt {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| KeeperError::Config(format!("invalid time {hour:02}:{minute:02}")))?;
        Ok(Self { at })
    }
}

impl Trigger for DailyAt {
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }
}

impl fmt::Display for DailyAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daily at {} UTC", self.at.format("%H:%M"))
    }
}

/// A configured trigger plus its firing options.
pub struct Timer {
    pub trigger: Box<dyn Trigger>,
    pub jitter_seconds: u64,
    pub run_on_start: bool,
}

impl Timer {
    pub fn from_config(config: &TriggerConfig) -> Result<Self> {
        let trigger: Box<dyn Trigger> = match (&config.every, &config.daily_at) {
            (Some(every), None) => Box::new(Interval::new(parse_human_duration(every)?)),
            (None, Some(at)) => {
                let (hour, minute) = parse_daily_at(at)?;
                Box::new(DailyAt::new(hour, minute)?)
            }
            _ => {
                return Err(KeeperError::Config(
                    "a trigger needs exactly one of 'every' or 'daily_at'".into(),
                ))
            }
        };
        Ok(Self {
            trigger,
            jitter_seconds: config.jitter_seconds,
            run_on_start: config.run_on_start,
        })
    }

    /// How long to sleep from `now` until the next firing, jitter included.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        let next = self.trigger.next_after(now);
        (next - now).to_std().unwrap_or(Duration::ZERO) + random_jitter(self.jitter_seconds)
    }
}

pub fn random_jitter(jitter_seconds: u64) -> Duration {
    if jitter_seconds == 0 {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0..=jitter_seconds);
    Duration::from_secs(secs)
}
