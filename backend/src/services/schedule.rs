//! Schedule evaluation.
//!
//! Every schedule kind is compiled to a cron schedule evaluated in the
//! policy's timezone: hourly fires at minute 0, daily at `run_hour`, weekly
//! at `run_hour` on `run_weekday`. A schedule is due at `now` when one of
//! its occurrences falls in `[now - window, now)` and is later than the last
//! recorded fire.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{AppError, Result};
use crate::models::policy::{BackupPolicy, ScheduleKind};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Upper bound for `next_n` previews.
pub const MAX_PREVIEW: usize = 50;

/// A policy schedule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledSchedule {
    schedule: Schedule,
    timezone: Tz,
    expression: String,
}

impl CompiledSchedule {
    /// Compile the schedule of `policy`.
    pub fn from_policy(policy: &BackupPolicy) -> Result<Self> {
        let timezone = parse_timezone(&policy.timezone)?;
        let expression = match policy.schedule {
            ScheduleKind::Hourly => "0 0 * * * *".to_string(),
            ScheduleKind::Daily => format!("0 0 {} * * *", checked_hour(policy.run_hour)?),
            ScheduleKind::Weekly => format!(
                "0 0 {} * * {}",
                checked_hour(policy.run_hour)?,
                weekday_name(policy.run_weekday)?
            ),
            ScheduleKind::Cron => {
                let raw = policy.cron_expression.as_deref().ok_or_else(|| {
                    AppError::Validation("cron schedule requires a cron expression".into())
                })?;
                normalize_cron(raw)?
            }
        };

        let schedule = Schedule::from_str(&expression).map_err(|e| {
            AppError::Validation(format!("invalid cron expression '{}': {}", expression, e))
        })?;

        Ok(Self {
            schedule,
            timezone,
            expression,
        })
    }

    /// The six/seven field expression actually evaluated.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Most recent occurrence in `[now - window, now)`.
    pub fn latest_in_window(&self, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        let window = chrono::Duration::from_std(window).ok()?;
        let start = now - window;
        // `after` is exclusive; back off one second so an occurrence exactly
        // at the window start is included.
        let search_from = (start - chrono::Duration::seconds(1)).with_timezone(&self.timezone);

        self.schedule
            .after(&search_from)
            .map(|o| o.with_timezone(&Utc))
            .skip_while(|o| *o < start)
            .take_while(|o| *o < now)
            .last()
    }

    /// Whether the schedule is due at `now`.
    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        last_fire: Option<DateTime<Utc>>,
        window: Duration,
    ) -> bool {
        match self.latest_in_window(now, window) {
            Some(occurrence) => last_fire.map_or(true, |last| last < occurrence),
            None => false,
        }
    }

    /// The next `n` occurrences strictly after `from`.
    pub fn next_n(&self, from: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .take(n.min(MAX_PREVIEW))
            .map(|o| o.with_timezone(&Utc))
            .collect()
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| AppError::Validation(format!("unknown timezone '{}'", name)))
}

fn checked_hour(hour: i32) -> Result<i32> {
    if !(0..=23).contains(&hour) {
        return Err(AppError::Validation(format!(
            "run_hour must be between 0 and 23, got {}",
            hour
        )));
    }
    Ok(hour)
}

fn weekday_name(day: i32) -> Result<&'static str> {
    if !(0..=6).contains(&day) {
        return Err(AppError::Validation(format!(
            "run_weekday must be between 0 (Sunday) and 6 (Saturday), got {}",
            day
        )));
    }
    Ok(WEEKDAYS[day as usize])
}

/// Accept classic five-field cron (minute hour dom month dow, Sunday = 0)
/// as well as six/seven-field expressions with seconds.
pub fn normalize_cron(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = unix_weekdays_to_names(fields[4])?;
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        n => {
            return Err(AppError::Validation(format!(
                "cron expression '{}' has {} fields, expected 5, 6 or 7",
                expression.trim(),
                n
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| {
        AppError::Validation(format!("invalid cron expression '{}': {}", expression.trim(), e))
    })?;
    Ok(normalized)
}

/// Rewrite numeric day-of-week values (0-7, Sunday = 0 or 7) as names so they
/// are not read with a different numbering. Ranges ending on 7 wrap to
/// Sunday, which named ranges cannot express directly.
fn unix_weekdays_to_names(field: &str) -> Result<String> {
    let day = |token: &str| -> Result<Option<usize>> {
        match token.parse::<usize>() {
            Ok(n) if n < WEEKDAYS.len() => Ok(Some(n)),
            Ok(n) => Err(AppError::Validation(format!(
                "day-of-week {} is out of range (0-7)",
                n
            ))),
            Err(_) => Ok(None),
        }
    };
    let name = |token: &str| -> Result<String> {
        Ok(match day(token)? {
            Some(n) => WEEKDAYS[n].to_string(),
            None => token.to_string(),
        })
    };

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        if let Some((start, end)) = range.split_once('-') {
            if let (Some(start), Some(7)) = (day(start)?, day(end)?) {
                parts.push(wrap_to_sunday(start, step)?);
                continue;
            }
        }

        let range = range
            .split('-')
            .map(name)
            .collect::<Result<Vec<_>>>()?
            .join("-");
        parts.push(match step {
            Some(step) => format!("{}/{}", range, step),
            None => range,
        });
    }
    Ok(parts.join(","))
}

/// `start-7[/step]` as an explicit list of day names.
fn wrap_to_sunday(start: usize, step: Option<&str>) -> Result<String> {
    let step = match step {
        Some(step) => step
            .parse::<usize>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| AppError::Validation(format!("invalid day-of-week step '{}'", step)))?,
        None => 1,
    };
    let mut days: Vec<usize> = (start..=7).step_by(step).map(|d| d % 7).collect();
    days.sort_unstable();
    days.dedup();
    Ok(days
        .into_iter()
        .map(|d| WEEKDAYS[d])
        .collect::<Vec<_>>()
        .join(","))
}
