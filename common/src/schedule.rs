// Schedule parsing and due-time evaluation
//
// Every FrequencyRule compiles to a five-field expression
// (minute hour day-of-month month day-of-week). Due checks are evaluated at
// minute granularity in one fixed reference timezone; occurrence search for
// `next_due_after` is delegated to the `cron` crate.

use crate::errors::ScheduleError;
use crate::models::{Constraints, FrequencyRule, TimeOfDay};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Upper bound on candidates inspected when constraints filter occurrences
const MAX_OCCURRENCE_SCAN: usize = 100_000;

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    const ALL: [FieldKind; 5] = [
        FieldKind::Minute,
        FieldKind::Hour,
        FieldKind::DayOfMonth,
        FieldKind::Month,
        FieldKind::DayOfWeek,
    ];

    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }

    /// Accepted literal range
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            // 7 is accepted as an alias for Sunday
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    /// Range covered by `*` and `*/N`
    fn span(self) -> (u32, u32) {
        match self {
            FieldKind::DayOfWeek => (0, 6),
            other => other.bounds(),
        }
    }
}

/// One parsed field stored as a bitmask of matching values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    wildcard: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64u32).filter(move |v| self.contains(*v))
    }

    fn parse(token: &str, kind: FieldKind) -> Result<Self, String> {
        let (min, max) = kind.bounds();
        let (span_min, span_max) = kind.span();

        if token == "*" {
            return Ok(Field {
                bits: range_bits(span_min, span_max, 1),
                wildcard: true,
            });
        }

        if let Some(step) = token.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("{} step '{}' is not a number", kind.name(), step))?;
            if step == 0 {
                return Err(format!("{} step must be at least 1", kind.name()));
            }
            return Ok(Field {
                bits: range_bits(span_min, span_max, step),
                wildcard: false,
            });
        }

        let mut bits = 0u64;
        for item in token.split(',') {
            if item.is_empty() {
                return Err(format!("empty entry in {} list '{}'", kind.name(), token));
            }
            let value: u32 = item
                .parse()
                .map_err(|_| format!("{} value '{}' is not a number", kind.name(), item))?;
            if value < min || value > max {
                return Err(format!(
                    "{} {} out of range {}-{}",
                    kind.name(),
                    value,
                    min,
                    max
                ));
            }
            let value = match kind {
                FieldKind::DayOfWeek if value == 7 => 0,
                _ => value,
            };
            bits |= 1u64 << value;
        }

        Ok(Field {
            bits,
            wildcard: false,
        })
    }

    /// Render for the `cron` crate (seconds-first, Sunday-by-name dialect)
    fn render(&self, kind: FieldKind) -> String {
        if self.wildcard {
            return "*".to_string();
        }
        let items: Vec<String> = match kind {
            FieldKind::DayOfWeek => self
                .values()
                .map(|v| DAY_NAMES[v as usize].to_string())
                .collect(),
            _ => self.values().map(|v| v.to_string()).collect(),
        };
        items.join(",")
    }
}

fn range_bits(min: u32, max: u32, step: u32) -> u64 {
    (min..=max)
        .step_by(step as usize)
        .fold(0u64, |acc, v| acc | (1u64 << v))
}

/// A validated five-field expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpression {
    /// Parse and validate a five-field expression.
    ///
    /// Each field accepts `*`, a literal, a comma list of literals or `*/N`.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        if tokens.len() != 5 {
            return Err(ScheduleError::invalid_expression(
                expression,
                format!("expected 5 fields, found {}", tokens.len()),
            ));
        }

        let mut fields = [Field {
            bits: 0,
            wildcard: false,
        }; 5];
        for (slot, (token, kind)) in tokens.iter().zip(FieldKind::ALL).enumerate() {
            fields[slot] = Field::parse(token, kind)
                .map_err(|reason| ScheduleError::invalid_expression(expression, reason))?;
        }

        Ok(Self {
            source: tokens.join(" "),
            minute: fields[0],
            hour: fields[1],
            day_of_month: fields[2],
            month: fields[3],
            day_of_week: fields[4],
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Does the minute containing `local` match this expression
    pub fn matches<Z: TimeZone>(&self, local: &DateTime<Z>) -> bool {
        if !self.minute.contains(local.minute())
            || !self.hour.contains(local.hour())
            || !self.month.contains(local.month())
        {
            return false;
        }

        let dom = self.day_of_month.contains(local.day());
        let dow = self
            .day_of_week
            .contains(local.weekday().num_days_from_sunday());

        // Classic cron: when both day fields are restricted either may match
        if self.day_of_month.wildcard || self.day_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Occurrence schedules for the `cron` crate. Restricting both day fields
    /// yields two alternatives whose union is the expression.
    fn occurrence_schedules(&self) -> Result<Vec<CronSchedule>, ScheduleError> {
        let minute = self.minute.render(FieldKind::Minute);
        let hour = self.hour.render(FieldKind::Hour);
        let month = self.month.render(FieldKind::Month);
        let dom = self.day_of_month.render(FieldKind::DayOfMonth);
        let dow = self.day_of_week.render(FieldKind::DayOfWeek);

        let day_pairs = if !self.day_of_month.wildcard && !self.day_of_week.wildcard {
            vec![(dom, "*".to_string()), ("*".to_string(), dow)]
        } else {
            vec![(dom, dow)]
        };

        day_pairs
            .into_iter()
            .map(|(dom, dow)| {
                let rendered = format!("0 {} {} {} {} {}", minute, hour, dom, month, dow);
                CronSchedule::from_str(&rendered).map_err(|e| {
                    ScheduleError::invalid_expression(self.source.clone(), e.to_string())
                })
            })
            .collect()
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FrequencyRule {
    /// The five-field expression equivalent to this rule
    pub fn expression(&self) -> Result<String, ScheduleError> {
        let expression = match self {
            FrequencyRule::EveryMinute => "* * * * *".to_string(),
            FrequencyRule::EveryMinutes { interval } => {
                if !(1..=59).contains(interval) {
                    return Err(ScheduleError::invalid_expression(
                        format!("every {} minutes", interval),
                        "interval must be between 1 and 59 minutes",
                    ));
                }
                if *interval == 1 {
                    "* * * * *".to_string()
                } else {
                    format!("*/{} * * * *", interval)
                }
            }
            FrequencyRule::Hourly { minute } => format!("{} * * * *", minute),
            FrequencyRule::DailyAt { time } => at_time(time, "* * *"),
            FrequencyRule::TwiceDaily {
                first_hour,
                second_hour,
                minute,
            } => format!("{} {},{} * * *", minute, first_hour, second_hour),
            FrequencyRule::WeeklyOn { weekday, time } => {
                at_time(time, &format!("* * {}", weekday.num_days_from_sunday()))
            }
            FrequencyRule::MonthlyOn { day, time } => at_time(time, &format!("{} * *", day)),
            FrequencyRule::Quarterly => "0 0 1 1,4,7,10 *".to_string(),
            FrequencyRule::Yearly => "0 0 1 1 *".to_string(),
            FrequencyRule::Cron { expression } => expression.clone(),
        };
        Ok(expression)
    }

    /// Compile to a validated expression
    pub fn compile(&self) -> Result<CronExpression, ScheduleError> {
        CronExpression::parse(&self.expression()?)
    }
}

fn at_time(time: &TimeOfDay, rest: &str) -> String {
    format!("{} {} {}", time.minute(), time.hour(), rest)
}

/// Drop seconds and sub-second precision
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    let seconds = instant.timestamp().div_euclid(60) * 60;
    Utc.timestamp_opt(seconds, 0).single().unwrap_or(instant)
}

/// Check the time-of-day and weekday constraints against a local instant
pub fn constraints_allow(constraints: &Constraints, local: &DateTime<Tz>) -> bool {
    let time = match TimeOfDay::new(local.hour(), local.minute()) {
        Ok(time) => time,
        Err(_) => return false,
    };

    if let Some(window) = &constraints.between {
        if !window.contains(time) {
            return false;
        }
    }
    if let Some(window) = &constraints.unless_between {
        if window.contains(time) {
            return false;
        }
    }
    if let Some(days) = &constraints.days {
        if !days.allows(local.weekday()) {
            return false;
        }
    }
    true
}

/// ScheduleTrigger decides due-ness and upcoming occurrences
pub trait ScheduleTrigger {
    /// Is the task due during the minute containing `now`
    fn is_due(&self, now: DateTime<Utc>, timezone: Tz) -> bool;

    /// First due minute strictly after `after`
    fn next_due_after(&self, after: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>>;
}

/// A compiled frequency rule together with its constraints
#[derive(Debug, Clone)]
pub struct CompiledSchedule {
    expression: CronExpression,
    constraints: Constraints,
    occurrences: Vec<CronSchedule>,
}

impl CompiledSchedule {
    pub fn new(rule: &FrequencyRule, constraints: &Constraints) -> Result<Self, ScheduleError> {
        let expression = rule.compile()?;
        let occurrences = expression.occurrence_schedules()?;
        Ok(Self {
            expression,
            constraints: constraints.clone(),
            occurrences,
        })
    }

    pub fn expression(&self) -> &CronExpression {
        &self.expression
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }
}

impl ScheduleTrigger for CompiledSchedule {
    fn is_due(&self, now: DateTime<Utc>, timezone: Tz) -> bool {
        let local = truncate_to_minute(now).with_timezone(&timezone);
        self.expression.matches(&local) && constraints_allow(&self.constraints, &local)
    }

    fn next_due_after(&self, after: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
        let reference = after.with_timezone(&timezone);
        self.occurrences
            .iter()
            .filter_map(|schedule| {
                schedule
                    .after(&reference)
                    .take(MAX_OCCURRENCE_SCAN)
                    .find(|candidate| constraints_allow(&self.constraints, candidate))
            })
            .min()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// Resolve an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| {
        ScheduleError::InvalidDefinition(format!("unknown timezone '{}'", name))
    })
}

/// Reference timezone used when none is configured
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}
