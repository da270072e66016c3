//! Cron rule parsing.
//!
//! Five fields are `min hour dom month dow` (seconds implied `{0}`); six
//! fields prepend a seconds field. Each field accepts `*`, `*/step`,
//! comma-separated values, ranges `a-b` and stepped ranges `a-b/step`.
//! Rules are pre-validated with a regex before field parsing so a malformed
//! rule fails registration without partial effects.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Local, Timelike};
use regex::Regex;

use crate::error::CronError;

const FIELDS: [(&str, u32, u32); 6] = [
    ("second", 0, 59),
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 6),
];

fn rule_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let item = r"(\*|\d{1,2}(-\d{1,2})?)(/\d{1,2})?";
        let field = format!(r"{item}(,{item})*");
        Regex::new(&format!(r"^\s*{field}(\s+{field}){{4,5}}\s*$")).expect("static cron regex")
    })
}

/// The expanded value sets of one rule. All calendar fields must match for
/// a minute to be eligible; the seconds set picks the offsets inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub seconds: BTreeSet<u32>,
    pub minutes: BTreeSet<u32>,
    pub hours: BTreeSet<u32>,
    pub days_of_month: BTreeSet<u32>,
    pub months: BTreeSet<u32>,
    pub days_of_week: BTreeSet<u32>,
}

impl Schedule {
    pub fn parse(rule: &str) -> Result<Self, CronError> {
        if !rule_regex().is_match(rule) {
            return Err(CronError::BadRule {
                rule: rule.to_string(),
                reason: "expected 5 or 6 cron fields".to_string(),
            });
        }
        let mut fields: Vec<&str> = rule.split_whitespace().collect();
        match fields.len() {
            5 => fields.insert(0, "0"),
            6 => {}
            n => {
                return Err(CronError::BadRule {
                    rule: rule.to_string(),
                    reason: format!("{n} fields"),
                })
            }
        }

        let mut sets = Vec::with_capacity(6);
        for (text, (name, min, max)) in fields.iter().zip(FIELDS) {
            sets.push(parse_field(rule, text, name, min, max)?);
        }
        let mut sets = sets.into_iter();
        Ok(Self {
            seconds: sets.next().unwrap_or_default(),
            minutes: sets.next().unwrap_or_default(),
            hours: sets.next().unwrap_or_default(),
            days_of_month: sets.next().unwrap_or_default(),
            months: sets.next().unwrap_or_default(),
            days_of_week: sets.next().unwrap_or_default(),
        })
    }

    /// Whether the minute containing `t` is eligible to fire.
    pub fn matches_minute(&self, t: &DateTime<Local>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days_of_month.contains(&t.day())
            && self.months.contains(&t.month())
            && self
                .days_of_week
                .contains(&t.weekday().num_days_from_sunday())
    }
}

fn parse_field(
    rule: &str,
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for item in text.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step.parse().map_err(|_| CronError::BadRule {
                    rule: rule.to_string(),
                    reason: format!("bad step in `{item}`"),
                })?;
                if step == 0 {
                    return Err(CronError::BadRule {
                        rule: rule.to_string(),
                        reason: format!("zero step in `{item}`"),
                    });
                }
                (base, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let a = parse_value(rule, a, field, min, max)?;
            let b = parse_value(rule, b, field, min, max)?;
            if a > b {
                return Err(CronError::BadRule {
                    rule: rule.to_string(),
                    reason: format!("inverted range `{base}`"),
                });
            }
            (a, b)
        } else {
            let v = parse_value(rule, base, field, min, max)?;
            // A plain value with a step acts as range start, vixie style.
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
    }
    Ok(values)
}

fn parse_value(
    rule: &str,
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<u32, CronError> {
    let value: u32 = text.parse().map_err(|_| CronError::BadRule {
        rule: rule.to_string(),
        reason: format!("bad number `{text}` in {field}"),
    })?;
    if value < min || value > max {
        return Err(CronError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn five_fields_imply_second_zero() {
        let schedule = Schedule::parse("*/15 2 * * *").unwrap();
        assert_eq!(schedule.seconds, set(&[0]));
        assert_eq!(schedule.minutes, set(&[0, 15, 30, 45]));
        assert_eq!(schedule.hours, set(&[2]));
        assert_eq!(schedule.days_of_month.len(), 31);
        assert_eq!(schedule.months.len(), 12);
        assert_eq!(schedule.days_of_week.len(), 7);
    }

    #[test]
    fn six_fields_parse_seconds() {
        let schedule = Schedule::parse("30 * * * * *").unwrap();
        assert_eq!(schedule.seconds, set(&[30]));
        assert_eq!(schedule.minutes.len(), 60);
    }

    #[test]
    fn lists_ranges_and_stepped_ranges() {
        let schedule = Schedule::parse("0 1,2,10-12 8-18/5 1 6 0").unwrap();
        assert_eq!(schedule.minutes, set(&[1, 2, 10, 11, 12]));
        assert_eq!(schedule.hours, set(&[8, 13, 18]));
        assert_eq!(schedule.days_of_month, set(&[1]));
        assert_eq!(schedule.months, set(&[6]));
        assert_eq!(schedule.days_of_week, set(&[0]));
    }

    #[test]
    fn rejects_malformed_rules() {
        for rule in [
            "",
            "* * *",
            "61 * * * *",
            "* 24 * * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 7",
            "a * * * *",
            "*/0 * * * *",
            "10-5 * * * *",
            "* * * * * * *",
        ] {
            assert!(Schedule::parse(rule).is_err(), "rule `{rule}` must fail");
        }
    }

    #[test]
    fn matches_the_exact_calendar_minute() {
        let schedule = Schedule::parse("30 14 1 6 *").unwrap();
        let hit = Local.with_ymd_and_hms(2026, 6, 1, 14, 30, 0).unwrap();
        let miss = Local.with_ymd_and_hms(2026, 6, 1, 14, 31, 0).unwrap();
        assert!(schedule.matches_minute(&hit));
        assert!(!schedule.matches_minute(&miss));
    }

    #[test]
    fn weekday_field_uses_sunday_zero() {
        let schedule = Schedule::parse("0 0 * * 0").unwrap();
        // 2026-06-07 is a Sunday.
        let sunday = Local.with_ymd_and_hms(2026, 6, 7, 0, 0, 0).unwrap();
        let monday = Local.with_ymd_and_hms(2026, 6, 8, 0, 0, 0).unwrap();
        assert!(schedule.matches_minute(&sunday));
        assert!(!schedule.matches_minute(&monday));
    }
}
