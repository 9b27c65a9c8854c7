use chrono::{Datelike, Days, Months, NaiveDate, Weekday};

use crate::model::*;

use super::EngineError;

/// Caller-supplied limits on an expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionBound {
    /// Stop after this date even if the pattern runs longer.
    pub until: Option<NaiveDate>,
    pub max_occurrences: usize,
}

impl ExpansionBound {
    pub fn capped(max_occurrences: usize) -> Self {
        Self {
            until: None,
            max_occurrences,
        }
    }
}

/// Lazy, finite walk over a pattern's occurrences.
///
/// Holds no state beyond the pattern and a cursor, so cloning it or building a
/// new one restarts the exact same sequence.
#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    pattern: &'a RecurringPattern,
    last_date: NaiveDate,
    interval: u64,
    weekdays: Vec<Weekday>,
    step: u64,
    slot: usize,
    index: usize,
    done: bool,
}

impl<'a> Occurrences<'a> {
    pub fn new(pattern: &'a RecurringPattern, until: Option<NaiveDate>) -> Result<Self, EngineError> {
        let r = &pattern.recurrence;
        if r.end_date < r.start_date || r.end_time <= r.start_time {
            return Err(EngineError::InvalidInterval);
        }
        let last_date = until.map_or(r.end_date, |u| u.min(r.end_date));

        let mut weekdays = if r.weekdays.is_empty() {
            vec![r.start_date.weekday()]
        } else {
            r.weekdays.clone()
        };
        weekdays.sort_by_key(|d| d.num_days_from_monday());
        weekdays.dedup();

        Ok(Self {
            pattern,
            last_date,
            interval: r.interval.max(1) as u64,
            weekdays,
            step: 0,
            slot: 0,
            index: 0,
            done: false,
        })
    }

    /// Next candidate date for the pattern, or `None` when past the bound.
    /// Candidates that do not exist on the calendar are skipped.
    fn next_date(&mut self) -> Option<NaiveDate> {
        let start = self.pattern.recurrence.start_date;
        loop {
            let candidate = match self.pattern.recurrence.frequency {
                Frequency::Daily => {
                    let d = start.checked_add_days(Days::new(self.step * self.interval))?;
                    self.step += 1;
                    d
                }
                Frequency::Weekly => {
                    let monday = start.checked_sub_days(Days::new(
                        start.weekday().num_days_from_monday() as u64,
                    ))?;
                    let weekday = self.weekdays[self.slot];
                    let offset = self.step * self.interval * 7
                        + weekday.num_days_from_monday() as u64;
                    self.slot += 1;
                    if self.slot == self.weekdays.len() {
                        self.slot = 0;
                        self.step += 1;
                    }
                    let d = monday.checked_add_days(Days::new(offset))?;
                    if d < start {
                        continue;
                    }
                    d
                }
                Frequency::Monthly => {
                    let months = u32::try_from(self.step * self.interval).ok()?;
                    self.step += 1;
                    let first = start
                        .with_day(1)?
                        .checked_add_months(Months::new(months))?;
                    if first > self.last_date {
                        return None;
                    }
                    match NaiveDate::from_ymd_opt(first.year(), first.month(), start.day()) {
                        Some(d) => d,
                        None => continue, // e.g. the 31st in a 30-day month
                    }
                }
            };
            if candidate > self.last_date {
                return None;
            }
            return Some(candidate);
        }
    }
}

impl Iterator for Occurrences<'_> {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        if self.done {
            return None;
        }
        let Some(date) = self.next_date() else {
            self.done = true;
            return None;
        };
        let r = &self.pattern.recurrence;
        let span = Span::new(at(date, r.start_time), at(date, r.end_time));
        let occurrence = Occurrence {
            pattern_id: self.pattern.id,
            index: self.index,
            date,
            span,
        };
        self.index += 1;
        Some(occurrence)
    }
}

/// Expand a pattern into its ordered occurrences, refusing patterns that would
/// produce more than `bound.max_occurrences`.
pub fn expand(pattern: &RecurringPattern, bound: ExpansionBound) -> Result<Vec<Occurrence>, EngineError> {
    let mut out = Vec::new();
    for occurrence in Occurrences::new(pattern, bound.until)? {
        if out.len() == bound.max_occurrences {
            return Err(EngineError::PatternTooLarge {
                limit: bound.max_occurrences,
            });
        }
        out.push(occurrence);
    }
    Ok(out)
}
