//! Reporting-date grids. The regulator publishes monthly forms as of the
//! first day of the month, so the usual grid is `Freq::Month` anchored at
//! `Anchor::Start`, but quarterly and ad-hoc pulls use the same machinery.

use chrono::{Datelike, Duration, NaiveDate};

use crate::error::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Year,
    Quarter,
    Month,
    Week,
    Day,
}

impl Freq {
    pub fn from_label(label: &str) -> Option<Freq> {
        match label.trim().to_ascii_lowercase().as_str() {
            "y" | "year" | "yearly" => Some(Freq::Year),
            "q" | "quarter" | "quarterly" => Some(Freq::Quarter),
            "m" | "month" | "monthly" => Some(Freq::Month),
            "w" | "week" | "weekly" => Some(Freq::Week),
            "d" | "day" | "daily" => Some(Freq::Day),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    End,
}

impl Anchor {
    pub fn from_label(label: &str) -> Option<Anchor> {
        match label.trim().to_ascii_lowercase().as_str() {
            "start" | "begin" => Some(Anchor::Start),
            "end" => Some(Anchor::End),
            _ => None,
        }
    }
}

/// A validated period grid: frequency, which edge of each period to emit,
/// and a step (1 = every period, 2 = every other, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodSpec {
    freq: Freq,
    anchor: Anchor,
    step: u32,
}

impl PeriodSpec {
    pub fn new(freq: Freq, anchor: Anchor, step: u32) -> Result<PeriodSpec, RunError> {
        if step == 0 {
            return Err(RunError::Usage("period step must be at least 1".to_owned()));
        }
        Ok(PeriodSpec { freq, anchor, step })
    }

    /// Anchor dates of every `step`-th period between `from` and `to`,
    /// inclusive. The walk starts at the period containing `from`, so an
    /// anchor that lands outside the requested range is dropped rather
    /// than shifted.
    pub fn points(&self, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        let mut cur = match self.freq {
            Freq::Day => from,
            Freq::Week => week_start(from),
            Freq::Month => month_start(from),
            Freq::Quarter => quarter_start(from),
            Freq::Year => year_start(from),
        };
        let mut out = Vec::new();
        let mut k: u32 = 0;
        while cur <= to {
            if k % self.step == 0 {
                let p = match (self.freq, self.anchor) {
                    (Freq::Day, _) => cur,
                    (Freq::Week, Anchor::Start) => cur,
                    (Freq::Week, Anchor::End) => cur + Duration::days(6),
                    (Freq::Month, Anchor::Start) => cur,
                    (Freq::Month, Anchor::End) => next_month(cur) - Duration::days(1),
                    (Freq::Quarter, Anchor::Start) => cur,
                    (Freq::Quarter, Anchor::End) => add_months(cur, 3) - Duration::days(1),
                    (Freq::Year, Anchor::Start) => cur,
                    (Freq::Year, Anchor::End) => ymd(cur.year(), 12, 31),
                };
                if p >= from && p <= to {
                    out.push(p);
                }
            }
            cur = match self.freq {
                Freq::Day => cur + Duration::days(1),
                Freq::Week => cur + Duration::days(7),
                Freq::Month => next_month(cur),
                Freq::Quarter => add_months(cur, 3),
                Freq::Year => ymd(cur.year() + 1, 1, 1),
            };
            k = k.wrapping_add(1);
        }
        out
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    // callers only pass fixed in-range month/day pairs
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn month_start(d: NaiveDate) -> NaiveDate {
    ymd(d.year(), d.month(), 1)
}

fn next_month(d: NaiveDate) -> NaiveDate {
    if d.month() == 12 {
        ymd(d.year() + 1, 1, 1)
    } else {
        ymd(d.year(), d.month() + 1, 1)
    }
}

fn add_months(d: NaiveDate, months: u32) -> NaiveDate {
    let total = d.month() - 1 + months;
    ymd(d.year() + (total / 12) as i32, total % 12 + 1, 1)
}

fn quarter_start(d: NaiveDate) -> NaiveDate {
    ymd(d.year(), 1 + (d.month() - 1) / 3 * 3, 1)
}

fn year_start(d: NaiveDate) -> NaiveDate {
    ymd(d.year(), 1, 1)
}

/// ISO week, Monday first.
fn week_start(d: NaiveDate) -> NaiveDate {
    d - Duration::days(i64::from(d.weekday().num_days_from_monday()))
}
