//! Reference-time model (spec §2 "Reference-time model", §3 invariant I4).
//!
//! A reftime is either a single point in time or a closed interval, both at
//! second granularity. [`Reftime::merge`] combines a collection of reftimes
//! into the smallest enclosing interval, used by summaries (spec §3
//! "Summary") and by maintenance when computing a segment's age (spec §4.5).

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reftime {
    Point(#[serde(with = "chrono_secs")] DateTime<Utc>),
    Interval(
        #[serde(with = "chrono_secs")] DateTime<Utc>,
        #[serde(with = "chrono_secs")] DateTime<Utc>,
    ),
}

mod chrono_secs {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(dt.timestamp())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let ts = i64::deserialize(d)?;
        Ok(Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now))
    }
}

impl Reftime {
    /// The earliest instant covered by this reftime.
    pub fn min(&self) -> DateTime<Utc> {
        match self {
            Reftime::Point(t) => *t,
            Reftime::Interval(a, _) => *a,
        }
    }

    /// The latest instant covered by this reftime.
    pub fn max(&self) -> DateTime<Utc> {
        match self {
            Reftime::Point(t) => *t,
            Reftime::Interval(_, b) => *b,
        }
    }

    /// Combine `self` with `other` into the smallest enclosing interval.
    pub fn extend(&self, other: &Reftime) -> Reftime {
        let min = self.min().min(other.min());
        let max = self.max().max(other.max());
        if min == max {
            Reftime::Point(min)
        } else {
            Reftime::Interval(min, max)
        }
    }

    /// Merge a collection of reftimes into the smallest enclosing interval.
    /// Returns `None` for an empty collection.
    pub fn merge<'a, I: IntoIterator<Item = &'a Reftime>>(items: I) -> Option<Reftime> {
        let mut it = items.into_iter();
        let first = *it.next()?;
        Some(it.fold(first, |acc, r| acc.extend(r)))
    }

    /// Reconstructs a reftime from a `(min, max)` pair of Unix timestamps,
    /// as stored by an index backend's reftime columns. Collapses to a
    /// [`Reftime::Point`] when the two coincide.
    pub fn from_unix_range(min: i64, max: i64) -> Reftime {
        use chrono::TimeZone;
        let min = Utc.timestamp_opt(min, 0).single().unwrap_or_else(Utc::now);
        let max = Utc.timestamp_opt(max, 0).single().unwrap_or_else(Utc::now);
        if min == max {
            Reftime::Point(min)
        } else {
            Reftime::Interval(min, max)
        }
    }
}

/// Reftime-bucket granularity, driving segment path computation (spec §3
/// "Segment", §6 `step` config key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Hourly,
    #[serde(rename = "6h")]
    SixHourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Step {
    /// Compute the segment-relative path (without format extension) that a
    /// message with the given reftime falls into under this step.
    ///
    /// Examples (spec §3): daily -> `YYYY/MM-DD`; yearly -> `NN/YYYY` where
    /// `NN` is the century bucket (`year / 100`), kept from the original
    /// implementation so yearly datasets still get two path components
    /// instead of one flat directory per year (see DESIGN.md).
    pub fn bucket_path(self, t: DateTime<Utc>) -> String {
        match self {
            Step::Hourly => format!("{:04}/{:02}-{:02}-{:02}", t.year(), t.month(), t.day(), t.hour()),
            Step::SixHourly => {
                let bucket = (t.hour() / 6) * 6;
                format!("{:04}/{:02}-{:02}-{:02}", t.year(), t.month(), t.day(), bucket)
            }
            Step::Daily => format!("{:04}/{:02}-{:02}", t.year(), t.month(), t.day()),
            Step::Weekly => {
                let iso = t.iso_week();
                format!("{:04}/{:02}", iso.year(), iso.week())
            }
            Step::Monthly => format!("{:04}/{:02}", t.year(), t.month()),
            Step::Yearly => format!("{:02}/{:04}", t.year() / 100, t.year()),
        }
    }

    /// The bucket immediately following `t`'s bucket under this step, used
    /// by maintenance to test "latest reftime within a segment is older
    /// than N days" without materializing every second in between.
    pub fn bucket_duration(self) -> Duration {
        match self {
            Step::Hourly => Duration::hours(1),
            Step::SixHourly => Duration::hours(6),
            Step::Daily => Duration::days(1),
            Step::Weekly => Duration::weeks(1),
            Step::Monthly => Duration::days(31),
            Step::Yearly => Duration::days(366),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn daily_bucket_matches_spec_example() {
        assert_eq!(Step::Daily.bucket_path(dt(2007, 7, 8)), "2007/07-08");
    }

    #[test]
    fn merge_produces_enclosing_interval() {
        let a = Reftime::Point(dt(2007, 7, 7));
        let b = Reftime::Point(dt(2007, 10, 9));
        let merged = Reftime::merge([&a, &b]).unwrap();
        assert_eq!(merged, Reftime::Interval(dt(2007, 7, 7), dt(2007, 10, 9)));
    }

    #[test]
    fn merge_single_point_stays_a_point() {
        let a = Reftime::Point(dt(2007, 7, 7));
        assert_eq!(Reftime::merge([&a]).unwrap(), a);
    }

    #[test]
    fn merge_empty_is_none() {
        let items: Vec<Reftime> = vec![];
        assert!(Reftime::merge(items.iter()).is_none());
    }
}
