//! Daily load profile built from a cumulative consumption counter
//!
//! A [`TimeBucketProfile`] holds one value per fixed-width slot of the day:
//! the average, across several prior days, of the counter's reading within
//! that slot. The counter resets near zero at local midnight, so the profile
//! is a cumulative curve and the difference between two slots is the energy
//! consumed between them.

use crate::error::{GridwiseError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: u32 = 1440;

/// One raw historical reading; `value` is `None` when the state did not parse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            timestamp,
        }
    }

    pub fn absent(timestamp: DateTime<Utc>) -> Self {
        Self {
            value: None,
            timestamp,
        }
    }
}

/// A fixed-width slot of the day
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucket {
    pub time_of_day: NaiveTime,
    /// One averaged reading per observed day
    pub raw_values: Vec<f64>,
    /// Mean of `raw_values`, set by aggregation
    pub averaged_value: Option<f64>,
}

impl TimeBucket {
    fn new(time_of_day: NaiveTime) -> Self {
        Self {
            time_of_day,
            raw_values: Vec::new(),
            averaged_value: None,
        }
    }
}

/// A full day of aggregated buckets, ordered by time of day
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucketProfile {
    bucket_minutes: u32,
    buckets: Vec<TimeBucket>,
    values: Vec<f64>,
}

impl TimeBucketProfile {
    pub fn bucket_minutes(&self) -> u32 {
        self.bucket_minutes
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn buckets(&self) -> &[TimeBucket] {
        &self.buckets
    }

    /// Index of the bucket containing `time`
    pub fn index_of(&self, time: NaiveTime) -> usize {
        bucket_index(time, self.bucket_minutes)
    }

    /// Aggregated value of the bucket at `index`
    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Aggregated value of the bucket containing `time`
    pub fn value_at(&self, time: NaiveTime) -> f64 {
        // index_of is always < len for a built profile
        self.values[self.index_of(time)]
    }

    /// Final bucket of the day, a full day's consumption
    pub fn last_value(&self) -> f64 {
        self.values.last().copied().unwrap_or_default()
    }
}

/// Validate a bucket width: non-zero and dividing the day evenly
pub fn check_bucket_minutes(bucket_minutes: u32) -> Result<()> {
    if bucket_minutes == 0 || MINUTES_PER_DAY % bucket_minutes != 0 {
        return Err(GridwiseError::invalid_configuration(format!(
            "bucket size {} min does not divide a day",
            bucket_minutes
        )));
    }
    Ok(())
}

fn bucket_index(time: NaiveTime, bucket_minutes: u32) -> usize {
    let minute_of_day = time.hour() * 60 + time.minute();
    (minute_of_day / bucket_minutes) as usize
}

/// Round a time of day down to its bucket boundary, seconds zeroed
pub fn floor_time(time: NaiveTime, bucket_minutes: u32) -> NaiveTime {
    let minute_of_day = time.hour() * 60 + time.minute();
    let floored = minute_of_day / bucket_minutes * bucket_minutes;
    NaiveTime::from_hms_opt(floored / 60, floored % 60, 0).unwrap_or(NaiveTime::MIN)
}

/// Round an instant down to its bucket boundary in the site timezone
pub fn floor_instant(instant: DateTime<Utc>, tz: Tz, bucket_minutes: u32) -> DateTime<Utc> {
    let local = instant.with_timezone(&tz);
    let floored = floor_time(local.time(), bucket_minutes);
    tz.from_local_datetime(&local.date_naive().and_time(floored))
        .earliest()
        .map_or(instant, |dt| dt.with_timezone(&Utc))
}

/// `[start_of_day, start_of_next_day)` for a local date, in UTC
pub fn local_day_range(date: NaiveDate, tz: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start_of = |d: NaiveDate| {
        tz.from_local_datetime(&d.and_time(NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| GridwiseError::validation("date", format!("no local midnight on {}", d).as_str()))
    };
    let next = date
        .succ_opt()
        .ok_or_else(|| GridwiseError::validation("date", "date out of range"))?;
    Ok((start_of(date)?, start_of(next)?))
}

/// Builds a [`TimeBucketProfile`] one day of samples at a time
#[derive(Debug)]
pub struct ProfileBuilder {
    bucket_minutes: u32,
    reset_epsilon: f64,
    tz: Tz,
    buckets: Vec<TimeBucket>,
    days: usize,
}

impl ProfileBuilder {
    pub fn new(bucket_minutes: u32, reset_epsilon: f64, tz: Tz) -> Result<Self> {
        check_bucket_minutes(bucket_minutes)?;
        let count = (MINUTES_PER_DAY / bucket_minutes) as usize;
        let buckets = (0..count)
            .map(|i| {
                let minute = i as u32 * bucket_minutes;
                TimeBucket::new(
                    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0).unwrap_or(NaiveTime::MIN),
                )
            })
            .collect();
        Ok(Self {
            bucket_minutes,
            reset_epsilon,
            tz,
            buckets,
            days: 0,
        })
    }

    /// Number of days added so far
    pub fn days(&self) -> usize {
        self.days
    }

    /// Add one day's samples, ordered by timestamp.
    ///
    /// Absent readings are dropped. Leading readings above the reset epsilon
    /// are the previous day's tail and are dropped until the counter starts
    /// near zero. Each bucket then receives at most one value for the day: the
    /// mean of the day's readings that fall into it.
    pub fn add_day(&mut self, samples: &[Sample]) {
        let epsilon = self.reset_epsilon;
        let cleaned = samples
            .iter()
            .filter_map(|s| s.value.map(|v| (v, s.timestamp)))
            .skip_while(|(v, _)| *v > epsilon);

        let mut pointer: Option<usize> = None;
        let mut sum = 0.0;
        let mut count = 0u32;

        for (value, timestamp) in cleaned {
            let local = timestamp.with_timezone(&self.tz).time();
            let idx = bucket_index(local, self.bucket_minutes);
            match pointer {
                Some(p) if idx == p => {
                    sum += value;
                    count += 1;
                }
                Some(p) if idx < p => {}
                Some(p) => {
                    self.buckets[p].raw_values.push(sum / f64::from(count));
                    pointer = Some(idx);
                    sum = value;
                    count = 1;
                }
                None => {
                    pointer = Some(idx);
                    sum = value;
                    count = 1;
                }
            }
        }

        if let Some(p) = pointer {
            self.buckets[p].raw_values.push(sum / f64::from(count));
        }
        self.days += 1;
    }

    /// Aggregate per-day values; fails if any bucket saw no data on any day
    pub fn build(mut self) -> Result<TimeBucketProfile> {
        let mut values = Vec::with_capacity(self.buckets.len());
        for bucket in &mut self.buckets {
            if bucket.raw_values.is_empty() {
                return Err(GridwiseError::insufficient_history(format!(
                    "no samples for slot {} across {} day(s)",
                    bucket.time_of_day.format("%H:%M"),
                    self.days
                )));
            }
            let mean = bucket.raw_values.iter().sum::<f64>() / bucket.raw_values.len() as f64;
            bucket.averaged_value = Some(mean);
            values.push(mean);
        }
        Ok(TimeBucketProfile {
            bucket_minutes: self.bucket_minutes,
            buckets: self.buckets,
            values,
        })
    }
}
