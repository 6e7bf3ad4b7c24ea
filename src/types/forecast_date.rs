//! Forecast and target dates
//!
//! Forecasts are issued on the hour. A [ForecastDate] is always represented as `YYYY-MM-DDThh`,
//! whichever of the accepted input formats it was parsed from:
//!
//! * `YYYY-MM-DDThh`
//! * `YYYY-MM-DDThh:mm` and `YYYY-MM-DDThh:mm:ss` (minutes and seconds are dropped)
//! * `YYYY-MM-DD` (midnight)

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ForecastError;

const HOUR_FORMAT: &str = "%Y-%m-%dT%H";

/// Parse a date or date-time string and truncate it to the hour.
pub fn parse_hourly(value: &str) -> Result<NaiveDateTime, ForecastError> {
    let value = value.trim();
    let parsed = if value.len() == 13 {
        NaiveDateTime::parse_from_str(&format!("{value}:00"), "%Y-%m-%dT%H:%M").ok()
    } else {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
    };
    parsed
        .and_then(|dt| dt.with_minute(0))
        .and_then(|dt| dt.with_second(0))
        .and_then(|dt| dt.with_nanosecond(0))
        .ok_or_else(|| ForecastError::invalid("date", format!("unrecognised format ({value})")))
}

/// Issue time of one forecast run, at hour resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForecastDate(NaiveDateTime);

impl ForecastDate {
    /// Returns the forecast date for the given calendar day and hour.
    pub fn from_ymdh(year: i32, month: u32, day: u32, hour: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .map(Self)
    }

    /// The issue time as a naive date-time.
    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    /// The target date reached after `hours` of lead time.
    pub fn lead_time(&self, hours: u32) -> Result<NaiveDateTime, ForecastError> {
        self.0
            .checked_add_signed(Duration::hours(i64::from(hours)))
            .ok_or_else(|| {
                ForecastError::invalid("lead time", format!("{hours} hours is out of range"))
            })
    }

    /// Prefix shared by every file of this forecast: `YYYY-MM-DD_hh.`
    pub fn file_prefix(&self) -> String {
        self.0.format("%Y-%m-%d_%H.").to_string()
    }

    /// Relative directory of this forecast: `YYYY/MM/DD`
    pub fn relative_dir(&self) -> std::path::PathBuf {
        let date = self.0.date();
        [
            date.format("%Y").to_string(),
            date.format("%m").to_string(),
            date.format("%d").to_string(),
        ]
        .iter()
        .collect()
    }
}

impl From<ForecastDate> for NaiveDateTime {
    fn from(date: ForecastDate) -> Self {
        date.0
    }
}

impl fmt::Display for ForecastDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(HOUR_FORMAT))
    }
}

impl FromStr for ForecastDate {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hourly(s).map(Self)
    }
}

impl Serialize for ForecastDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ForecastDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of one forecast run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForecastKey {
    pub region: String,
    pub forecast_date: ForecastDate,
}

impl ForecastKey {
    pub fn new(region: impl Into<String>, forecast_date: ForecastDate) -> Self {
        Self {
            region: region.into(),
            forecast_date,
        }
    }
}

/// A forecast date as given in a request path: either a date or `latest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateSelector {
    Latest,
    Date(ForecastDate),
}

impl FromStr for DateSelector {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            s.parse().map(Self::Date)
        }
    }
}

/// Selects one lead time of a forecast.
///
/// A value made only of digits is a lead time in hours, anything else is parsed as a target date.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    LeadTime(u32),
    TargetDate(NaiveDateTime),
}

impl TargetSelector {
    /// Returns the target date this selector designates for a forecast.
    pub fn resolve(&self, forecast_date: &ForecastDate) -> Result<NaiveDateTime, ForecastError> {
        match self {
            Self::LeadTime(hours) => forecast_date.lead_time(*hours),
            Self::TargetDate(date) => Ok(*date),
        }
    }
}

impl FromStr for TargetSelector {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse()
                .map(Self::LeadTime)
                .map_err(|e| ForecastError::invalid("lead time", e.to_string()))
        } else {
            parse_hourly(s).map(Self::TargetDate)
        }
    }
}
