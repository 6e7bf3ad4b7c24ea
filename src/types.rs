//! Types used to identify forecasts and their lead times.

pub mod forecast_date;

pub use self::forecast_date::{parse_hourly, DateSelector, ForecastDate, ForecastKey, TargetSelector};
