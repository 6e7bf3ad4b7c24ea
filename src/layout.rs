//! Forecast file layout.
//!
//! Forecast files are stored as
//!
//! ```text
//! <data_dir>/<region>/YYYY/MM/DD/YYYY-MM-DD_hh.<method>.<configuration>.nc
//! ```
//!
//! so that every file of one forecast run shares the `YYYY-MM-DD_hh.` prefix.

use crate::error::ForecastError;
use crate::types::ForecastDate;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use hashbrown::HashSet;

/// Extension of forecast files.
pub const FORECAST_EXTENSION: &str = "nc";

/// Returns the directory of a region, checking that it exists.
///
/// Region names are single path components.
pub fn region_path(data_dir: &Path, region: &str) -> Result<PathBuf, ForecastError> {
    if region.is_empty() || region.contains(['/', '\\']) || region.starts_with('.') {
        return Err(ForecastError::invalid("region", format!("{region:?}")));
    }
    let path = data_dir.join(region);
    if !path.is_dir() {
        return Err(ForecastError::not_found(format!("region {region}")));
    }
    Ok(path)
}

/// Returns the directory holding the files of one forecast run.
pub fn forecast_dir(region_path: &Path, date: &ForecastDate) -> PathBuf {
    region_path.join(date.relative_dir())
}

fn is_forecast_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case(FORECAST_EXTENSION))
}

/// Lists the files of one forecast run in file name order, optionally restricted to one method.
///
/// Fails with [ForecastError::NotFound] when the date directory is missing or holds no matching
/// file.
pub fn list_files(
    region_path: &Path,
    date: &ForecastDate,
    method: Option<&str>,
) -> Result<Vec<PathBuf>, ForecastError> {
    let dir = forecast_dir(region_path, date);
    if !dir.is_dir() {
        return Err(ForecastError::not_found(format!(
            "forecast directory for {date}"
        )));
    }
    let prefix = match method {
        Some(method) => format!("{}{method}.", date.file_prefix()),
        None => date.file_prefix(),
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && is_forecast_file(name) {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        let what = match method {
            Some(method) => format!("files of method {method} for {date}"),
            None => format!("files for {date}"),
        };
        return Err(ForecastError::not_found(what));
    }
    files.sort();
    Ok(files)
}

/// Returns the path of the file of one method and configuration, checking that it exists.
pub fn file_path(
    region_path: &Path,
    date: &ForecastDate,
    method: &str,
    configuration: &str,
) -> Result<PathBuf, ForecastError> {
    for (name, value) in [("method", method), ("configuration", configuration)] {
        if value.is_empty() || value.contains(['/', '\\']) || value.contains("..") {
            return Err(ForecastError::invalid(name, format!("{value:?}")));
        }
    }
    let path = forecast_dir(region_path, date).join(format!(
        "{}{method}.{configuration}.{FORECAST_EXTENSION}",
        date.file_prefix()
    ));
    if !path.is_file() {
        return Err(ForecastError::not_found(format!(
            "forecast of {method}/{configuration} for {date}"
        )));
    }
    Ok(path)
}

/// Extracts the forecast date from a file name of the form `YYYY-MM-DD_hh.*`.
pub fn forecast_date_from_file_name(name: &str) -> Option<ForecastDate> {
    let (day, rest) = name.split_once('_')?;
    let hour = rest.split('.').next()?;
    if hour.len() != 2 {
        return None;
    }
    format!("{day}T{hour}").parse().ok()
}

/// Returns the name of the lexicographically last visible entry of a directory.
///
/// With `directories` set only subdirectories are considered, otherwise only forecast files.
fn last_entry(dir: &Path, directories: bool) -> Result<String, ForecastError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() != directories {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') && (directories || is_forecast_file(name)) {
                names.push(name.to_string());
            }
        }
    }
    names
        .into_iter()
        .max()
        .ok_or_else(|| ForecastError::not_found(format!("forecasts in {}", dir.display())))
}

/// Returns the date of the most recent forecast of a region.
///
/// The latest `YYYY/MM/DD` directory is selected and the hour is taken from the last file in it.
#[tracing::instrument(level = "DEBUG")]
pub fn last_forecast_date(region_path: &Path) -> Result<ForecastDate, ForecastError> {
    let year = last_entry(region_path, true)?;
    let year_path = region_path.join(&year);
    let month = last_entry(&year_path, true)?;
    let month_path = year_path.join(&month);
    let day = last_entry(&month_path, true)?;
    let day_path = month_path.join(&day);
    let file = last_entry(&day_path, false)?;
    let hour = file
        .split_once('_')
        .and_then(|(_, rest)| rest.split('.').next())
        .ok_or_else(|| ForecastError::inconsistent(format!("invalid file name {file}")))?;
    format!("{year}-{month}-{day}T{hour}")
        .parse()
        .map_err(|_| ForecastError::inconsistent(format!("invalid forecast date in {file}")))
}

/// Returns the latest modification time among the files of one forecast run, if any.
pub fn latest_source_mtime(
    region_path: &Path,
    date: &ForecastDate,
) -> Result<Option<SystemTime>, ForecastError> {
    let dir = forecast_dir(region_path, date);
    if !dir.is_dir() {
        return Ok(None);
    }
    let prefix = date.file_prefix();
    let mut latest = None;
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || !is_forecast_file(name) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        latest = latest.max(Some(modified));
    }
    Ok(latest)
}

fn collect_recent(
    dir: &Path,
    cutoff: SystemTime,
    dates: &mut HashSet<ForecastDate>,
) -> Result<(), ForecastError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_recent(&entry.path(), cutoff, dates)?;
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_forecast_file(name) {
            continue;
        }
        // Files may disappear while walking.
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff {
            continue;
        }
        if let Some(date) = forecast_date_from_file_name(name) {
            dates.insert(date);
        }
    }
    Ok(())
}

/// Returns the sorted dates of forecasts with files modified within the last `days` days.
#[tracing::instrument(level = "DEBUG", skip(now))]
pub fn recent_forecast_dates(
    region_path: &Path,
    days: u32,
    now: SystemTime,
) -> Result<Vec<ForecastDate>, ForecastError> {
    let window = Duration::from_secs(u64::from(days) * 24 * 3600);
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut dates = HashSet::new();
    collect_recent(region_path, cutoff, &mut dates)?;
    let mut dates: Vec<_> = dates.into_iter().collect();
    dates.sort();
    Ok(dates)
}

/// Lists the region directories of the data directory, skipping hidden ones.
pub fn list_regions(data_dir: &Path) -> Result<Vec<String>, ForecastError> {
    let mut regions = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                regions.push(name.to_string());
            }
        }
    }
    regions.sort();
    Ok(regions)
}
