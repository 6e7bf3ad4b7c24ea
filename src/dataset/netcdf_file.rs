//! NetCDF forecast files.
//!
//! Global attributes:
//!
//! * `method_id`, `method_id_display`: method id and name
//! * `specific_tag`, `specific_tag_display`: configuration id and name
//! * `predictand_station_ids`: comma separated ids of the forecast stations
//!
//! Variables:
//!
//! * `station_ids` (stations)
//! * `analogs_nb`, `target_dates` (lead times)
//! * `analog_dates`, `analog_criteria` (analogs)
//! * `analog_values_raw` (stations, analogs)
//! * `reference_axis` (axis), `reference_values` (stations, axis)
//!
//! Dates are stored as Modified Julian Days.

use super::{Dataset, DatasetOpener, MethodRun};
use crate::error::ForecastError;

use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use netcdf::AttributeValue;

/// Converts a Modified Julian Day into a date-time, rounded to the second.
fn mjd_to_datetime(mjd: f64) -> Option<NaiveDateTime> {
    let epoch = NaiveDate::from_ymd_opt(1858, 11, 17)?.and_hms_opt(0, 0, 0)?;
    if !mjd.is_finite() {
        return None;
    }
    let seconds = (mjd * 86400.0).round() as i64;
    epoch.checked_add_signed(Duration::seconds(seconds))
}

/// Opener for NetCDF forecast files.
#[derive(Debug, Default)]
pub struct NetcdfOpener;

impl DatasetOpener for NetcdfOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Dataset>, ForecastError> {
        if !path.is_file() {
            return Err(ForecastError::not_found(format!("file {}", path.display())));
        }
        Ok(Box::new(NetcdfDataset::open(path)?))
    }
}

/// An opened NetCDF forecast file.
pub struct NetcdfDataset {
    path: PathBuf,
    file: netcdf::File,
    run: MethodRun,
}

impl NetcdfDataset {
    /// Opens a file and reads its header.
    pub fn open(path: &Path) -> Result<Self, ForecastError> {
        let file = netcdf::open(path).map_err(|e| ForecastError::dataset(path, e))?;
        let mut dataset = Self {
            path: path.to_path_buf(),
            file,
            run: MethodRun {
                method_id: String::new(),
                method_name: String::new(),
                configuration_id: String::new(),
                configuration_name: String::new(),
                station_ids: Vec::new(),
                predictand_station_ids: Vec::new(),
                analogs_nb: Vec::new(),
                target_dates: Vec::new(),
            },
        };
        dataset.run = dataset.read_header()?;
        let rows = dataset.dimension_len("analog_dates")?;
        dataset.run.validate(rows)?;
        Ok(dataset)
    }

    fn error(&self, reason: impl std::fmt::Display) -> ForecastError {
        ForecastError::dataset(&self.path, reason)
    }

    fn read_header(&self) -> Result<MethodRun, ForecastError> {
        let predictand_station_ids = match self.file.attribute("predictand_station_ids") {
            Some(_) => self
                .string_attribute("predictand_station_ids")?
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| {
                    id.parse::<i64>()
                        .map_err(|e| self.error(format!("predictand station id {id}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let analogs_nb = self
            .variable::<i64>("analogs_nb", ..)?
            .into_iter()
            .map(|n| usize::try_from(n).map_err(|_| self.error(format!("analog count {n}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MethodRun {
            method_id: self.string_attribute("method_id")?,
            method_name: self.string_attribute("method_id_display")?,
            configuration_id: self.string_attribute("specific_tag")?,
            configuration_name: self.string_attribute("specific_tag_display")?,
            station_ids: self.variable::<i64>("station_ids", ..)?,
            predictand_station_ids,
            analogs_nb,
            target_dates: self.dates("target_dates", ..)?,
        })
    }

    fn string_attribute(&self, name: &str) -> Result<String, ForecastError> {
        let attribute = self
            .file
            .attribute(name)
            .ok_or_else(|| self.error(format!("missing attribute {name}")))?;
        match attribute.value().map_err(|e| self.error(e))? {
            AttributeValue::Str(value) => Ok(value),
            AttributeValue::Strs(values) => Ok(values.join(",")),
            other => Err(self.error(format!("attribute {name} is not a string: {other:?}"))),
        }
    }

    fn dimension_len(&self, variable: &str) -> Result<usize, ForecastError> {
        let variable = self
            .file
            .variable(variable)
            .ok_or_else(|| self.error(format!("missing variable {variable}")))?;
        Ok(variable.len())
    }

    fn variable<T, E>(&self, name: &str, extents: E) -> Result<Vec<T>, ForecastError>
    where
        T: netcdf::NcPutGet,
        E: TryInto<netcdf::Extents>,
        E::Error: Into<netcdf::Error>,
    {
        let variable = self
            .file
            .variable(name)
            .ok_or_else(|| self.error(format!("missing variable {name}")))?;
        variable
            .get_values::<T, _>(extents)
            .map_err(|e| self.error(format!("{name}: {e}")))
    }

    fn dates<E>(&self, name: &str, extents: E) -> Result<Vec<NaiveDateTime>, ForecastError>
    where
        E: TryInto<netcdf::Extents>,
        E::Error: Into<netcdf::Error>,
    {
        self.variable::<f64, _>(name, extents)?
            .into_iter()
            .map(|mjd| mjd_to_datetime(mjd).ok_or_else(|| self.error(format!("{name}: {mjd}"))))
            .collect()
    }
}

impl Dataset for NetcdfDataset {
    fn run(&self) -> &MethodRun {
        &self.run
    }

    fn analog_values(
        &self,
        entity_index: usize,
        rows: Range<usize>,
    ) -> Result<Vec<f64>, ForecastError> {
        if entity_index >= self.run.station_ids.len() {
            return Err(ForecastError::not_found(format!(
                "entity index {entity_index}"
            )));
        }
        self.variable::<f64, _>("analog_values_raw", (entity_index, rows))
    }

    fn analog_dates(&self, rows: Range<usize>) -> Result<Vec<NaiveDateTime>, ForecastError> {
        self.dates("analog_dates", rows)
    }

    fn analog_criteria(&self, rows: Range<usize>) -> Result<Vec<f64>, ForecastError> {
        self.variable::<f64, _>("analog_criteria", rows)
    }

    fn reference_axis(&self) -> Result<Vec<f64>, ForecastError> {
        if self.file.variable("reference_axis").is_none() {
            return Ok(Vec::new());
        }
        self.variable::<f64, _>("reference_axis", ..)
    }

    fn reference_values(&self, entity_index: usize) -> Result<Vec<f64>, ForecastError> {
        if self.file.variable("reference_values").is_none() {
            return Ok(Vec::new());
        }
        self.variable::<f64, _>("reference_values", (entity_index, ..))
    }
}
