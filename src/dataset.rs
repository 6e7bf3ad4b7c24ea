//! Access to forecast files.
//!
//! A forecast file holds the analogs of one method and configuration for one forecast run. Its
//! analog rows are grouped by lead time: the rows of lead time `i` start at the sum of the analog
//! counts of the previous lead times.
//!
//! The [Dataset] trait exposes the content of one opened file and [DatasetOpener] opens files.
//! The in-memory implementation in [memory] is always available; the NetCDF reader requires the
//! `netcdf` cargo feature.

pub mod memory;
#[cfg(feature = "netcdf")]
pub mod netcdf_file;

use crate::error::ForecastError;
use crate::layout;

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Header of one method and configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodRun {
    pub method_id: String,
    pub method_name: String,
    pub configuration_id: String,
    pub configuration_name: String,
    /// Ids of all entities of the file, in row order of the value matrix
    pub station_ids: Vec<i64>,
    /// Ids of the entities this configuration forecasts. Empty when it covers every entity.
    pub predictand_station_ids: Vec<i64>,
    /// Number of analogs of each lead time
    pub analogs_nb: Vec<usize>,
    /// Target date of each lead time
    pub target_dates: Vec<NaiveDateTime>,
}

impl MethodRun {
    /// Total number of analog rows.
    pub fn total_rows(&self) -> usize {
        self.analogs_nb.iter().sum()
    }

    /// Number of lead times.
    pub fn lead_times(&self) -> usize {
        self.analogs_nb.len()
    }

    /// Checks the header against the number of analog rows stored in the file.
    pub fn validate(&self, rows: usize) -> Result<(), ForecastError> {
        if self.total_rows() != rows {
            return Err(ForecastError::inconsistent(format!(
                "{}/{}: analog counts sum to {} but there are {} rows",
                self.method_id,
                self.configuration_id,
                self.total_rows(),
                rows
            )));
        }
        if self.analogs_nb.len() != self.target_dates.len() {
            return Err(ForecastError::inconsistent(format!(
                "{}/{}: {} analog counts for {} target dates",
                self.method_id,
                self.configuration_id,
                self.analogs_nb.len(),
                self.target_dates.len()
            )));
        }
        if self.target_dates.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ForecastError::inconsistent(format!(
                "{}/{}: target dates are not strictly increasing",
                self.method_id, self.configuration_id
            )));
        }
        Ok(())
    }

    /// Returns the analog rows of a lead time.
    pub fn row_range(&self, lead_index: usize) -> Result<Range<usize>, ForecastError> {
        let count = *self
            .analogs_nb
            .get(lead_index)
            .ok_or_else(|| ForecastError::not_found(format!("lead time index {lead_index}")))?;
        let start: usize = self.analogs_nb[..lead_index].iter().sum();
        Ok(start..start + count)
    }

    /// Returns the lead time index of a target date.
    pub fn target_date_index(&self, target_date: NaiveDateTime) -> Result<usize, ForecastError> {
        self.target_dates
            .iter()
            .position(|date| *date == target_date)
            .ok_or_else(|| {
                ForecastError::not_found(format!(
                    "target date {}",
                    target_date.format("%Y-%m-%dT%H")
                ))
            })
    }

    /// Returns the row index of an entity.
    pub fn entity_index(&self, entity: i64) -> Result<usize, ForecastError> {
        self.station_ids
            .iter()
            .position(|id| *id == entity)
            .ok_or_else(|| ForecastError::not_found(format!("entity {entity}")))
    }

    /// Returns the row indices of the entities forecast by this configuration.
    pub fn relevant_station_indices(&self) -> Result<Vec<usize>, ForecastError> {
        if self.predictand_station_ids.is_empty() {
            return Ok((0..self.station_ids.len()).collect());
        }
        self.predictand_station_ids
            .iter()
            .map(|id| {
                self.station_ids
                    .iter()
                    .position(|station| station == id)
                    .ok_or_else(|| {
                        ForecastError::inconsistent(format!(
                            "{}/{}: predictand station {id} is not a station of the file",
                            self.method_id, self.configuration_id
                        ))
                    })
            })
            .collect()
    }

    /// Hours between the first two target dates, or 0 with fewer than two target dates.
    pub fn time_step_hours(&self) -> i64 {
        match self.target_dates.as_slice() {
            [first, second, ..] => (*second - *first).num_hours(),
            _ => 0,
        }
    }
}

/// Content of one opened forecast file.
pub trait Dataset {
    /// Returns the header of the file.
    fn run(&self) -> &MethodRun;

    /// Returns the analog values of one entity over a range of analog rows.
    fn analog_values(
        &self,
        entity_index: usize,
        rows: Range<usize>,
    ) -> Result<Vec<f64>, ForecastError>;

    /// Returns the analog values of several entities over a range of analog rows.
    ///
    /// The result has one row per entity and one column per analog.
    fn analog_block(
        &self,
        entity_indices: &[usize],
        rows: Range<usize>,
    ) -> Result<Array2<f64>, ForecastError> {
        let mut block = Array2::from_elem((entity_indices.len(), rows.len()), f64::NAN);
        for (mut row, &entity) in block.rows_mut().into_iter().zip(entity_indices) {
            let values = self.analog_values(entity, rows.clone())?;
            if values.len() != rows.len() {
                return Err(ForecastError::inconsistent(format!(
                    "expected {} analog values, got {}",
                    rows.len(),
                    values.len()
                )));
            }
            row.assign(&ArrayView1::from(values.as_slice()));
        }
        Ok(block)
    }

    /// Returns the analog dates over a range of analog rows.
    fn analog_dates(&self, rows: Range<usize>) -> Result<Vec<NaiveDateTime>, ForecastError>;

    /// Returns the analogy criteria over a range of analog rows.
    fn analog_criteria(&self, rows: Range<usize>) -> Result<Vec<f64>, ForecastError>;

    /// Returns the reference axis (return periods).
    fn reference_axis(&self) -> Result<Vec<f64>, ForecastError>;

    /// Returns the reference values of one entity, one per reference axis entry.
    fn reference_values(&self, entity_index: usize) -> Result<Vec<f64>, ForecastError>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    fn run(&self) -> &MethodRun {
        (**self).run()
    }

    fn analog_values(
        &self,
        entity_index: usize,
        rows: Range<usize>,
    ) -> Result<Vec<f64>, ForecastError> {
        (**self).analog_values(entity_index, rows)
    }

    fn analog_block(
        &self,
        entity_indices: &[usize],
        rows: Range<usize>,
    ) -> Result<Array2<f64>, ForecastError> {
        (**self).analog_block(entity_indices, rows)
    }

    fn analog_dates(&self, rows: Range<usize>) -> Result<Vec<NaiveDateTime>, ForecastError> {
        (**self).analog_dates(rows)
    }

    fn analog_criteria(&self, rows: Range<usize>) -> Result<Vec<f64>, ForecastError> {
        (**self).analog_criteria(rows)
    }

    fn reference_axis(&self) -> Result<Vec<f64>, ForecastError> {
        (**self).reference_axis()
    }

    fn reference_values(&self, entity_index: usize) -> Result<Vec<f64>, ForecastError> {
        (**self).reference_values(entity_index)
    }
}

/// Opens forecast files.
pub trait DatasetOpener: Send + Sync {
    /// Opens the file at `path`.
    ///
    /// Fails with [ForecastError::NotFound] when the file does not exist.
    fn open(&self, path: &Path) -> Result<Box<dyn Dataset>, ForecastError>;
}

/// Opener used when the crate is built without a file format reader.
#[derive(Debug, Default)]
pub struct UnsupportedOpener;

impl DatasetOpener for UnsupportedOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Dataset>, ForecastError> {
        if !path.is_file() {
            return Err(ForecastError::not_found(format!("file {}", path.display())));
        }
        Err(ForecastError::dataset(
            path,
            "built without NetCDF support (enable the `netcdf` feature)",
        ))
    }
}

/// Returns the opener for forecast files on disk.
pub fn default_opener() -> Arc<dyn DatasetOpener> {
    #[cfg(feature = "netcdf")]
    {
        Arc::new(netcdf_file::NetcdfOpener)
    }
    #[cfg(not(feature = "netcdf"))]
    {
        Arc::new(UnsupportedOpener)
    }
}

/// The forecast data directory together with the opener used to read its files.
#[derive(Clone)]
pub struct DataSource {
    data_dir: PathBuf,
    opener: Arc<dyn DatasetOpener>,
}

impl DataSource {
    pub fn new(data_dir: impl Into<PathBuf>, opener: Arc<dyn DatasetOpener>) -> Self {
        Self {
            data_dir: data_dir.into(),
            opener,
        }
    }

    /// Root of the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the directory of a region, checking that it exists.
    pub fn region_path(&self, region: &str) -> Result<PathBuf, ForecastError> {
        layout::region_path(&self.data_dir, region)
    }

    /// Opens one forecast file.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub fn open(&self, path: &Path) -> Result<Box<dyn Dataset>, ForecastError> {
        self.opener.open(path)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;

    #[test]
    fn row_ranges() {
        let run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![3, 2, 4]);
        assert_eq!(9, run.total_rows());
        assert_eq!(0..3, run.row_range(0).unwrap());
        assert_eq!(3..5, run.row_range(1).unwrap());
        assert_eq!(5..9, run.row_range(2).unwrap());
        assert!(run.row_range(3).unwrap_err().is_not_found());
    }

    #[test]
    fn validate() {
        let run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![3, 2, 4]);
        run.validate(9).unwrap();
        assert!(matches!(
            run.validate(8),
            Err(ForecastError::Inconsistent { .. })
        ));
        let mut unordered = run.clone();
        unordered.target_dates.swap(0, 1);
        assert!(unordered.validate(9).is_err());
        let mut short = run;
        short.target_dates.pop();
        assert!(short.validate(9).is_err());
    }

    #[test]
    fn lookups() {
        let run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![3, 2, 4]);
        assert_eq!(1, run.entity_index(2).unwrap());
        assert!(run.entity_index(99).unwrap_err().is_not_found());
        assert_eq!(2, run.target_date_index(run.target_dates[2]).unwrap());
        let missing = run.target_dates[2] + chrono::Duration::hours(1);
        assert!(run.target_date_index(missing).unwrap_err().is_not_found());
        assert_eq!(24, run.time_step_hours());
    }

    #[test]
    fn relevant_stations() {
        let mut run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![3]);
        assert_eq!(vec![0, 1, 2], run.relevant_station_indices().unwrap());
        run.predictand_station_ids = vec![3, 1];
        assert_eq!(vec![2, 0], run.relevant_station_indices().unwrap());
        run.predictand_station_ids = vec![7];
        assert!(matches!(
            run.relevant_station_indices(),
            Err(ForecastError::Inconsistent { .. })
        ));
    }

    #[test]
    fn single_target_date_time_step() {
        let mut run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![3]);
        run.target_dates.truncate(1);
        assert_eq!(0, run.time_step_hours());
    }

    #[test]
    fn unsupported_opener() {
        let dir = tempfile::tempdir().unwrap();
        let error = UnsupportedOpener
            .open(&dir.path().join("missing.nc"))
            .err()
            .unwrap();
        assert!(error.is_not_found());
        let path = dir.path().join("present.nc");
        std::fs::File::create(&path).unwrap();
        let error = UnsupportedOpener.open(&path).err().unwrap();
        assert!(matches!(error, ForecastError::Dataset { .. }));
    }
}
