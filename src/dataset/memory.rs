//! In-memory forecast files.
//!
//! [MemoryOpener] maps file paths to [MemoryDataset]s. Paths still have to exist on disk, so that
//! the directory layout is exercised exactly as with real files.

use super::{Dataset, DatasetOpener, MethodRun};
use crate::error::ForecastError;

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use hashbrown::HashMap;
use ndarray::Array2;

/// A forecast file held in memory.
#[derive(Clone, Debug)]
pub struct MemoryDataset {
    pub run: MethodRun,
    /// Analog values, one row per station and one column per analog row
    pub values: Array2<f64>,
    pub analog_dates: Vec<NaiveDateTime>,
    pub analog_criteria: Vec<f64>,
    pub reference_axis: Vec<f64>,
    /// Reference values, one row per station and one column per reference axis entry
    pub reference_values: Array2<f64>,
}

impl MemoryDataset {
    /// Returns a dataset with the given analog values and no analog dates, criteria or
    /// reference values.
    pub fn new(run: MethodRun, values: Array2<f64>) -> Result<Self, ForecastError> {
        if values.nrows() != run.station_ids.len() {
            return Err(ForecastError::inconsistent(format!(
                "{} value rows for {} stations",
                values.nrows(),
                run.station_ids.len()
            )));
        }
        run.validate(values.ncols())?;
        let stations = run.station_ids.len();
        Ok(Self {
            run,
            values,
            analog_dates: Vec::new(),
            analog_criteria: Vec::new(),
            reference_axis: Vec::new(),
            reference_values: Array2::zeros((stations, 0)),
        })
    }

    /// Sets the analog dates and criteria, one per analog row.
    pub fn with_analogs(mut self, dates: Vec<NaiveDateTime>, criteria: Vec<f64>) -> Self {
        self.analog_dates = dates;
        self.analog_criteria = criteria;
        self
    }

    /// Sets the reference axis and the reference values of each station.
    pub fn with_reference(mut self, axis: Vec<f64>, values: Array2<f64>) -> Self {
        self.reference_axis = axis;
        self.reference_values = values;
        self
    }

    fn check_rows(&self, rows: &Range<usize>, available: usize) -> Result<(), ForecastError> {
        if rows.start > rows.end || rows.end > available {
            return Err(ForecastError::inconsistent(format!(
                "analog rows {rows:?} out of bounds ({available})"
            )));
        }
        Ok(())
    }

    fn check_entity(&self, entity_index: usize) -> Result<(), ForecastError> {
        if entity_index >= self.run.station_ids.len() {
            return Err(ForecastError::not_found(format!(
                "entity index {entity_index}"
            )));
        }
        Ok(())
    }
}

impl Dataset for MemoryDataset {
    fn run(&self) -> &MethodRun {
        &self.run
    }

    fn analog_values(
        &self,
        entity_index: usize,
        rows: Range<usize>,
    ) -> Result<Vec<f64>, ForecastError> {
        self.check_entity(entity_index)?;
        self.check_rows(&rows, self.values.ncols())?;
        Ok(self
            .values
            .row(entity_index)
            .iter()
            .skip(rows.start)
            .take(rows.len())
            .copied()
            .collect())
    }

    fn analog_dates(&self, rows: Range<usize>) -> Result<Vec<NaiveDateTime>, ForecastError> {
        self.check_rows(&rows, self.analog_dates.len())?;
        Ok(self.analog_dates[rows].to_vec())
    }

    fn analog_criteria(&self, rows: Range<usize>) -> Result<Vec<f64>, ForecastError> {
        self.check_rows(&rows, self.analog_criteria.len())?;
        Ok(self.analog_criteria[rows].to_vec())
    }

    fn reference_axis(&self) -> Result<Vec<f64>, ForecastError> {
        Ok(self.reference_axis.clone())
    }

    fn reference_values(&self, entity_index: usize) -> Result<Vec<f64>, ForecastError> {
        self.check_entity(entity_index)?;
        if self.reference_values.nrows() <= entity_index {
            return Ok(Vec::new());
        }
        Ok(self.reference_values.row(entity_index).to_vec())
    }
}

/// Opener serving registered [MemoryDataset]s.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    datasets: RwLock<HashMap<PathBuf, Arc<MemoryDataset>>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the dataset served for `path`, replacing any previous one.
    pub fn insert(&self, path: impl Into<PathBuf>, dataset: MemoryDataset) {
        let mut datasets = match self.datasets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        datasets.insert(path.into(), Arc::new(dataset));
    }
}

impl DatasetOpener for MemoryOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Dataset>, ForecastError> {
        if !path.is_file() {
            return Err(ForecastError::not_found(format!("file {}", path.display())));
        }
        let datasets = match self.datasets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let dataset = datasets
            .get(path)
            .cloned()
            .ok_or_else(|| ForecastError::dataset(path, "no dataset registered"))?;
        Ok(Box::new(dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;

    use ndarray::array;

    fn dataset() -> MemoryDataset {
        let run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![2, 2]);
        let values = array![
            [1.0, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, 8.0],
            [9.0, 10.0, 11.0, 12.0]
        ];
        MemoryDataset::new(run, values).unwrap()
    }

    #[test]
    fn new_checks_shape() {
        let run = test_utils::method_run("4Zo-CEP", "Alpes_Tessin", vec![2, 2]);
        assert!(MemoryDataset::new(run.clone(), Array2::zeros((2, 4))).is_err());
        assert!(MemoryDataset::new(run, Array2::zeros((3, 5))).is_err());
    }

    #[test]
    fn values() {
        let dataset = dataset();
        assert_eq!(vec![7.0, 8.0], dataset.analog_values(1, 2..4).unwrap());
        assert!(dataset.analog_values(3, 0..2).unwrap_err().is_not_found());
        assert!(dataset.analog_values(0, 3..5).is_err());
    }

    #[test]
    fn block() {
        let dataset = dataset();
        let block = dataset.analog_block(&[2, 0], 0..2).unwrap();
        assert_eq!(array![[9.0, 10.0], [1.0, 2.0]], block);
    }

    #[test]
    fn opener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nc");
        let opener = MemoryOpener::new();
        opener.insert(&path, dataset());
        assert!(opener.open(&path).err().unwrap().is_not_found());
        std::fs::File::create(&path).unwrap();
        let opened = opener.open(&path).unwrap();
        assert_eq!("Alpes_Tessin", opened.run().configuration_id);
        let other = dir.path().join("b.nc");
        std::fs::File::create(&other).unwrap();
        assert!(matches!(
            opener.open(&other).err().unwrap(),
            ForecastError::Dataset { .. }
        ));
    }
}
