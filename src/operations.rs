//! Forecast operations.
//!
//! Each operation is implemented as a struct holding its arguments that implements the
//! [Operation](crate::operation::Operation) trait. The computations that combine several files
//! are plain functions over opened [Dataset](crate::dataset::Dataset)s, so that they can be
//! exercised without files on disk.

pub mod aggregations;
pub mod forecasts;
pub mod general;

use crate::dataset::{DataSource, Dataset};
use crate::error::ForecastError;
use crate::layout;
use crate::types::{ForecastDate, ForecastKey};

use serde::Serialize;

/// Selects one method and configuration file of a forecast run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileSelector {
    pub region: String,
    pub forecast_date: ForecastDate,
    pub method: String,
    pub configuration: String,
}

impl FileSelector {
    pub fn forecast_key(&self) -> ForecastKey {
        ForecastKey::new(self.region.clone(), self.forecast_date)
    }

    /// Opens the selected file.
    pub fn open(&self, source: &DataSource) -> Result<Box<dyn Dataset>, ForecastError> {
        let region_path = source.region_path(&self.region)?;
        let path = layout::file_path(
            &region_path,
            &self.forecast_date,
            &self.method,
            &self.configuration,
        )?;
        source.open(&path)
    }
}

/// Opens every file of a forecast run, optionally restricted to one method, in file name order.
pub fn open_forecast(
    source: &DataSource,
    region: &str,
    forecast_date: &ForecastDate,
    method: Option<&str>,
) -> Result<Vec<Box<dyn Dataset>>, ForecastError> {
    let region_path = source.region_path(region)?;
    layout::list_files(&region_path, forecast_date, method)?
        .iter()
        .map(|path| source.open(path))
        .collect()
}

/// Returns the divisor of each entity for a normalisation by the reference value of a return
/// period, or `None` without normalisation.
pub fn normalization_divisors(
    dataset: &dyn Dataset,
    entity_indices: &[usize],
    normalize: Option<u32>,
) -> Result<Option<Vec<f64>>, ForecastError> {
    let Some(return_period) = normalize else {
        return Ok(None);
    };
    let axis = dataset.reference_axis()?;
    let position = axis
        .iter()
        .position(|period| (*period - f64::from(return_period)).abs() < 1e-6)
        .ok_or_else(|| {
            ForecastError::invalid(
                "normalize",
                format!("no reference value for a return period of {return_period}"),
            )
        })?;
    entity_indices
        .iter()
        .map(|&entity| {
            let values = dataset.reference_values(entity)?;
            Ok(values.get(position).copied().unwrap_or(f64::NAN))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Divides a value by a normalisation divisor. A zero or missing divisor yields NaN.
pub fn normalized(value: f64, divisor: f64) -> f64 {
    if divisor == 0.0 || !divisor.is_finite() {
        f64::NAN
    } else {
        value / divisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;

    #[test]
    fn divisors() {
        let dataset = test_utils::dataset_with_reference();
        assert_eq!(
            None,
            normalization_divisors(&dataset, &[0, 1], None).unwrap()
        );
        let divisors = normalization_divisors(&dataset, &[0, 2], Some(10)).unwrap().unwrap();
        assert_eq!(vec![20.0, 0.0], divisors);
        assert!(matches!(
            normalization_divisors(&dataset, &[0], Some(7)),
            Err(ForecastError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn normalize_values() {
        assert_eq!(2.5, normalized(50.0, 20.0));
        assert!(normalized(50.0, 0.0).is_nan());
        assert!(normalized(50.0, f64::NAN).is_nan());
    }

    #[test]
    fn open_file() {
        let data = test_utils::TestData::new();
        let selector = FileSelector {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
            method: "4Zo-CEP".to_string(),
            configuration: "Alpes_Tessin".to_string(),
        };
        let dataset = selector.open(&data.source).unwrap();
        assert_eq!("4Zo-CEP", dataset.run().method_id);
        let missing = FileSelector {
            configuration: "Nope".to_string(),
            ..selector
        };
        assert!(missing.open(&data.source).err().unwrap().is_not_found());
    }

    #[test]
    fn open_all() {
        let data = test_utils::TestData::new();
        let all = open_forecast(&data.source, "adn", &test_utils::forecast_date(), None).unwrap();
        assert_eq!(3, all.len());
        let one =
            open_forecast(&data.source, "adn", &test_utils::forecast_date(), Some("2Z-GFS"))
                .unwrap();
        assert_eq!(1, one.len());
    }
}
