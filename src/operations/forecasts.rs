//! Reads of a single method and configuration file.

use super::FileSelector;
use crate::dataset::{DataSource, Dataset};
use crate::error::ForecastError;
use crate::models::{
    Analog, AnalogCriteriaResult, AnalogDatesResult, AnalogValuesPercentilesResult,
    AnalogValuesResult, AnalogsResult, Parameters, PercentileSeries, ReferenceValuesResult,
    SeriesValuesBestResult, SeriesValuesPercentilesResult,
};
use crate::operation::Operation;
use crate::percentile::{ensemble_percentiles, percentile_fraction};
use crate::types::ForecastKey;

use std::ops::Range;

use chrono::NaiveDateTime;
use ndarray::ArrayView1;
use serde::Serialize;

fn file_parameters(file: &FileSelector) -> Parameters {
    Parameters {
        method: Some(file.method.clone()),
        configuration: Some(file.configuration.clone()),
        ..Parameters::forecast(&file.region, file.forecast_date)
    }
}

/// Returns the analog rows of a target date.
fn target_rows(
    dataset: &dyn Dataset,
    target_date: NaiveDateTime,
) -> Result<Range<usize>, ForecastError> {
    let run = dataset.run();
    run.row_range(run.target_date_index(target_date)?)
}

fn fractions(percentiles: &[u32]) -> Result<Vec<f64>, ForecastError> {
    percentiles
        .iter()
        .map(|p| percentile_fraction(f64::from(*p)))
        .collect()
}

/// Reference values of one entity.
#[derive(Clone, Debug, Serialize)]
pub struct ReferenceValues {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
}

impl Operation for ReferenceValues {
    const NAME: &'static str = "reference_values";
    type Output = ReferenceValuesResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let entity_index = dataset.run().entity_index(self.entity)?;
        Ok(ReferenceValuesResult {
            parameters: Parameters {
                entity: Some(self.entity),
                ..file_parameters(&self.file)
            },
            axis: dataset.reference_axis()?,
            values: dataset.reference_values(entity_index)?,
        })
    }
}

/// Analogs of one entity at one target date, with their dates, criteria and values.
#[derive(Clone, Debug, Serialize)]
pub struct Analogs {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
    pub target_date: NaiveDateTime,
}

impl Operation for Analogs {
    const NAME: &'static str = "analogs";
    type Output = AnalogsResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let entity_index = dataset.run().entity_index(self.entity)?;
        let rows = target_rows(dataset.as_ref(), self.target_date)?;
        let dates = dataset.analog_dates(rows.clone())?;
        let criteria = dataset.analog_criteria(rows.clone())?;
        let values = dataset.analog_values(entity_index, rows)?;
        let analogs = dates
            .into_iter()
            .zip(criteria)
            .zip(values)
            .enumerate()
            .map(|(i, ((date, criteria), value))| Analog {
                date,
                criteria,
                value,
                rank: i + 1,
            })
            .collect();
        Ok(AnalogsResult {
            parameters: Parameters {
                entity: Some(self.entity),
                target_date: Some(self.target_date),
                ..file_parameters(&self.file)
            },
            analogs,
        })
    }
}

/// Analog dates of one target date.
#[derive(Clone, Debug, Serialize)]
pub struct AnalogDates {
    #[serde(flatten)]
    pub file: FileSelector,
    pub target_date: NaiveDateTime,
}

impl Operation for AnalogDates {
    const NAME: &'static str = "analog_dates";
    type Output = AnalogDatesResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let rows = target_rows(dataset.as_ref(), self.target_date)?;
        Ok(AnalogDatesResult {
            parameters: Parameters {
                target_date: Some(self.target_date),
                ..file_parameters(&self.file)
            },
            analog_dates: dataset.analog_dates(rows)?,
        })
    }
}

/// Analogy criteria of one target date.
#[derive(Clone, Debug, Serialize)]
pub struct AnalogCriteria {
    #[serde(flatten)]
    pub file: FileSelector,
    pub target_date: NaiveDateTime,
}

impl Operation for AnalogCriteria {
    const NAME: &'static str = "analog_criteria";
    type Output = AnalogCriteriaResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let rows = target_rows(dataset.as_ref(), self.target_date)?;
        Ok(AnalogCriteriaResult {
            parameters: Parameters {
                target_date: Some(self.target_date),
                ..file_parameters(&self.file)
            },
            criteria: dataset.analog_criteria(rows)?,
        })
    }
}

/// Analog values of one entity at one target date.
#[derive(Clone, Debug, Serialize)]
pub struct AnalogValues {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
    pub target_date: NaiveDateTime,
}

impl Operation for AnalogValues {
    const NAME: &'static str = "analog_values";
    type Output = AnalogValuesResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let entity_index = dataset.run().entity_index(self.entity)?;
        let rows = target_rows(dataset.as_ref(), self.target_date)?;
        Ok(AnalogValuesResult {
            parameters: Parameters {
                entity: Some(self.entity),
                target_date: Some(self.target_date),
                ..file_parameters(&self.file)
            },
            values: dataset.analog_values(entity_index, rows)?,
        })
    }
}

/// Percentiles of the analog values of one entity at one target date.
#[derive(Clone, Debug, Serialize)]
pub struct AnalogValuesPercentiles {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
    pub target_date: NaiveDateTime,
    pub percentiles: Vec<u32>,
}

impl Operation for AnalogValuesPercentiles {
    const NAME: &'static str = "analog_values_percentiles";
    type Output = AnalogValuesPercentilesResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let fractions = fractions(&self.percentiles)?;
        let dataset = self.file.open(source)?;
        let entity_index = dataset.run().entity_index(self.entity)?;
        let rows = target_rows(dataset.as_ref(), self.target_date)?;
        let values = dataset.analog_values(entity_index, rows)?;
        Ok(AnalogValuesPercentilesResult {
            parameters: Parameters {
                entity: Some(self.entity),
                target_date: Some(self.target_date),
                percentiles: Some(self.percentiles.clone()),
                ..file_parameters(&self.file)
            },
            percentiles: self.percentiles.clone(),
            values: ensemble_percentiles(ArrayView1::from(values.as_slice()), &fractions),
        })
    }
}

/// The best analog values of one entity at every lead time.
#[derive(Clone, Debug, Serialize)]
pub struct SeriesAnalogValuesBest {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
    pub number: usize,
}

impl Operation for SeriesAnalogValuesBest {
    const NAME: &'static str = "series_analog_values_best";
    type Output = SeriesValuesBestResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let dataset = self.file.open(source)?;
        let run = dataset.run();
        let entity_index = run.entity_index(self.entity)?;
        let series_values = (0..run.lead_times())
            .map(|lead_index| {
                let rows = run.row_range(lead_index)?;
                let end = rows.start + rows.len().min(self.number);
                dataset.analog_values(entity_index, rows.start..end)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SeriesValuesBestResult {
            parameters: Parameters {
                entity: Some(self.entity),
                number: Some(self.number),
                ..file_parameters(&self.file)
            },
            target_dates: run.target_dates.clone(),
            series_values,
        })
    }
}

/// Percentiles of the analog values of one entity at every lead time.
#[derive(Clone, Debug, Serialize)]
pub struct SeriesAnalogValuesPercentiles {
    #[serde(flatten)]
    pub file: FileSelector,
    pub entity: i64,
    pub percentiles: Vec<u32>,
}

impl Operation for SeriesAnalogValuesPercentiles {
    const NAME: &'static str = "series_analog_values_percentiles";
    type Output = SeriesValuesPercentilesResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(self.file.forecast_key())
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let fractions = fractions(&self.percentiles)?;
        let dataset = self.file.open(source)?;
        let run = dataset.run();
        let entity_index = run.entity_index(self.entity)?;

        // One row per lead time, one column per percentile.
        let per_lead = (0..run.lead_times())
            .map(|lead_index| {
                let values = dataset.analog_values(entity_index, run.row_range(lead_index)?)?;
                Ok(ensemble_percentiles(
                    ArrayView1::from(values.as_slice()),
                    &fractions,
                ))
            })
            .collect::<Result<Vec<_>, ForecastError>>()?;
        let series_percentiles = self
            .percentiles
            .iter()
            .enumerate()
            .map(|(i, percentile)| PercentileSeries {
                percentile: *percentile,
                series_values: per_lead.iter().map(|values| values[i]).collect(),
            })
            .collect();

        Ok(SeriesValuesPercentilesResult {
            parameters: Parameters {
                entity: Some(self.entity),
                percentiles: Some(self.percentiles.clone()),
                ..file_parameters(&self.file)
            },
            target_dates: run.target_dates.clone(),
            series_percentiles,
        })
    }
}
