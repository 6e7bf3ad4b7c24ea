//! Aggregations of percentiles over entities, configurations and methods.

use super::{normalization_divisors, normalized, open_forecast};
use crate::dataset::{DataSource, Dataset};
use crate::error::ForecastError;
use crate::models::{
    EntitiesPercentileResult, MethodSeries, Parameters, SynthesisPerMethodResult,
    SynthesisTotalResult, TimeStepSeries,
};
use crate::operation::Operation;
use crate::percentile::{percentile_fraction, row_percentiles};
use crate::types::{ForecastDate, ForecastKey, TargetSelector};

use chrono::NaiveDateTime;
use hashbrown::HashMap;
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use serde::Serialize;

/// Computes the percentile of each entity at one target date over the configurations of one
/// method.
///
/// The station list of the first configuration (by id) is authoritative and every other one
/// must be identical. Each configuration fills in its predictand entities; entities no
/// configuration covers stay missing (NaN).
///
/// Returns the entity ids and their values.
pub fn entities_percentile(
    mut datasets: Vec<Box<dyn Dataset>>,
    target_date: NaiveDateTime,
    fraction: f64,
    normalize: Option<u32>,
) -> Result<(Vec<i64>, Vec<f64>), ForecastError> {
    datasets.sort_by(|a, b| a.run().configuration_id.cmp(&b.run().configuration_id));
    let Some(first) = datasets.first() else {
        return Err(ForecastError::not_found("forecast files"));
    };
    let station_ids = first.run().station_ids.clone();
    let mut values = Array1::from_elem(station_ids.len(), f64::NAN);

    for dataset in &datasets {
        let run = dataset.run();
        if run.station_ids != station_ids {
            return Err(ForecastError::inconsistent(format!(
                "station ids of {}/{} differ from those of {}/{}",
                run.method_id,
                run.configuration_id,
                first.run().method_id,
                first.run().configuration_id
            )));
        }
        let indices = run.relevant_station_indices()?;
        let rows = run.row_range(run.target_date_index(target_date)?)?;
        let block = dataset.analog_block(&indices, rows)?;
        let percentiles = row_percentiles(block.view(), fraction);
        let divisors = normalization_divisors(dataset.as_ref(), &indices, normalize)?;
        for (i, (&index, value)) in indices.iter().zip(percentiles.iter()).enumerate() {
            values[index] = match &divisors {
                Some(divisors) => normalized(*value, divisors[i]),
                None => *value,
            };
        }
    }
    Ok((station_ids, values.to_vec()))
}

/// Computes, for each method, the largest percentile value over its relevant entities at each
/// lead time, keeping the running maximum over the configurations of the method.
///
/// Series start at zero. Methods are returned sorted by id.
pub fn synthesis_per_method(
    mut datasets: Vec<Box<dyn Dataset>>,
    fraction: f64,
    normalize: Option<u32>,
) -> Result<Vec<MethodSeries>, ForecastError> {
    datasets.sort_by(|a, b| {
        let (a, b) = (a.run(), b.run());
        (&a.method_id, &a.configuration_id).cmp(&(&b.method_id, &b.configuration_id))
    });
    let mut series: Vec<MethodSeries> = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();

    for dataset in &datasets {
        let run = dataset.run();
        let index = *index_of.entry(run.method_id.clone()).or_insert_with(|| {
            series.push(MethodSeries {
                method_id: run.method_id.clone(),
                target_dates: run.target_dates.clone(),
                values: vec![0.0; run.lead_times()],
            });
            series.len() - 1
        });
        let method = &mut series[index];
        if method.values.len() != run.lead_times() {
            return Err(ForecastError::inconsistent(format!(
                "{}/{} has {} lead times, previous configurations have {}",
                run.method_id,
                run.configuration_id,
                run.lead_times(),
                method.values.len()
            )));
        }

        let indices = run.relevant_station_indices()?;
        let divisors = normalization_divisors(dataset.as_ref(), &indices, normalize)?;
        for lead_index in 0..run.lead_times() {
            let block = dataset.analog_block(&indices, run.row_range(lead_index)?)?;
            let mut percentiles = row_percentiles(block.view(), fraction);
            if let Some(divisors) = &divisors {
                percentiles
                    .iter_mut()
                    .zip(divisors)
                    .for_each(|(value, divisor)| *value = normalized(*value, *divisor));
            }
            if percentiles.is_empty() {
                continue;
            }
            let largest = *percentiles.max_skipnan();
            // NaN never replaces the running maximum.
            if largest > method.values[lead_index] {
                method.values[lead_index] = largest;
            }
        }
    }
    Ok(series)
}

/// Merges per-method series sharing a time step by taking the element-wise maximum.
///
/// Overlapping target dates must be identical. When a series extends further than the merged
/// one, the merged target dates are extended and the new positions start at zero. Groups are
/// returned in order of first appearance.
pub fn synthesis_total(per_method: &[MethodSeries]) -> Result<Vec<TimeStepSeries>, ForecastError> {
    let mut output: Vec<TimeStepSeries> = Vec::new();
    for method in per_method {
        let time_step = match method.target_dates.as_slice() {
            [first, second, ..] => (*second - *first).num_hours(),
            _ => 0,
        };
        let Some(merged) = output.iter_mut().find(|s| s.time_step == time_step) else {
            output.push(TimeStepSeries {
                time_step,
                target_dates: method.target_dates.clone(),
                values: method.values.clone(),
            });
            continue;
        };

        let overlap = merged.target_dates.len().min(method.target_dates.len());
        if merged.target_dates[..overlap] != method.target_dates[..overlap] {
            return Err(ForecastError::inconsistent(format!(
                "target dates of method {} differ from other methods with a time step of {} hours",
                method.method_id, time_step
            )));
        }
        if method.target_dates.len() > merged.target_dates.len() {
            merged.target_dates = method.target_dates.clone();
            merged.values.resize(method.target_dates.len(), 0.0);
        }
        for (merged_value, value) in merged.values.iter_mut().zip(&method.values) {
            if *value > *merged_value {
                *merged_value = *value;
            }
        }
    }
    Ok(output)
}

/// Percentile of every entity of one method at one lead time.
#[derive(Clone, Debug, Serialize)]
pub struct EntitiesAnalogValuesPercentile {
    pub region: String,
    pub forecast_date: ForecastDate,
    pub method: String,
    pub target: TargetSelector,
    pub percentile: u32,
    pub normalize: Option<u32>,
}

impl Operation for EntitiesAnalogValuesPercentile {
    const NAME: &'static str = "entities_analog_values_percentile";
    type Output = EntitiesPercentileResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(ForecastKey::new(self.region.clone(), self.forecast_date))
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let fraction = percentile_fraction(f64::from(self.percentile))?;
        let target_date = self.target.resolve(&self.forecast_date)?;
        let datasets = open_forecast(source, &self.region, &self.forecast_date, Some(&self.method))?;
        let (entity_ids, values) =
            entities_percentile(datasets, target_date, fraction, self.normalize)?;
        Ok(EntitiesPercentileResult {
            parameters: Parameters {
                target_date: Some(target_date),
                method: Some(self.method.clone()),
                percentile: Some(self.percentile),
                normalize: self.normalize,
                ..Parameters::forecast(&self.region, self.forecast_date)
            },
            entity_ids,
            values,
        })
    }
}

/// Largest percentile value of each method at each lead time.
#[derive(Clone, Debug, Serialize)]
pub struct SeriesSynthesisPerMethod {
    pub region: String,
    pub forecast_date: ForecastDate,
    pub percentile: u32,
    pub normalize: Option<u32>,
}

impl SeriesSynthesisPerMethod {
    fn parameters(&self) -> Parameters {
        Parameters {
            percentile: Some(self.percentile),
            normalize: self.normalize,
            ..Parameters::forecast(&self.region, self.forecast_date)
        }
    }

    fn series(&self, source: &DataSource) -> Result<Vec<MethodSeries>, ForecastError> {
        let fraction = percentile_fraction(f64::from(self.percentile))?;
        let datasets = open_forecast(source, &self.region, &self.forecast_date, None)?;
        synthesis_per_method(datasets, fraction, self.normalize)
    }
}

impl Operation for SeriesSynthesisPerMethod {
    const NAME: &'static str = "series_synthesis_per_method";
    type Output = SynthesisPerMethodResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(ForecastKey::new(self.region.clone(), self.forecast_date))
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        Ok(SynthesisPerMethodResult {
            parameters: self.parameters(),
            series_percentiles: self.series(source)?,
        })
    }
}

/// Largest percentile value over all methods sharing a time step.
#[derive(Clone, Debug, Serialize)]
pub struct SeriesSynthesisTotal {
    pub region: String,
    pub forecast_date: ForecastDate,
    pub percentile: u32,
    pub normalize: Option<u32>,
}

impl Operation for SeriesSynthesisTotal {
    const NAME: &'static str = "series_synthesis_total";
    type Output = SynthesisTotalResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(ForecastKey::new(self.region.clone(), self.forecast_date))
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let per_method = SeriesSynthesisPerMethod {
            region: self.region.clone(),
            forecast_date: self.forecast_date,
            percentile: self.percentile,
            normalize: self.normalize,
        };
        Ok(SynthesisTotalResult {
            parameters: per_method.parameters(),
            series_percentiles: synthesis_total(&per_method.series(source)?)?,
        })
    }
}
