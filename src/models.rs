//! Data types and associated functions and methods
//!
//! Results carry full precision internally. Values are rounded to two decimals and analogy
//! criteria to three decimals when serialised, and values that are not finite are serialised as
//! `null` (and read back as NaN).

use crate::types::ForecastDate;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use validator::{Validate, ValidationError};

/// Decimals of serialised values.
pub const VALUE_DECIMALS: i32 = 2;
/// Decimals of serialised analogy criteria.
pub const CRITERIA_DECIMALS: i32 = 3;

/// Rounds a value, mapping non-finite values to `None`.
pub fn round_to(value: f64, decimals: i32) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    let factor = 10f64.powi(decimals);
    Some((value * factor).round() / factor)
}

/// (De)serialisation of rounded numbers.
mod rounded {
    use super::*;

    pub fn serialize<S: Serializer>(value: f64, decimals: i32, s: S) -> Result<S::Ok, S::Error> {
        round_to(value, decimals).serialize(s)
    }

    pub fn serialize_seq<S: Serializer>(
        values: &[f64],
        decimals: i32,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|v| round_to(*v, decimals)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }

    pub fn deserialize_seq<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        Ok(Vec::<Option<f64>>::deserialize(d)?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }
}

/// Values rounded to [VALUE_DECIMALS].
mod values {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        rounded::serialize_seq(values, VALUE_DECIMALS, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        rounded::deserialize_seq(d)
    }
}

/// Series of values rounded to [VALUE_DECIMALS].
mod nested_values {
    use super::*;

    #[derive(Serialize)]
    struct Row<'a>(#[serde(serialize_with = "super::values::serialize")] &'a [f64]);

    pub fn serialize<S: Serializer>(series: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(series.iter().map(|values| Row(values)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        Ok(Vec::<Vec<Option<f64>>>::deserialize(d)?
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            .collect())
    }
}

/// Analogy criteria rounded to [CRITERIA_DECIMALS].
mod criteria {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        rounded::serialize_seq(values, CRITERIA_DECIMALS, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        rounded::deserialize_seq(d)
    }
}

fn serialize_value<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
    rounded::serialize(*value, VALUE_DECIMALS, s)
}

fn serialize_criterion<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
    rounded::serialize(*value, CRITERIA_DECIMALS, s)
}

/// Request parameters echoed in every result
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Parameters {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_date: Option<ForecastDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<usize>,
}

impl Parameters {
    /// Parameters of a request on one forecast run.
    pub fn forecast(region: &str, forecast_date: ForecastDate) -> Self {
        Self {
            region: region.to_string(),
            forecast_date: Some(forecast_date),
            ..Default::default()
        }
    }
}

// General metadata

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LastForecastDateResult {
    pub parameters: Parameters,
    pub last_forecast_date: ForecastDate,
}

/// A forecasting method
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Method {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MethodsResult {
    pub parameters: Parameters,
    pub methods: Vec<Method>,
}

/// A configuration of a forecasting method
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Configuration {
    pub id: String,
    pub name: String,
}

/// A forecasting method with its configurations
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MethodConfigurations {
    pub id: String,
    pub name: String,
    pub configurations: Vec<Configuration>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MethodsAndConfigsResult {
    pub parameters: Parameters,
    pub methods: Vec<MethodConfigurations>,
}

// Forecast reads

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReferenceValuesResult {
    pub parameters: Parameters,
    /// Return periods
    pub axis: Vec<f64>,
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

/// One analog of a target date
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Analog {
    pub date: NaiveDateTime,
    #[serde(
        serialize_with = "serialize_criterion",
        deserialize_with = "rounded::deserialize"
    )]
    pub criteria: f64,
    #[serde(
        serialize_with = "serialize_value",
        deserialize_with = "rounded::deserialize"
    )]
    pub value: f64,
    /// Rank of the analog, starting at 1
    pub rank: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalogsResult {
    pub parameters: Parameters,
    pub analogs: Vec<Analog>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalogDatesResult {
    pub parameters: Parameters,
    pub analog_dates: Vec<NaiveDateTime>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalogCriteriaResult {
    pub parameters: Parameters,
    #[serde(with = "criteria")]
    pub criteria: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalogValuesResult {
    pub parameters: Parameters,
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalogValuesPercentilesResult {
    pub parameters: Parameters,
    pub percentiles: Vec<u32>,
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SeriesValuesBestResult {
    pub parameters: Parameters,
    pub target_dates: Vec<NaiveDateTime>,
    /// Best analog values of each lead time
    #[serde(with = "nested_values")]
    pub series_values: Vec<Vec<f64>>,
}

/// Series of one percentile over the lead times
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PercentileSeries {
    pub percentile: u32,
    #[serde(with = "values")]
    pub series_values: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SeriesValuesPercentilesResult {
    pub parameters: Parameters,
    pub target_dates: Vec<NaiveDateTime>,
    pub series_percentiles: Vec<PercentileSeries>,
}

// Aggregations

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EntitiesPercentileResult {
    pub parameters: Parameters,
    pub entity_ids: Vec<i64>,
    /// One value per entity, missing for entities no configuration covers
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

/// Largest percentile value of one method at each lead time
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MethodSeries {
    pub method_id: String,
    pub target_dates: Vec<NaiveDateTime>,
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SynthesisPerMethodResult {
    pub parameters: Parameters,
    pub series_percentiles: Vec<MethodSeries>,
}

/// Largest percentile value over the methods sharing a time step
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimeStepSeries {
    /// Hours between consecutive target dates
    pub time_step: i64,
    pub target_dates: Vec<NaiveDateTime>,
    #[serde(with = "values")]
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SynthesisTotalResult {
    pub parameters: Parameters,
    pub series_percentiles: Vec<TimeStepSeries>,
}

// Requests

/// Path of the requests on a region
#[derive(Debug, Deserialize)]
pub struct RegionPath {
    pub region: String,
}

/// Path of the requests on a forecast run. The date may be `latest`.
#[derive(Debug, Deserialize)]
pub struct ForecastPath {
    pub region: String,
    pub forecast_date: String,
}

/// Path of the requests on one entity of a forecast file
#[derive(Debug, Deserialize)]
pub struct EntityPath {
    pub region: String,
    pub forecast_date: String,
    pub method: String,
    pub configuration: String,
    pub entity: i64,
}

/// Path of the requests on one target date of a forecast file
#[derive(Debug, Deserialize)]
pub struct TargetDatePath {
    pub region: String,
    pub forecast_date: String,
    pub method: String,
    pub configuration: String,
    pub target_date: String,
}

/// Path of the requests on one entity and target date of a forecast file
#[derive(Debug, Deserialize)]
pub struct EntityTargetDatePath {
    pub region: String,
    pub forecast_date: String,
    pub method: String,
    pub configuration: String,
    pub entity: i64,
    pub target_date: String,
}

/// Path of the percentile of the entities of a method at one lead time
#[derive(Debug, Deserialize, Validate)]
pub struct EntitiesPercentilePath {
    pub region: String,
    pub forecast_date: String,
    pub method: String,
    /// Lead time in hours or target date
    pub lead_time: String,
    #[validate(range(max = 100, message = "percentile must be between 0 and 100"))]
    pub percentile: u32,
}

/// Path of the synthesis requests
#[derive(Debug, Deserialize, Validate)]
pub struct SynthesisPath {
    pub region: String,
    pub forecast_date: String,
    #[validate(range(max = 100, message = "percentile must be between 0 and 100"))]
    pub percentile: u32,
}

/// Query of the aggregation requests
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AggregationQuery {
    /// Return period of the reference value the results are divided by
    #[validate(range(min = 1, message = "normalize must be greater than 0"))]
    pub normalize: Option<u32>,
}

fn default_percentiles() -> Vec<u32> {
    vec![20, 60, 90]
}

/// Deserialise a comma separated list of percentiles.
fn comma_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u32>, D::Error> {
    let value = String::deserialize(d)?;
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<u32>().map_err(serde::de::Error::custom))
        .collect()
}

/// Validate a list of percentiles
fn validate_percentiles(percentiles: &[u32]) -> Result<(), ValidationError> {
    if percentiles.iter().any(|p| *p > 100) {
        return Err(ValidationError::new("percentiles must be between 0 and 100"));
    }
    Ok(())
}

/// Query of the requests taking several percentiles
#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PercentilesQuery {
    /// Comma separated percentiles
    #[serde(default = "default_percentiles", deserialize_with = "comma_list")]
    #[validate(
        length(min = 1, message = "percentiles must not be empty"),
        custom = "validate_percentiles"
    )]
    pub percentiles: Vec<u32>,
}

impl Default for PercentilesQuery {
    fn default() -> Self {
        Self {
            percentiles: default_percentiles(),
        }
    }
}

fn default_number() -> usize {
    10
}

/// Query of the best analogs request
#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BestAnalogsQuery {
    /// Number of analogs per lead time
    #[serde(default = "default_number")]
    #[validate(range(min = 1, message = "number must be greater than 0"))]
    pub number: usize,
}

impl Default for BestAnalogsQuery {
    fn default() -> Self {
        Self {
            number: default_number(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use serde_json::json;

    fn date(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 10, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn rounding() {
        assert_eq!(Some(67.0), round_to(66.9972, 2));
        assert_eq!(Some(0.123), round_to(0.12345, 3));
        assert_eq!(None, round_to(f64::NAN, 2));
        assert_eq!(None, round_to(f64::INFINITY, 2));
    }

    #[test]
    fn entities_result_json() {
        let result = EntitiesPercentileResult {
            parameters: Parameters {
                percentile: Some(90),
                ..Parameters::forecast("adn", "2024-10-05T00".parse().unwrap())
            },
            entity_ids: vec![1, 2],
            values: vec![66.9972, f64::NAN],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json!({
                "parameters": {"region": "adn", "forecast_date": "2024-10-05T00", "percentile": 90},
                "entity_ids": [1, 2],
                "values": [67.0, null],
            }),
            value
        );
        let back: EntitiesPercentileResult = serde_json::from_value(value).unwrap();
        assert_eq!(67.0, back.values[0]);
        assert!(back.values[1].is_nan());
    }

    #[test]
    fn analog_json() {
        let analog = Analog {
            date: date(1),
            criteria: 0.45678,
            value: 12.3456,
            rank: 1,
        };
        assert_eq!(
            json!({"date": "2024-10-01T00:00:00", "criteria": 0.457, "value": 12.35, "rank": 1}),
            serde_json::to_value(&analog).unwrap()
        );
    }

    #[test]
    fn nested_values_json() {
        let result = SeriesValuesBestResult {
            parameters: Parameters::default(),
            target_dates: vec![date(1), date(2)],
            series_values: vec![vec![1.234, 5.0], vec![f64::NAN]],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(json!([[1.23, 5.0], [null]]), value["series_values"]);
        let back: SeriesValuesBestResult = serde_json::from_value(value).unwrap();
        assert!(back.series_values[1][0].is_nan());
    }

    #[test]
    fn criteria_json() {
        let result = AnalogCriteriaResult {
            parameters: Parameters::default(),
            criteria: vec![0.12345, 0.5],
        };
        assert_eq!(
            json!([0.123, 0.5]),
            serde_json::to_value(&result).unwrap()["criteria"]
        );
    }

    #[test]
    fn percentiles_query() {
        let query: PercentilesQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(vec![20, 60, 90], query.percentiles);
        query.validate().unwrap();
        let query: PercentilesQuery =
            serde_json::from_value(json!({"percentiles": "10, 50,99"})).unwrap();
        assert_eq!(vec![10, 50, 99], query.percentiles);
        let query: PercentilesQuery =
            serde_json::from_value(json!({"percentiles": "10,150"})).unwrap();
        assert!(query.validate().is_err());
        let query: PercentilesQuery = serde_json::from_value(json!({"percentiles": ""})).unwrap();
        assert!(query.validate().is_err());
        assert!(serde_json::from_value::<PercentilesQuery>(json!({"percentiles": "a"})).is_err());
    }

    #[test]
    fn best_analogs_query() {
        let query: BestAnalogsQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(10, query.number);
        let query: BestAnalogsQuery = serde_json::from_value(json!({"number": 0})).unwrap();
        assert!(query.validate().is_err());
    }

    #[test]
    fn aggregation_query() {
        let query: AggregationQuery = serde_json::from_value(json!({"normalize": 10})).unwrap();
        assert_eq!(Some(10), query.normalize);
        query.validate().unwrap();
        let query: AggregationQuery = serde_json::from_value(json!({"normalize": 0})).unwrap();
        assert!(query.validate().is_err());
        assert!(serde_json::from_value::<AggregationQuery>(json!({"foo": 1})).is_err());
    }

    #[test]
    fn synthesis_path() {
        let path = SynthesisPath {
            region: "adn".to_string(),
            forecast_date: "latest".to_string(),
            percentile: 101,
        };
        assert!(path.validate().is_err());
    }
}
