//! Forecast statistics HTTP API

use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::error::ForecastError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::{
    AggregationQuery, AnalogCriteriaResult, AnalogDatesResult, AnalogValuesPercentilesResult,
    AnalogValuesResult, AnalogsResult, BestAnalogsQuery, EntitiesPercentilePath,
    EntitiesPercentileResult, EntityPath, EntityTargetDatePath, ForecastPath,
    LastForecastDateResult, MethodsAndConfigsResult, MethodsResult, PercentilesQuery,
    ReferenceValuesResult, RegionPath, SeriesValuesBestResult, SeriesValuesPercentilesResult,
    SynthesisPath, SynthesisPerMethodResult, SynthesisTotalResult, TargetDatePath,
};
use crate::operations::aggregations::{
    EntitiesAnalogValuesPercentile, SeriesSynthesisPerMethod, SeriesSynthesisTotal,
};
use crate::operations::forecasts::{
    AnalogCriteria, AnalogDates, AnalogValues, AnalogValuesPercentiles, Analogs,
    ReferenceValues, SeriesAnalogValuesBest, SeriesAnalogValuesPercentiles,
};
use crate::operations::general::{LastForecastDate, ListMethods, ListMethodsAndConfigs};
use crate::operations::FileSelector;
use crate::types::{parse_hourly, TargetSelector};
use crate::validated_query::ValidatedQuery;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;
use validator::Validate;

/// Result of a request handler.
type ApiResult<T> = Result<Json<T>, ForecastError>;

/// Returns a [axum::Router] with all the API routes.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    fn general() -> Router<SharedAppState> {
        Router::new()
            .route("/:region/last-forecast-date", get(last_forecast_date))
            .route("/:region/:forecast_date/methods", get(methods))
            .route(
                "/:region/:forecast_date/methods-and-configs",
                get(methods_and_configs),
            )
    }

    fn forecasts() -> Router<SharedAppState> {
        const FILE: &str = "/:region/:forecast_date/:method/:configuration";
        Router::new()
            .route(
                &format!("{FILE}/:entity/reference-values"),
                get(reference_values),
            )
            .route(
                &format!("{FILE}/:target_date/analog-dates"),
                get(analog_dates),
            )
            .route(
                &format!("{FILE}/:target_date/analogy-criteria"),
                get(analog_criteria),
            )
            .route(&format!("{FILE}/:entity/:target_date/analogs"), get(analogs))
            .route(
                &format!("{FILE}/:entity/:target_date/analog-values"),
                get(analog_values),
            )
            .route(
                &format!("{FILE}/:entity/:target_date/analog-values-percentiles"),
                get(analog_values_percentiles),
            )
            .route(
                &format!("{FILE}/:entity/series-analog-values-best"),
                get(series_analog_values_best),
            )
            .route(
                &format!("{FILE}/:entity/series-analog-values-percentiles"),
                get(series_analog_values_percentiles),
            )
    }

    fn aggregations() -> Router<SharedAppState> {
        Router::new()
            .route(
                "/:region/:forecast_date/:method/:lead_time/entities-analog-values-percentile/:percentile",
                get(entities_analog_values_percentile),
            )
            .route(
                "/:region/:forecast_date/series-synthesis-per-method/:percentile",
                get(series_synthesis_per_method),
            )
            .route(
                "/:region/:forecast_date/series-synthesis-total/:percentile",
                get(series_synthesis_total),
            )
    }

    Router::new()
        .nest("/general", general())
        .nest("/forecasts", forecasts())
        .nest("/aggregations", aggregations())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .on_request(request_counter)
                    .on_response(record_response_metrics),
            ),
        )
        .with_state(state)
        .route("/metrics", get(metrics_handler))
}

/// The API service type
///
/// The service is a [NormalizePath] wrapping a [Router], so that trailing slashes are ignored.
pub type Service = NormalizePath<Router>;

/// Returns a [crate::app::Service] with all the API routes.
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn service(args: &CommandLineArgs) -> Service {
    let state = Arc::new(AppState::new(args));
    let router = router(state);
    NormalizePathLayer::trim_trailing_slash().layer(router)
}

/// Builds the selector of a forecast file, resolving a `latest` forecast date.
async fn file_selector(
    state: &AppState,
    region: String,
    forecast_date: &str,
    method: String,
    configuration: String,
) -> Result<FileSelector, ForecastError> {
    let forecast_date = state.resolve_forecast_date(&region, forecast_date).await?;
    Ok(FileSelector {
        region,
        forecast_date,
        method,
        configuration,
    })
}

async fn last_forecast_date(
    State(state): State<SharedAppState>,
    Path(path): Path<RegionPath>,
) -> ApiResult<LastForecastDateResult> {
    let op = LastForecastDate {
        region: path.region,
    };
    state.run(op).await.map(Json)
}

async fn methods(
    State(state): State<SharedAppState>,
    Path(path): Path<ForecastPath>,
) -> ApiResult<MethodsResult> {
    let forecast_date = state
        .resolve_forecast_date(&path.region, &path.forecast_date)
        .await?;
    let op = ListMethods {
        region: path.region,
        forecast_date,
    };
    state.run(op).await.map(Json)
}

async fn methods_and_configs(
    State(state): State<SharedAppState>,
    Path(path): Path<ForecastPath>,
) -> ApiResult<MethodsAndConfigsResult> {
    let forecast_date = state
        .resolve_forecast_date(&path.region, &path.forecast_date)
        .await?;
    let op = ListMethodsAndConfigs {
        region: path.region,
        forecast_date,
    };
    state.run(op).await.map(Json)
}

async fn reference_values(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityPath>,
) -> ApiResult<ReferenceValuesResult> {
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = ReferenceValues {
        file,
        entity: path.entity,
    };
    state.run(op).await.map(Json)
}

async fn analog_dates(
    State(state): State<SharedAppState>,
    Path(path): Path<TargetDatePath>,
) -> ApiResult<AnalogDatesResult> {
    let target_date = parse_hourly(&path.target_date)?;
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    state.run(AnalogDates { file, target_date }).await.map(Json)
}

async fn analog_criteria(
    State(state): State<SharedAppState>,
    Path(path): Path<TargetDatePath>,
) -> ApiResult<AnalogCriteriaResult> {
    let target_date = parse_hourly(&path.target_date)?;
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    state
        .run(AnalogCriteria { file, target_date })
        .await
        .map(Json)
}

async fn analogs(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityTargetDatePath>,
) -> ApiResult<AnalogsResult> {
    let target_date = parse_hourly(&path.target_date)?;
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = Analogs {
        file,
        entity: path.entity,
        target_date,
    };
    state.run(op).await.map(Json)
}

async fn analog_values(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityTargetDatePath>,
) -> ApiResult<AnalogValuesResult> {
    let target_date = parse_hourly(&path.target_date)?;
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = AnalogValues {
        file,
        entity: path.entity,
        target_date,
    };
    state.run(op).await.map(Json)
}

async fn analog_values_percentiles(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityTargetDatePath>,
    ValidatedQuery(query): ValidatedQuery<PercentilesQuery>,
) -> ApiResult<AnalogValuesPercentilesResult> {
    let target_date = parse_hourly(&path.target_date)?;
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = AnalogValuesPercentiles {
        file,
        entity: path.entity,
        target_date,
        percentiles: query.percentiles,
    };
    state.run(op).await.map(Json)
}

async fn series_analog_values_best(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityPath>,
    ValidatedQuery(query): ValidatedQuery<BestAnalogsQuery>,
) -> ApiResult<SeriesValuesBestResult> {
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = SeriesAnalogValuesBest {
        file,
        entity: path.entity,
        number: query.number,
    };
    state.run(op).await.map(Json)
}

async fn series_analog_values_percentiles(
    State(state): State<SharedAppState>,
    Path(path): Path<EntityPath>,
    ValidatedQuery(query): ValidatedQuery<PercentilesQuery>,
) -> ApiResult<SeriesValuesPercentilesResult> {
    let file = file_selector(
        &state,
        path.region,
        &path.forecast_date,
        path.method,
        path.configuration,
    )
    .await?;
    let op = SeriesAnalogValuesPercentiles {
        file,
        entity: path.entity,
        percentiles: query.percentiles,
    };
    state.run(op).await.map(Json)
}

async fn entities_analog_values_percentile(
    State(state): State<SharedAppState>,
    Path(path): Path<EntitiesPercentilePath>,
    ValidatedQuery(query): ValidatedQuery<AggregationQuery>,
) -> ApiResult<EntitiesPercentileResult> {
    path.validate()?;
    let target = path.lead_time.parse::<TargetSelector>()?;
    let forecast_date = state
        .resolve_forecast_date(&path.region, &path.forecast_date)
        .await?;
    let op = EntitiesAnalogValuesPercentile {
        region: path.region,
        forecast_date,
        method: path.method,
        target,
        percentile: path.percentile,
        normalize: query.normalize,
    };
    state.run(op).await.map(Json)
}

async fn series_synthesis_per_method(
    State(state): State<SharedAppState>,
    Path(path): Path<SynthesisPath>,
    ValidatedQuery(query): ValidatedQuery<AggregationQuery>,
) -> ApiResult<SynthesisPerMethodResult> {
    path.validate()?;
    let forecast_date = state
        .resolve_forecast_date(&path.region, &path.forecast_date)
        .await?;
    let op = SeriesSynthesisPerMethod {
        region: path.region,
        forecast_date,
        percentile: path.percentile,
        normalize: query.normalize,
    };
    state.run(op).await.map(Json)
}

async fn series_synthesis_total(
    State(state): State<SharedAppState>,
    Path(path): Path<SynthesisPath>,
    ValidatedQuery(query): ValidatedQuery<AggregationQuery>,
) -> ApiResult<SynthesisTotalResult> {
    path.validate()?;
    let forecast_date = state
        .resolve_forecast_date(&path.region, &path.forecast_date)
        .await?;
    let op = SeriesSynthesisTotal {
        region: path.region,
        forecast_date,
        percentile: path.percentile,
        normalize: query.normalize,
    };
    state.run(op).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{self, TestData};

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `oneshot`

    fn test_router(data: &TestData) -> Router {
        let args = test_utils::command_line_args(data, &["--use-warm-cache", "false"]);
        router(Arc::new(AppState::with_source(&args, data.source.clone())))
    }

    async fn get_response(data: &TestData, uri: &str) -> Response {
        test_router(data)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn get_json(data: &TestData, uri: &str) -> (StatusCode, Value) {
        let response = get_response(data, uri).await;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn last_forecast_date() {
        let data = TestData::new();
        let (status, body) = get_json(&data, "/general/adn/last-forecast-date").await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!("2024-10-05T00"), body["last_forecast_date"]);
        assert_eq!(json!("adn"), body["parameters"]["region"]);
    }

    #[tokio::test]
    async fn methods_of_latest_forecast() {
        let data = TestData::new();
        let (status, body) = get_json(&data, "/general/adn/latest/methods").await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!("2024-10-05T00"), body["parameters"]["forecast_date"]);
        assert_eq!(
            json!([
                {"id": "2Z-GFS", "name": "Method 2Z-GFS"},
                {"id": "4Zo-CEP", "name": "Method 4Zo-CEP"}
            ]),
            body["methods"]
        );
    }

    #[tokio::test]
    async fn methods_and_configs() {
        let data = TestData::new();
        let (status, body) =
            get_json(&data, "/general/adn/2024-10-05T00/methods-and-configs").await;
        assert_eq!(StatusCode::OK, status);
        let configurations = &body["methods"][1]["configurations"];
        assert_eq!(json!("Alpes_Tessin"), configurations[0]["id"]);
        assert_eq!(json!("Cretes"), configurations[1]["id"]);
    }

    #[tokio::test]
    async fn analog_dates() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/forecasts/adn/2024-10-05/4Zo-CEP/Cretes/2024-10-06/analog-dates",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(3, body["analog_dates"].as_array().unwrap().len());
        assert_eq!(
            json!("2024-10-06T00:00:00"),
            body["parameters"]["target_date"]
        );
    }

    #[tokio::test]
    async fn analog_values_percentiles() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/forecasts/adn/2024-10-05/4Zo-CEP/Cretes/3/2024-10-05/analog-values-percentiles?percentiles=50,90",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!([50, 90]), body["percentiles"]);
        assert_eq!(2, body["values"].as_array().unwrap().len());
    }

    #[tokio::test]
    async fn series_best_rejects_zero_number() {
        let data = TestData::new();
        let response = get_response(
            &data,
            "/forecasts/adn/2024-10-05/4Zo-CEP/Cretes/3/series-analog-values-best?number=0",
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn entities_percentile_by_lead_time() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/aggregations/adn/2024-10-05/4Zo-CEP/24/entities-analog-values-percentile/50",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!([1, 2, 3]), body["entity_ids"]);
        assert_eq!(json!([5.0, 1.0, 40.0]), body["values"]);
    }

    #[tokio::test]
    async fn entities_percentile_lead_time_out_of_range() {
        let data = TestData::new();
        let response = get_response(
            &data,
            "/aggregations/adn/2024-10-05/4Zo-CEP/4294967295/entities-analog-values-percentile/50",
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn entities_percentile_normalized() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/aggregations/adn/2024-10-05/4Zo-CEP/0/entities-analog-values-percentile/50?normalize=10",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!(10), body["parameters"]["normalize"]);
        assert!(body["values"][2].is_null());
    }

    #[tokio::test]
    async fn synthesis_total() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/aggregations/adn/latest/series-synthesis-total/50",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        let series = &body["series_percentiles"][0];
        assert_eq!(json!(24), series["time_step"]);
        assert_eq!(json!([20.0, 40.0, 8.0]), series["values"]);
    }

    #[tokio::test]
    async fn synthesis_per_method() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/aggregations/adn/2024-10-05T00/series-synthesis-per-method/50",
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!("2Z-GFS"), body["series_percentiles"][0]["method_id"]);
        assert_eq!(
            json!([20.0, 40.0]),
            body["series_percentiles"][1]["values"]
        );
    }

    #[tokio::test]
    async fn invalid_percentile() {
        let data = TestData::new();
        let (status, body) = get_json(
            &data,
            "/aggregations/adn/2024-10-05/series-synthesis-total/101",
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!(json!("request data is not valid"), body["error"]["message"]);
    }

    #[tokio::test]
    async fn invalid_normalize() {
        let data = TestData::new();
        let response = get_response(
            &data,
            "/aggregations/adn/2024-10-05/series-synthesis-total/90?normalize=0",
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let response = get_response(
            &data,
            "/aggregations/adn/2024-10-05/series-synthesis-total/90?foo=1",
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn invalid_forecast_date() {
        let data = TestData::new();
        let (status, _) = get_json(&data, "/general/adn/yesterday/methods").await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
    }

    #[tokio::test]
    async fn unknown_region() {
        let data = TestData::new();
        let (status, body) = get_json(&data, "/general/nope/latest/methods").await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn unknown_route() {
        let data = TestData::new();
        let response = get_response(&data, "/general").await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn metrics_route() {
        let data = TestData::new();
        let response = get_response(&data, "/metrics").await;
        assert_eq!(StatusCode::OK, response.status());
    }
}
