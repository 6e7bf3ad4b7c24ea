use crate::cli::CommandLineArgs;
use crate::dataset::memory::{MemoryDataset, MemoryOpener};
use crate::dataset::{DataSource, MethodRun};
use crate::layout;
use crate::types::ForecastDate;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::Parser;
use ndarray::{array, Array2};
use tempfile::TempDir;

/// Forecast date of the test data.
pub(crate) fn forecast_date() -> ForecastDate {
    ForecastDate::from_ymdh(2024, 10, 5, 0).unwrap()
}

/// Create a header with stations 1, 2 and 3 and one target date per day from the forecast date.
pub(crate) fn method_run(method: &str, configuration: &str, analogs_nb: Vec<usize>) -> MethodRun {
    let start = forecast_date().datetime();
    MethodRun {
        method_id: method.to_string(),
        method_name: format!("Method {method}"),
        configuration_id: configuration.to_string(),
        configuration_name: format!("Configuration {configuration}"),
        station_ids: vec![1, 2, 3],
        predictand_station_ids: Vec::new(),
        target_dates: (0..analogs_nb.len())
            .map(|i| start + Duration::days(i as i64))
            .collect(),
        analogs_nb,
    }
}

/// Date of analog row `row`.
pub(crate) fn analog_date(row: usize) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1990, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + Duration::days(row as i64)
}

/// Analogy criterion of analog row `row`.
pub(crate) fn analog_criterion(row: usize) -> f64 {
    0.1 * (row + 1) as f64
}

fn reference_axis() -> Vec<f64> {
    vec![2.0, 5.0, 10.0, 20.0]
}

/// Reference values of stations 1, 2 and 3. At 10 years they are 20, 10 and 0.
fn reference_values() -> Array2<f64> {
    array![
        [5.0, 10.0, 20.0, 40.0],
        [2.0, 4.0, 10.0, 20.0],
        [1.0, 2.0, 0.0, 4.0]
    ]
}

fn complete(run: MethodRun, values: Array2<f64>) -> MemoryDataset {
    let rows = run.total_rows();
    MemoryDataset::new(run, values)
        .unwrap()
        .with_analogs(
            (0..rows).map(analog_date).collect(),
            (0..rows).map(analog_criterion).collect(),
        )
        .with_reference(reference_axis(), reference_values())
}

/// A dataset with reference values and no analogs.
pub(crate) fn dataset_with_reference() -> MemoryDataset {
    let run = method_run("4Zo-CEP", "Alpes_Tessin", vec![1]);
    complete(run, Array2::zeros((3, 1)))
}

/// The datasets of one method of the test forecast, in file name order.
///
/// * `4Zo-CEP`: configuration `Alpes_Tessin` forecasts stations 1 and 2, `Cretes` forecasts
///   station 3; two lead times of three analogs.
/// * `2Z-GFS`: configuration `Alpes_Tessin` forecasts every station; three lead times of two
///   analogs.
pub(crate) fn method_datasets(method: &str) -> Vec<MemoryDataset> {
    match method {
        "4Zo-CEP" => {
            let mut alpes = method_run("4Zo-CEP", "Alpes_Tessin", vec![3, 3]);
            alpes.predictand_station_ids = vec![1, 2];
            let alpes_values = array![
                [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
                [10.0, 20.0, 30.0, 0.0, 1.0, 2.0],
                [100.0, 100.0, 100.0, 100.0, 100.0, 100.0]
            ];
            let mut cretes = method_run("4Zo-CEP", "Cretes", vec![3, 3]);
            cretes.predictand_station_ids = vec![3];
            let cretes_values = array![
                [50.0, 50.0, 50.0, 50.0, 50.0, 50.0],
                [50.0, 50.0, 50.0, 50.0, 50.0, 50.0],
                [7.0, 8.0, 9.0, 30.0, 40.0, 50.0]
            ];
            vec![
                complete(alpes, alpes_values),
                complete(cretes, cretes_values),
            ]
        }
        "2Z-GFS" => {
            let run = method_run("2Z-GFS", "Alpes_Tessin", vec![2, 2, 2]);
            let values = array![
                [1.0, 3.0, 2.0, 2.0, 0.0, 0.0],
                [5.0, 7.0, 10.0, 20.0, 1.0, 3.0],
                [0.0, 0.0, 0.0, 0.0, 8.0, 8.0]
            ];
            vec![complete(run, values)]
        }
        other => panic!("no test data for method {other}"),
    }
}

/// Every dataset of the test forecast, in file name order.
pub(crate) fn all_datasets() -> Vec<MemoryDataset> {
    let mut datasets = method_datasets("2Z-GFS");
    datasets.extend(method_datasets("4Zo-CEP"));
    datasets
}

/// A data directory with region `adn` holding the test forecast, plus one older run, backed by
/// in-memory datasets.
pub(crate) struct TestData {
    pub dir: TempDir,
    pub source: DataSource,
}

impl TestData {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("adn");
        let opener = Arc::new(MemoryOpener::new());
        let older = ForecastDate::from_ymdh(2024, 10, 4, 12).unwrap();
        for (date, datasets) in [
            (forecast_date(), all_datasets()),
            (older, method_datasets("2Z-GFS")),
        ] {
            for dataset in datasets {
                let path = Self::file(&region, &date, &dataset.run);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::File::create(&path).unwrap();
                opener.insert(path, dataset);
            }
        }
        let source = DataSource::new(dir.path(), opener);
        Self { dir, source }
    }

    fn file(region: &std::path::Path, date: &ForecastDate, run: &MethodRun) -> PathBuf {
        layout::forecast_dir(region, date).join(format!(
            "{}{}.{}.{}",
            date.file_prefix(),
            run.method_id,
            run.configuration_id,
            layout::FORECAST_EXTENSION
        ))
    }

    /// Path of a file of the test forecast.
    pub fn path(&self, method: &str, configuration: &str) -> PathBuf {
        let run = method_run(method, configuration, Vec::new());
        Self::file(&self.dir.path().join("adn"), &forecast_date(), &run)
    }
}

/// Server arguments over the test data directory, with an in-process request cache.
pub(crate) fn command_line_args(data: &TestData, extra: &[&str]) -> CommandLineArgs {
    let data_dir = data.dir.path().to_string_lossy().into_owned();
    let mut args = vec![
        "analogcast",
        "--data-dir",
        data_dir.as_str(),
        "--cache-backend",
        "local",
        "--thread-limit",
        "2",
    ];
    args.extend_from_slice(extra);
    CommandLineArgs::try_parse_from(args).unwrap()
}
