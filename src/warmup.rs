//! Batch precomputation of the warm cache.
//!
//! A sweep lists the forecast runs of each region with files modified within the last days,
//! plans one task per operation and parameter set, and refreshes the entries that are stale.
//! Failures are logged and counted; they never stop the sweep.

use crate::cli::{WarmOperation, WarmupArgs};
use crate::dataset::{default_opener, DataSource};
use crate::error::ForecastError;
use crate::layout;
use crate::operation::Operation;
use crate::operations::aggregations::{
    EntitiesAnalogValuesPercentile, SeriesSynthesisPerMethod, SeriesSynthesisTotal,
};
use crate::operations::general::{ListMethods, ListMethodsAndConfigs};
use crate::types::{ForecastDate, TargetSelector};
use crate::warm_cache::{Refresh, WarmCacheStore};

use std::time::{Duration, SystemTime};

use rayon::prelude::*;

/// Time between two attempts to take a busy lock.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// One entry to refresh.
#[derive(Clone, Debug)]
pub enum WarmTask {
    SeriesSynthesisPerMethod(SeriesSynthesisPerMethod),
    SeriesSynthesisTotal(SeriesSynthesisTotal),
    ListMethods(ListMethods),
    ListMethodsAndConfigs(ListMethodsAndConfigs),
    EntitiesAnalogValuesPercentile(EntitiesAnalogValuesPercentile),
}

impl WarmTask {
    /// Name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SeriesSynthesisPerMethod(_) => SeriesSynthesisPerMethod::NAME,
            Self::SeriesSynthesisTotal(_) => SeriesSynthesisTotal::NAME,
            Self::ListMethods(_) => ListMethods::NAME,
            Self::ListMethodsAndConfigs(_) => ListMethodsAndConfigs::NAME,
            Self::EntitiesAnalogValuesPercentile(_) => EntitiesAnalogValuesPercentile::NAME,
        }
    }

    fn refresh(&self, store: &WarmCacheStore, source: &DataSource) -> Result<Refresh, ForecastError> {
        match self {
            Self::SeriesSynthesisPerMethod(op) => store.refresh(source, op),
            Self::SeriesSynthesisTotal(op) => store.refresh(source, op),
            Self::ListMethods(op) => store.refresh(source, op),
            Self::ListMethodsAndConfigs(op) => store.refresh(source, op),
            Self::EntitiesAnalogValuesPercentile(op) => store.refresh(source, op),
        }
    }
}

/// Tasks of a sweep, with the number of regions or runs that could not be planned.
#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<WarmTask>,
    pub failed: usize,
}

/// Counts of a sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WarmupSummary {
    /// Tasks planned
    pub planned: usize,
    /// Entries (re)generated
    pub built: usize,
    /// Entries already fresh
    pub up_to_date: usize,
    /// Entries locked by another worker
    pub busy: usize,
    /// Tasks or plans that failed
    pub failed: usize,
    /// Tasks whose forecast run has no files
    pub no_sources: usize,
}

impl WarmupSummary {
    fn add(mut self, other: Self) -> Self {
        self.planned += other.planned;
        self.built += other.built;
        self.up_to_date += other.up_to_date;
        self.busy += other.busy;
        self.failed += other.failed;
        self.no_sources += other.no_sources;
        self
    }
}

/// The warmup driver.
pub struct Warmup {
    args: WarmupArgs,
    source: DataSource,
    store: WarmCacheStore,
}

impl Warmup {
    /// Create a driver reading forecast files from the data directory.
    pub fn new(args: WarmupArgs) -> Self {
        let source = DataSource::new(args.data_dir.clone(), default_opener());
        Self::with_source(args, source)
    }

    /// Create a driver reading forecast files through `source`.
    pub fn with_source(args: WarmupArgs, source: DataSource) -> Self {
        let store = WarmCacheStore::new(args.warm_cache_dir())
            .with_lock_timing(Duration::from_secs(args.lock_timeout), LOCK_POLL);
        Self {
            args,
            source,
            store,
        }
    }

    pub fn store(&self) -> &WarmCacheStore {
        &self.store
    }

    fn regions(&self) -> Result<Vec<String>, ForecastError> {
        if self.args.regions.is_empty() {
            layout::list_regions(self.source.data_dir())
        } else {
            Ok(self.args.regions.clone())
        }
    }

    /// Plans the tasks of the forecast runs with files modified since `days` before `now`.
    pub fn plan(&self, now: SystemTime) -> Plan {
        let mut plan = Plan::default();
        let regions = match self.regions() {
            Ok(regions) => regions,
            Err(error) => {
                tracing::warn!(%error, "failed to list regions");
                plan.failed += 1;
                return plan;
            }
        };
        for region in regions {
            let dates = self
                .source
                .region_path(&region)
                .and_then(|path| layout::recent_forecast_dates(&path, self.args.days, now));
            let dates = match dates {
                Ok(dates) => dates,
                Err(error) => {
                    tracing::warn!(%region, %error, "failed to list recent forecasts");
                    plan.failed += 1;
                    continue;
                }
            };
            tracing::debug!(%region, forecasts = dates.len(), "recent forecasts");
            for forecast_date in dates {
                for function in &self.args.functions {
                    if let Err(error) =
                        self.plan_function(*function, &region, forecast_date, &mut plan.tasks)
                    {
                        tracing::warn!(%region, %forecast_date, %function, %error, "failed to plan");
                        plan.failed += 1;
                    }
                }
            }
        }
        plan
    }

    fn plan_function(
        &self,
        function: WarmOperation,
        region: &str,
        forecast_date: ForecastDate,
        tasks: &mut Vec<WarmTask>,
    ) -> Result<(), ForecastError> {
        let region = region.to_string();
        let percentile = self.args.percentile;
        let normalize = Some(self.args.normalize);
        match function {
            WarmOperation::SeriesSynthesisPerMethod => {
                tasks.push(WarmTask::SeriesSynthesisPerMethod(SeriesSynthesisPerMethod {
                    region,
                    forecast_date,
                    percentile,
                    normalize,
                }))
            }
            WarmOperation::SeriesSynthesisTotal => {
                tasks.push(WarmTask::SeriesSynthesisTotal(SeriesSynthesisTotal {
                    region,
                    forecast_date,
                    percentile,
                    normalize,
                }))
            }
            WarmOperation::ListMethods => tasks.push(WarmTask::ListMethods(ListMethods {
                region,
                forecast_date,
            })),
            WarmOperation::ListMethodsAndConfigs => {
                tasks.push(WarmTask::ListMethodsAndConfigs(ListMethodsAndConfigs {
                    region,
                    forecast_date,
                }))
            }
            WarmOperation::EntitiesAnalogValuesPercentile => {
                let methods = if self.args.methods.is_empty() {
                    ListMethods {
                        region: region.clone(),
                        forecast_date,
                    }
                    .execute(&self.source)?
                    .methods
                    .into_iter()
                    .map(|method| method.id)
                    .collect()
                } else {
                    self.args.methods.clone()
                };
                for method in methods {
                    for lead_time in &self.args.lead_times {
                        tasks.push(WarmTask::EntitiesAnalogValuesPercentile(
                            EntitiesAnalogValuesPercentile {
                                region: region.clone(),
                                forecast_date,
                                method: method.clone(),
                                target: TargetSelector::LeadTime(*lead_time),
                                percentile,
                                normalize,
                            },
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(&self, task: &WarmTask) -> WarmupSummary {
        let mut summary = WarmupSummary {
            planned: 1,
            ..Default::default()
        };
        if self.args.dry_run {
            tracing::info!(operation = task.name(), ?task, "would refresh");
            return summary;
        }
        match task.refresh(&self.store, &self.source) {
            Ok(Refresh::Built) => {
                tracing::info!(operation = task.name(), ?task, "built");
                summary.built = 1;
            }
            Ok(Refresh::UpToDate) => {
                tracing::debug!(operation = task.name(), ?task, "up to date");
                summary.up_to_date = 1;
            }
            Ok(Refresh::NoSources) => {
                tracing::debug!(operation = task.name(), ?task, "no source files, skipped");
                summary.no_sources = 1;
            }
            Err(ForecastError::LockBusy { path }) => {
                tracing::warn!(operation = task.name(), %path, "entry locked by another worker, skipped");
                summary.busy = 1;
            }
            Err(error) => {
                tracing::warn!(operation = task.name(), ?task, %error, "failed to refresh");
                summary.failed = 1;
            }
        }
        summary
    }

    /// Runs one sweep, refreshing stale entries in parallel.
    pub fn run(&self, now: SystemTime) -> WarmupSummary {
        let plan = self.plan(now);
        let summary = plan
            .tasks
            .par_iter()
            .map(|task| self.execute(task))
            .reduce(WarmupSummary::default, WarmupSummary::add);
        WarmupSummary {
            failed: summary.failed + plan.failed,
            ..summary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{self, TestData};

    use clap::Parser;

    fn warmup(data: &TestData, extra: &[&str]) -> Warmup {
        let data_dir = data.dir.path().to_string_lossy().into_owned();
        let mut args = vec!["analogcast-warmup", "--data-dir", data_dir.as_str()];
        args.extend_from_slice(extra);
        let args = WarmupArgs::try_parse_from(args).unwrap();
        Warmup::with_source(args, data.source.clone())
    }

    fn older() -> ForecastDate {
        ForecastDate::from_ymdh(2024, 10, 4, 12).unwrap()
    }

    #[test]
    fn plan_defaults() {
        let data = TestData::new();
        let plan = warmup(&data, &[]).plan(SystemTime::now());
        assert_eq!(0, plan.failed);
        let names: Vec<_> = plan.tasks.iter().map(WarmTask::name).collect();
        assert_eq!(
            vec![
                "series_synthesis_per_method",
                "series_synthesis_total",
                "series_synthesis_per_method",
                "series_synthesis_total",
            ],
            names
        );
        match &plan.tasks[0] {
            WarmTask::SeriesSynthesisPerMethod(op) => {
                assert_eq!(older(), op.forecast_date);
                assert_eq!(90, op.percentile);
                assert_eq!(Some(10), op.normalize);
            }
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn plan_skips_old_forecasts() {
        let data = TestData::new();
        let tomorrow = SystemTime::now() + Duration::from_secs(3 * 24 * 3600);
        let plan = warmup(&data, &["--days", "1"]).plan(tomorrow);
        assert!(plan.tasks.is_empty());
        assert_eq!(0, plan.failed);
    }

    #[test]
    fn plan_entities_of_every_method() {
        let data = TestData::new();
        let plan = warmup(
            &data,
            &[
                "--functions",
                "entities_analog_values_percentile",
                "--lead-times",
                "0,24",
            ],
        )
        .plan(SystemTime::now());
        // One method in the older run, two in the latest.
        assert_eq!(6, plan.tasks.len());
        let latest: Vec<_> = plan
            .tasks
            .iter()
            .filter_map(|task| match task {
                WarmTask::EntitiesAnalogValuesPercentile(op)
                    if op.forecast_date == test_utils::forecast_date() =>
                {
                    Some((op.method.as_str(), op.target))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![
                ("2Z-GFS", TargetSelector::LeadTime(0)),
                ("2Z-GFS", TargetSelector::LeadTime(24)),
                ("4Zo-CEP", TargetSelector::LeadTime(0)),
                ("4Zo-CEP", TargetSelector::LeadTime(24)),
            ],
            latest
        );
    }

    #[test]
    fn plan_unknown_region() {
        let data = TestData::new();
        let plan = warmup(&data, &["--regions", "adn,nope"]).plan(SystemTime::now());
        assert_eq!(4, plan.tasks.len());
        assert_eq!(1, plan.failed);
    }

    #[test]
    fn run_builds_then_skips() {
        let data = TestData::new();
        let warmup = warmup(&data, &[]);
        let summary = warmup.run(SystemTime::now());
        assert_eq!(
            WarmupSummary {
                planned: 4,
                built: 4,
                ..Default::default()
            },
            summary
        );
        let summary = warmup.run(SystemTime::now());
        assert_eq!(4, summary.up_to_date);
        assert_eq!(0, summary.built);

        let op = SeriesSynthesisTotal {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
            percentile: 90,
            normalize: Some(10),
        };
        assert!(warmup.store().lookup(&data.source, &op).is_some());
    }

    #[test]
    fn run_continues_after_failures() {
        let data = TestData::new();
        let summary = warmup(
            &data,
            &[
                "--functions",
                "entities_analog_values_percentile",
                "--methods",
                "4Zo-CEP",
                "--lead-times",
                "0,24",
                "--normalize",
                "10",
            ],
        )
        .run(SystemTime::now());
        // The older run has no 4Zo-CEP files.
        assert_eq!(4, summary.planned);
        assert_eq!(2, summary.built);
        assert_eq!(2, summary.failed);
    }

    #[test]
    fn run_survives_lead_time_overflow() {
        let data = TestData::new();
        let summary = warmup(
            &data,
            &[
                "--functions",
                "entities_analog_values_percentile",
                "--methods",
                "4Zo-CEP",
                "--lead-times",
                "0,4294967295",
            ],
        )
        .run(SystemTime::now());
        assert_eq!(4, summary.planned);
        assert_eq!(1, summary.built);
        assert_eq!(3, summary.failed);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let data = TestData::new();
        let warmup = warmup(&data, &["--dry-run"]);
        let summary = warmup.run(SystemTime::now());
        assert_eq!(4, summary.planned);
        assert_eq!(0, summary.built);
        assert!(!warmup.store().root().exists());
    }

    #[test]
    fn run_skips_locked_entry() {
        let data = TestData::new();
        let warmup = warmup(
            &data,
            &["--functions", "list_methods", "--lock-timeout", "0"],
        );
        let op = ListMethods {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
        };
        let entry = warmup.store().entry_path(&op).unwrap().unwrap();
        let lock = std::path::PathBuf::from(format!("{}.lock", entry.display()));
        std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
        std::fs::write(&lock, "1").unwrap();

        let summary = warmup.run(SystemTime::now());
        assert_eq!(2, summary.planned);
        assert_eq!(1, summary.built);
        assert_eq!(1, summary.busy);
        assert!(lock.exists());
        assert!(!entry.exists());
    }
}
