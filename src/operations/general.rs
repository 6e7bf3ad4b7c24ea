//! Metadata of a region and of its forecast runs.

use super::open_forecast;
use crate::dataset::DataSource;
use crate::error::ForecastError;
use crate::layout;
use crate::models::{
    Configuration, LastForecastDateResult, Method, MethodConfigurations, MethodsAndConfigsResult,
    MethodsResult, Parameters,
};
use crate::operation::Operation;
use crate::types::{ForecastDate, ForecastKey};

use serde::Serialize;

/// Latest forecast run of a region.
#[derive(Clone, Debug, Serialize)]
pub struct LastForecastDate {
    pub region: String,
}

impl Operation for LastForecastDate {
    const NAME: &'static str = "last_forecast_date";
    type Output = LastForecastDateResult;

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let region_path = source.region_path(&self.region)?;
        Ok(LastForecastDateResult {
            parameters: Parameters {
                region: self.region.clone(),
                ..Default::default()
            },
            last_forecast_date: layout::last_forecast_date(&region_path)?,
        })
    }
}

/// Reads the methods of a forecast run with their configurations in file order, sorted by
/// method id.
fn methods_and_configs(
    source: &DataSource,
    region: &str,
    forecast_date: &ForecastDate,
) -> Result<Vec<MethodConfigurations>, ForecastError> {
    let mut methods: Vec<MethodConfigurations> = Vec::new();
    for dataset in open_forecast(source, region, forecast_date, None)? {
        let run = dataset.run();
        let configuration = Configuration {
            id: run.configuration_id.clone(),
            name: run.configuration_name.clone(),
        };
        match methods.iter_mut().find(|m| m.id == run.method_id) {
            Some(method) => method.configurations.push(configuration),
            None => methods.push(MethodConfigurations {
                id: run.method_id.clone(),
                name: run.method_name.clone(),
                configurations: vec![configuration],
            }),
        }
    }
    // Stable, so configurations keep their file order.
    methods.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(methods)
}

/// Distinct methods of a forecast run.
#[derive(Clone, Debug, Serialize)]
pub struct ListMethods {
    pub region: String,
    pub forecast_date: ForecastDate,
}

impl Operation for ListMethods {
    const NAME: &'static str = "list_methods";
    type Output = MethodsResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(ForecastKey::new(self.region.clone(), self.forecast_date))
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        let methods = methods_and_configs(source, &self.region, &self.forecast_date)?
            .into_iter()
            .map(|m| Method {
                id: m.id,
                name: m.name,
            })
            .collect();
        Ok(MethodsResult {
            parameters: Parameters::forecast(&self.region, self.forecast_date),
            methods,
        })
    }
}

/// Methods of a forecast run with their configurations.
#[derive(Clone, Debug, Serialize)]
pub struct ListMethodsAndConfigs {
    pub region: String,
    pub forecast_date: ForecastDate,
}

impl Operation for ListMethodsAndConfigs {
    const NAME: &'static str = "list_methods_and_configs";
    type Output = MethodsAndConfigsResult;

    fn forecast_key(&self) -> Option<ForecastKey> {
        Some(ForecastKey::new(self.region.clone(), self.forecast_date))
    }

    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError> {
        Ok(MethodsAndConfigsResult {
            parameters: Parameters::forecast(&self.region, self.forecast_date),
            methods: methods_and_configs(source, &self.region, &self.forecast_date)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{self, TestData};

    #[test]
    fn last_date() {
        let data = TestData::new();
        let op = LastForecastDate {
            region: "adn".to_string(),
        };
        let result = op.execute(&data.source).unwrap();
        assert_eq!(test_utils::forecast_date(), result.last_forecast_date);
        assert_eq!(None, op.forecast_key());
    }

    #[test]
    fn last_date_unknown_region() {
        let data = TestData::new();
        let op = LastForecastDate {
            region: "nope".to_string(),
        };
        assert!(op.execute(&data.source).unwrap_err().is_not_found());
    }

    #[test]
    fn methods() {
        let data = TestData::new();
        let op = ListMethods {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
        };
        let result = op.execute(&data.source).unwrap();
        let ids: Vec<_> = result.methods.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(vec!["2Z-GFS", "4Zo-CEP"], ids);
        assert_eq!("Method 4Zo-CEP", result.methods[1].name);
    }

    #[test]
    fn methods_and_configs() {
        let data = TestData::new();
        let op = ListMethodsAndConfigs {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
        };
        let result = op.execute(&data.source).unwrap();
        assert_eq!(2, result.methods.len());
        let configurations: Vec<_> = result.methods[1]
            .configurations
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(vec!["Alpes_Tessin", "Cretes"], configurations);
        assert_eq!(
            "Configuration Cretes",
            result.methods[1].configurations[1].name
        );
    }

    #[test]
    fn methods_missing_date() {
        let data = TestData::new();
        let op = ListMethods {
            region: "adn".to_string(),
            forecast_date: ForecastDate::from_ymdh(2020, 1, 1, 0).unwrap(),
        };
        assert!(op.execute(&data.source).unwrap_err().is_not_found());
    }
}
