use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{CatalogClient, CatalogResolver};
use crate::domain::{BoundingBox, DateRange, VariableSelection};
use crate::error::GpmError;
use crate::granule::{DatasetClient, Granule, GranuleData, GranuleFetcher, RetryPolicy};
use crate::grid::{GlobalGrid, GridWindow};
use crate::query::build_query;
use crate::registry::{Mission, Product, Registry, UrlLayout};
use crate::store::{CacheLayout, GranuleStore};

pub const DEFAULT_CONCURRENCY: usize = 30;
pub const DEFAULT_LISTING_CONCURRENCY: usize = 60;
/// Above this many parallel downloads the data server starts refusing connections.
pub const SERVER_CONNECTION_CEILING: usize = 60;

const COORDINATE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub mission: String,
    pub product: String,
    #[serde(default)]
    pub version: Option<u32>,
    pub variables: VariableSelection,
    pub dates: DateRange,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Abort,
    SkipAndReport,
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub concurrency: usize,
    pub listing_concurrency: usize,
    pub retry: RetryPolicy,
    pub deadline: Option<Duration>,
    pub failure_policy: FailurePolicy,
    /// Request every variable the product offers so the cached copy is
    /// complete; only the requested ones are returned.
    pub cache_full_product: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            listing_concurrency: DEFAULT_LISTING_CONCURRENCY,
            retry: RetryPolicy::default(),
            deadline: None,
            failure_policy: FailurePolicy::default(),
            cache_full_product: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedUrls {
    pub dates: Vec<DateUrls>,
    pub failures: Vec<RetrievalFailure>,
}

impl ResolvedUrls {
    pub fn urls(&self) -> impl Iterator<Item = &String> {
        self.dates.iter().flat_map(|entry| entry.urls.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DateUrls {
    pub date: NaiveDate,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalFailure {
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GranuleSummary {
    pub url: String,
    pub cache_path: Utf8PathBuf,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedVariable {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    #[serde(serialize_with = "crate::store::nan_as_null::serialize")]
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub mission: String,
    pub product: String,
    pub version: u32,
    pub times: Vec<NaiveDateTime>,
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub variables: Vec<MergedVariable>,
    pub granules: Vec<GranuleSummary>,
    pub failures: Vec<RetrievalFailure>,
}

impl RetrievalResult {
    pub fn variable(&self, name: &str) -> Option<&MergedVariable> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    pub fn value(&self, variable: &str, time: usize, lon: usize, lat: usize) -> Option<f64> {
        let plane = self.lon.len() * self.lat.len();
        self.variable(variable)
            .and_then(|variable| {
                variable
                    .values
                    .get(time * plane + lon * self.lat.len() + lat)
            })
            .copied()
    }
}

pub struct App<C: CatalogClient, D: DatasetClient, S: GranuleStore> {
    registry: Arc<Registry>,
    layout: CacheLayout,
    catalog: C,
    client: D,
    store: S,
    grid: GlobalGrid,
}

impl<C: CatalogClient, D: DatasetClient, S: GranuleStore> App<C, D, S> {
    pub fn new(
        registry: Arc<Registry>,
        layout: CacheLayout,
        catalog: C,
        client: D,
        store: S,
    ) -> Self {
        Self {
            registry,
            layout,
            catalog,
            client,
            store,
            grid: GlobalGrid::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolve_urls(
        &self,
        request: &RetrievalRequest,
        options: &RetrievalOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ResolvedUrls, GpmError> {
        let (mission, product, _) = self.validate(request, options)?;
        let version = request.version.unwrap_or(mission.default_version());
        self.list_granules(mission, product, version, &request.dates, options, sink)
    }

    pub fn get_data(
        &self,
        request: &RetrievalRequest,
        options: &RetrievalOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RetrievalResult, GpmError> {
        let started = Instant::now();
        let (mission, product, variables) = self.validate(request, options)?;
        let version = request.version.unwrap_or(mission.default_version());
        let window = self.grid.to_indices(&request.bbox)?;

        let resolved =
            self.list_granules(mission, product, version, &request.dates, options, sink)?;
        let mut failures = resolved.failures.clone();
        let urls: Vec<&String> = resolved.urls().collect();
        if urls.is_empty() {
            return Err(GpmError::EmptyRetrieval(format!(
                "no granules found for {} {} between {}",
                mission.name(),
                product.name(),
                request.dates
            )));
        }

        sink.event(ProgressEvent {
            message: format!("phase=Prepare; preparing {} granule requests", urls.len()),
            elapsed: Some(started.elapsed()),
        });
        let fetch_set: Vec<String> = if options.cache_full_product {
            product.variables().to_vec()
        } else {
            variables.clone()
        };
        let granules = urls
            .iter()
            .map(|url| self.plan_granule(url, product, &fetch_set, &variables, &window))
            .collect::<Result<Vec<_>, _>>()?;
        let created = self
            .layout
            .ensure_directories(granules.iter().map(|granule| granule.cache_path.as_path()))?;
        info!(directories = created, root = %self.layout.root(), "cache directories ready");

        sink.event(ProgressEvent {
            message: format!(
                "phase=Download; fetching {} granules with {} workers",
                granules.len(),
                options.concurrency
            ),
            elapsed: Some(started.elapsed()),
        });
        let deadline = options.deadline.map(|limit| Instant::now() + limit);
        let fetcher =
            GranuleFetcher::new(&self.client, &self.store, options.retry).with_deadline(deadline);
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.concurrency)
            .build()
            .map_err(|err| GpmError::WorkerPool(err.to_string()))?;
        let outcomes: Vec<Result<GranuleData, GpmError>> = pool.install(|| {
            granules
                .par_iter()
                .map(|granule| fetcher.fetch(granule))
                .collect()
        });

        let mut fetched = Vec::new();
        for (granule, outcome) in granules.into_iter().zip(outcomes) {
            match outcome {
                Ok(data) => fetched.push((granule, data)),
                Err(err) => match options.failure_policy {
                    FailurePolicy::Abort => return Err(err),
                    FailurePolicy::SkipAndReport => {
                        warn!(url = %granule.url, error = %err, "skipping granule");
                        failures.push(RetrievalFailure {
                            target: granule.url,
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }
        if fetched.is_empty() {
            return Err(GpmError::EmptyRetrieval(format!(
                "all {} granules failed",
                failures.len()
            )));
        }

        sink.event(ProgressEvent {
            message: format!("phase=Merge; merging {} granules", fetched.len()),
            elapsed: Some(started.elapsed()),
        });
        let merged = merge_granules(fetched)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} time steps", merged.times.len()),
            elapsed: Some(started.elapsed()),
        });

        Ok(RetrievalResult {
            mission: mission.name().to_string(),
            product: product.name().to_string(),
            version,
            failures,
            ..merged
        })
    }

    fn validate<'r>(
        &'r self,
        request: &RetrievalRequest,
        options: &RetrievalOptions,
    ) -> Result<(&'r Mission, &'r Product, Vec<String>), GpmError> {
        if options.concurrency == 0 || options.listing_concurrency == 0 {
            return Err(GpmError::InvalidRequest(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if options.concurrency > SERVER_CONNECTION_CEILING {
            warn!(
                concurrency = options.concurrency,
                ceiling = SERVER_CONNECTION_CEILING,
                "concurrency above the server's connection ceiling; expect refused connections"
            );
        }
        request.bbox.validate()?;

        let mission = self.registry.mission(&request.mission)?;
        let product = mission.product(&request.product)?;
        let variables = request.variables.names();
        if variables.is_empty() {
            return Err(GpmError::InvalidRequest(
                "at least one variable is required".to_string(),
            ));
        }
        let unknown: Vec<&str> = variables
            .iter()
            .filter(|name| !product.has_variable(name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(GpmError::InvalidRequest(format!(
                "{} does not provide {}; available: {}",
                product.name(),
                unknown.join(", "),
                product.variables().join(", ")
            )));
        }
        Ok((mission, product, variables))
    }

    fn list_granules(
        &self,
        mission: &Mission,
        product: &Product,
        version: u32,
        dates: &DateRange,
        options: &RetrievalOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ResolvedUrls, GpmError> {
        let days = dates.days();
        let phase = match product.layout() {
            UrlLayout::DayOfYearListing => "Listing",
            UrlLayout::MonthDirect => "Generate",
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase={phase}; getting the granule URLs for {} days",
                days.len()
            ),
            elapsed: None,
        });

        let resolver = CatalogResolver::new(&self.catalog, mission);
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.listing_concurrency)
            .build()
            .map_err(|err| GpmError::WorkerPool(err.to_string()))?;
        let outcomes: Vec<Result<Vec<String>, GpmError>> = pool.install(|| {
            days.par_iter()
                .map(|date| resolver.resolve(product, version, *date))
                .collect()
        });

        let mut resolved = ResolvedUrls {
            dates: Vec::with_capacity(days.len()),
            failures: Vec::new(),
        };
        for (date, outcome) in days.into_iter().zip(outcomes) {
            match outcome {
                Ok(urls) => resolved.dates.push(DateUrls { date, urls }),
                Err(err) => match options.failure_policy {
                    FailurePolicy::Abort => return Err(err),
                    FailurePolicy::SkipAndReport => {
                        warn!(%date, error = %err, "skipping date");
                        resolved.failures.push(RetrievalFailure {
                            target: date.to_string(),
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }
        Ok(resolved)
    }

    fn plan_granule(
        &self,
        url: &str,
        product: &Product,
        fetch_set: &[String],
        variables: &[String],
        window: &GridWindow,
    ) -> Result<Granule, GpmError> {
        Ok(Granule {
            url: url.to_string(),
            query_url: build_query(url, product, fetch_set, window),
            cache_path: self.layout.cache_path_for(url)?,
            variables: variables.to_vec(),
            window: *window,
        })
    }
}

pub fn merge_granules(
    mut granules: Vec<(Granule, GranuleData)>,
) -> Result<RetrievalResult, GpmError> {
    granules.sort_by_key(|(_, data)| data.timestamp);
    let Some((_, first)) = granules.first() else {
        return Err(GpmError::EmptyRetrieval("nothing to merge".to_string()));
    };
    let lon = first.lon.clone();
    let lat = first.lat.clone();
    let plane = lon.len() * lat.len();

    for (granule, data) in &granules {
        if !same_axis(&data.lon, &lon) || !same_axis(&data.lat, &lat) {
            return Err(GpmError::MergeConflict(format!(
                "{} has a {}x{} grid, expected {}x{}",
                granule.url,
                data.lon.len(),
                data.lat.len(),
                lon.len(),
                lat.len()
            )));
        }
    }

    let mut variables: Vec<MergedVariable> = Vec::new();
    for (_, data) in &granules {
        for variable in &data.variables {
            if !variables.iter().any(|merged| merged.name == variable.name) {
                variables.push(MergedVariable {
                    name: variable.name.clone(),
                    attributes: variable.attributes.clone(),
                    values: Vec::with_capacity(plane * granules.len()),
                });
            }
        }
    }
    for merged in &mut variables {
        for (granule, data) in &granules {
            match data.variable(&merged.name) {
                Some(variable) if variable.values.len() == plane => {
                    merged.values.extend_from_slice(&variable.values)
                }
                Some(variable) => {
                    return Err(GpmError::MergeConflict(format!(
                        "{}: {} has {} cells, expected {plane}",
                        granule.url,
                        merged.name,
                        variable.values.len()
                    )));
                }
                None => merged.values.extend(std::iter::repeat_n(f64::NAN, plane)),
            }
        }
    }

    Ok(RetrievalResult {
        mission: String::new(),
        product: String::new(),
        version: 0,
        times: granules.iter().map(|(_, data)| data.timestamp).collect(),
        lon,
        lat,
        variables,
        granules: granules
            .into_iter()
            .map(|(granule, data)| GranuleSummary {
                url: granule.url,
                cache_path: granule.cache_path,
                timestamp: data.timestamp,
            })
            .collect(),
        failures: Vec::new(),
    })
}

fn same_axis(left: &[f64], right: &[f64]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(a, b)| (a - b).abs() <= COORDINATE_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Timelike;

    use super::*;
    use crate::granule::GridVariable;

    fn granule(url: &str) -> Granule {
        let window = GlobalGrid::default()
            .to_indices(&BoundingBox::new(0.0, 0.1, 0.0, 0.1).unwrap())
            .unwrap();
        Granule {
            url: url.to_string(),
            query_url: url.to_string(),
            cache_path: Utf8PathBuf::from(format!("/cache/{url}.json")),
            variables: vec!["precipitationCal".to_string()],
            window,
        }
    }

    fn data(hour: u32, variables: &[(&str, f64)]) -> GranuleData {
        GranuleData {
            timestamp: NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap()
                .and_hms_opt(hour, 29, 59)
                .unwrap(),
            lon: vec![0.05, 0.15],
            lat: vec![0.05],
            variables: variables
                .iter()
                .map(|(name, value)| GridVariable {
                    name: name.to_string(),
                    attributes: BTreeMap::new(),
                    values: vec![*value; 2],
                })
                .collect(),
        }
    }

    #[test]
    fn merge_orders_by_timestamp_and_fills_gaps() {
        let merged = merge_granules(vec![
            (granule("t2"), data(2, &[("precipitationCal", 2.0)])),
            (granule("t1"), data(1, &[("precipitationCal", 1.0), ("HQprecipitation", 9.0)])),
            (granule("t3"), data(3, &[("precipitationCal", 3.0)])),
        ])
        .unwrap();

        let hours: Vec<u32> = merged
            .times
            .iter()
            .map(|time| time.hour())
            .collect();
        assert_eq!(hours, vec![1, 2, 3]);
        assert_eq!(merged.granules[0].url, "t1");
        assert_eq!(merged.value("precipitationCal", 0, 1, 0), Some(1.0));
        assert_eq!(merged.value("precipitationCal", 2, 0, 0), Some(3.0));
        assert_eq!(merged.value("HQprecipitation", 0, 0, 0), Some(9.0));
        assert!(merged.value("HQprecipitation", 1, 0, 0).unwrap().is_nan());
    }

    #[test]
    fn merge_rejects_mismatched_grids() {
        let mut shifted = data(2, &[("precipitationCal", 2.0)]);
        shifted.lon = vec![0.15, 0.25];
        assert_matches!(
            merge_granules(vec![
                (granule("t1"), data(1, &[("precipitationCal", 1.0)])),
                (granule("t2"), shifted),
            ]),
            Err(GpmError::MergeConflict(_))
        );
    }
}
