use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dap::{DapArray, DapDataset, DapType};
use crate::error::GpmError;
use crate::grid::GridWindow;
use crate::store::GranuleStore;

const DIMENSION_ALIASES: [(&str, &str); 6] = [
    ("nlon", "lon"),
    ("nlat", "lat"),
    ("longitude", "lon"),
    ("latitude", "lat"),
    ("Longitude", "lon"),
    ("Latitude", "lat"),
];

pub trait DatasetClient: Send + Sync {
    fn open(&self, query_url: &str) -> Result<DapDataset, GpmError>;
}

impl<T: DatasetClient + ?Sized> DatasetClient for &T {
    fn open(&self, query_url: &str) -> Result<DapDataset, GpmError> {
        (**self).open(query_url)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Granule {
    pub url: String,
    pub query_url: String,
    pub cache_path: Utf8PathBuf,
    pub variables: Vec<String>,
    pub window: GridWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleData {
    pub timestamp: NaiveDateTime,
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub variables: Vec<GridVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridVariable {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    /// Row-major over `(lon, lat)`; missing cells are NaN.
    #[serde(with = "crate::store::nan_as_null")]
    pub values: Vec<f64>,
}

impl GranuleData {
    pub fn variable(&self, name: &str) -> Option<&GridVariable> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    pub fn value(&self, variable: &str, lon: usize, lat: usize) -> Option<f64> {
        self.variable(variable)
            .and_then(|variable| variable.values.get(lon * self.lat.len() + lat))
            .copied()
    }

    pub fn select(mut self, names: &[String]) -> Self {
        self.variables
            .retain(|variable| names.iter().any(|name| *name == variable.name));
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

pub struct GranuleFetcher<'a, D: DatasetClient, S: GranuleStore> {
    client: &'a D,
    store: &'a S,
    retry: RetryPolicy,
    deadline: Option<Instant>,
}

impl<'a, D: DatasetClient, S: GranuleStore> GranuleFetcher<'a, D, S> {
    pub fn new(client: &'a D, store: &'a S, retry: RetryPolicy) -> Self {
        Self {
            client,
            store,
            retry,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn fetch(&self, granule: &Granule) -> Result<GranuleData, GpmError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(GpmError::GranuleFetchFailed {
                        url: granule.url.clone(),
                        attempts: attempt,
                        reason: "retrieval deadline exceeded".to_string(),
                    });
                }
            }
            attempt += 1;
            match self.fetch_once(granule) {
                Ok(data) => return Ok(data.select(&granule.variables)),
                Err(err) if attempt >= max_attempts => {
                    return Err(GpmError::GranuleFetchFailed {
                        url: granule.url.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(
                        url = %granule.url,
                        attempt,
                        error = %err,
                        "granule fetch failed; retrying"
                    );
                    thread::sleep(self.retry.delay);
                }
            }
        }
    }

    fn fetch_once(&self, granule: &Granule) -> Result<GranuleData, GpmError> {
        debug!(url = %granule.query_url, "opening granule");
        let dataset = self.client.open(&granule.query_url)?;
        let data = reshape(dataset, &granule.window)?;
        if let Some(missing) = granule
            .variables
            .iter()
            .find(|name| data.variable(name).is_none())
        {
            return Err(GpmError::Metadata(format!("{missing} missing from response")));
        }
        if self.store.exists(&granule.cache_path) {
            debug!(path = %granule.cache_path, "cache file present; skipping write");
        } else {
            self.store.write(&granule.cache_path, &data)?;
            info!(path = %granule.cache_path, "cached granule");
        }
        Ok(data)
    }
}

pub fn reshape(mut dataset: DapDataset, window: &GridWindow) -> Result<GranuleData, GpmError> {
    rename_dimensions(&mut dataset);

    let lon_axis = coordinate(&dataset, "lon")?;
    let lat_axis = coordinate(&dataset, "lat")?;
    let lon_keep: Vec<usize> = (0..lon_axis.len())
        .filter(|index| window.contains_lon(lon_axis[*index]))
        .collect();
    let lat_keep: Vec<usize> = (0..lat_axis.len())
        .filter(|index| window.contains_lat(lat_axis[*index]))
        .collect();
    if lon_keep.is_empty() || lat_keep.is_empty() {
        return Err(GpmError::Metadata(
            "response grid does not intersect the requested window".to_string(),
        ));
    }

    let timestamp = authoritative_timestamp(&dataset)?;

    let mut variables = Vec::new();
    for array in &dataset.arrays {
        let (Some(lon_dim), Some(lat_dim)) = (array.dim_index("lon"), array.dim_index("lat"))
        else {
            continue;
        };
        let attributes = dataset
            .attributes
            .get(&array.name)
            .cloned()
            .unwrap_or_default();
        let values = slice_variable(array, lon_dim, lat_dim, &lon_keep, &lat_keep, &attributes)?;
        variables.push(GridVariable {
            name: array.name.clone(),
            attributes,
            values,
        });
    }

    Ok(GranuleData {
        timestamp,
        lon: lon_keep.iter().map(|index| lon_axis[*index]).collect(),
        lat: lat_keep.iter().map(|index| lat_axis[*index]).collect(),
        variables,
    })
}

fn rename_dimensions(dataset: &mut DapDataset) {
    let canonical = |name: &str| {
        DIMENSION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, canonical)| canonical.to_string())
    };
    for array in &mut dataset.arrays {
        for dim in &mut array.dims {
            if let Some(renamed) = dim.name.as_deref().and_then(canonical) {
                dim.name = Some(renamed);
            }
        }
        if let Some(renamed) = canonical(&array.name) {
            if let Some(attrs) = dataset.attributes.remove(&array.name) {
                dataset.attributes.insert(renamed.clone(), attrs);
            }
            array.name = renamed;
        }
    }
}

fn coordinate(dataset: &DapDataset, name: &str) -> Result<Vec<f64>, GpmError> {
    let array = dataset
        .array(name)
        .ok_or_else(|| GpmError::Metadata(format!("response has no {name} coordinate")))?;
    if array.dims.len() != 1 {
        return Err(GpmError::Metadata(format!(
            "{name} coordinate is not one-dimensional"
        )));
    }
    Ok(array
        .data
        .iter()
        .map(|value| (value * 1000.0).round() / 1000.0)
        .collect())
}

fn slice_variable(
    array: &DapArray,
    lon_dim: usize,
    lat_dim: usize,
    lon_keep: &[usize],
    lat_keep: &[usize],
    attributes: &BTreeMap<String, String>,
) -> Result<Vec<f64>, GpmError> {
    for (axis, dim) in array.dims.iter().enumerate() {
        if axis != lon_dim && axis != lat_dim && dim.size != 1 {
            return Err(GpmError::Metadata(format!(
                "{}: expected a single step along {}, found {}",
                array.name,
                dim.name.as_deref().unwrap_or("?"),
                dim.size
            )));
        }
    }

    let mut strides = vec![1usize; array.dims.len()];
    for axis in (0..array.dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * array.dims[axis + 1].size;
    }

    let fill_values: Vec<f64> = ["_FillValue", "missing_value"]
        .iter()
        .filter_map(|key| attributes.get(*key))
        .filter_map(|value| value.split(',').next()?.trim().parse::<f64>().ok())
        .collect();
    let is_fill = |value: f64| {
        fill_values.iter().any(|fill| match array.dtype {
            DapType::Float32 => (value as f32) == (*fill as f32),
            _ => value == *fill,
        })
    };

    let mut values = Vec::with_capacity(lon_keep.len() * lat_keep.len());
    for lon in lon_keep {
        for lat in lat_keep {
            let offset = lon * strides[lon_dim] + lat * strides[lat_dim];
            let value = *array.data.get(offset).ok_or_else(|| {
                GpmError::Metadata(format!("{}: data shorter than its dimensions", array.name))
            })?;
            values.push(if is_fill(value) { f64::NAN } else { value });
        }
    }
    Ok(values)
}

pub fn parse_file_header(text: &str) -> BTreeMap<String, String> {
    text.replace("\\n", "\n")
        .split([';', '\n'])
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

pub fn parse_instant(value: &str) -> Result<NaiveDateTime, GpmError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.naive_utc());
    }
    let naive = trimmed.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|err| GpmError::Metadata(format!("invalid timestamp {value}: {err}")))
}

pub fn authoritative_timestamp(dataset: &DapDataset) -> Result<NaiveDateTime, GpmError> {
    if let Some(header) = dataset.global_attribute("FileHeader") {
        if let Some(stop) = parse_file_header(header).get("StopTime") {
            return parse_instant(stop);
        }
    }
    if let Some(stop) = dataset.global_attribute("StopTime") {
        return parse_instant(stop);
    }
    match (
        dataset.global_attribute("EndDate"),
        dataset.global_attribute("EndTime"),
    ) {
        (Some(date), Some(time)) => parse_instant(&format!("{}T{}", date.trim(), time.trim())),
        _ => Err(GpmError::Metadata(
            "no StopTime in file header and no EndDate/EndTime attributes".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use camino::Utf8Path;

    use super::*;
    use crate::dap::{AttributeTable, Dimension};
    use crate::domain::BoundingBox;
    use crate::grid::GlobalGrid;

    fn window() -> GridWindow {
        GlobalGrid::default()
            .to_indices(&BoundingBox::new(-0.2, 0.1, 10.0, 10.2).unwrap())
            .unwrap()
    }

    fn sample_dataset(stop: &str) -> DapDataset {
        let mut attributes = AttributeTable::new();
        attributes.insert(
            "HDF5_GLOBAL".to_string(),
            BTreeMap::from([(
                "FileHeader".to_string(),
                format!("StartTime=2020-01-01T00:00:00.000Z;\nStopTime={stop};\n"),
            )]),
        );
        attributes.insert(
            "precipitationCal".to_string(),
            BTreeMap::from([
                ("_FillValue".to_string(), "-9999.9".to_string()),
                ("units".to_string(), "mm/hr".to_string()),
            ]),
        );
        // Stored as (time, nlat, nlon) to exercise rename and transpose.
        let lats = vec![-0.25, -0.15, -0.05, 0.05];
        let lons = vec![9.95, 10.05, 10.15];
        let mut data = Vec::new();
        for lat in 0..lats.len() {
            for lon in 0..lons.len() {
                data.push((lat * 10 + lon) as f64);
            }
        }
        data[0] = f64::from(-9999.9f32);
        DapDataset {
            name: "granule".to_string(),
            arrays: vec![
                DapArray {
                    name: "precipitationCal".to_string(),
                    dtype: DapType::Float32,
                    dims: vec![
                        Dimension {
                            name: Some("time".to_string()),
                            size: 1,
                        },
                        Dimension {
                            name: Some("nlat".to_string()),
                            size: lats.len(),
                        },
                        Dimension {
                            name: Some("nlon".to_string()),
                            size: lons.len(),
                        },
                    ],
                    data,
                },
                DapArray {
                    name: "nlon".to_string(),
                    dtype: DapType::Float32,
                    dims: vec![Dimension {
                        name: Some("nlon".to_string()),
                        size: lons.len(),
                    }],
                    data: lons,
                },
                DapArray {
                    name: "nlat".to_string(),
                    dtype: DapType::Float32,
                    dims: vec![Dimension {
                        name: Some("nlat".to_string()),
                        size: lats.len(),
                    }],
                    data: lats,
                },
            ],
            attributes,
        }
    }

    #[test]
    fn reshape_renames_slices_and_masks() {
        let data = reshape(sample_dataset("2020-01-01T00:29:59.999Z"), &window()).unwrap();
        // -0.2 sits between -0.25 and -0.15 and resolves to the lower cell.
        assert_eq!(data.lat, vec![-0.25, -0.15, -0.05, 0.05]);
        assert_eq!(data.lon, vec![9.95, 10.05, 10.15]);
        assert_eq!(
            data.timestamp,
            parse_instant("2020-01-01T00:29:59.999").unwrap()
        );
        let precip = data.variable("precipitationCal").unwrap();
        assert_eq!(precip.attributes["units"], "mm/hr");
        assert!(data.value("precipitationCal", 0, 0).unwrap().is_nan());
        // (lon=2, lat=1) came from source (lat=1, lon=2) = 12.
        assert_eq!(data.value("precipitationCal", 2, 1), Some(12.0));
    }

    #[test]
    fn header_parsing_tolerates_escaped_newlines() {
        let header =
            parse_file_header("AlgorithmID=3IMERGHH;\\nStopTime=2020-01-01T00:29:59.999Z;\\n");
        assert_eq!(header["StopTime"], "2020-01-01T00:29:59.999Z");
        assert_eq!(header["AlgorithmID"], "3IMERGHH");
    }

    #[test]
    fn missing_stop_time_is_metadata_error() {
        let mut dataset = sample_dataset("x");
        dataset.attributes.remove("HDF5_GLOBAL");
        assert_matches!(authoritative_timestamp(&dataset), Err(GpmError::Metadata(_)));

        dataset.attributes.insert(
            "NC_GLOBAL".to_string(),
            BTreeMap::from([
                ("EndDate".to_string(), "2020-01-01".to_string()),
                ("EndTime".to_string(), "23:59:59.999Z".to_string()),
            ]),
        );
        assert_eq!(
            authoritative_timestamp(&dataset).unwrap(),
            parse_instant("2020-01-01T23:59:59.999").unwrap()
        );
    }

    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    impl DatasetClient for FlakyClient {
        fn open(&self, _query_url: &str) -> Result<DapDataset, GpmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(GpmError::Http("connection reset".to_string()));
            }
            Ok(sample_dataset("2020-01-01T00:29:59.999Z"))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        writes: Mutex<Vec<Utf8PathBuf>>,
    }

    impl GranuleStore for MemoryStore {
        fn exists(&self, path: &Utf8Path) -> bool {
            self.writes.lock().unwrap().iter().any(|written| written == path)
        }

        fn write(&self, path: &Utf8Path, _data: &GranuleData) -> Result<(), GpmError> {
            self.writes.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn granule() -> Granule {
        Granule {
            url: "https://host/opendap/a.HDF5".to_string(),
            query_url: "https://host/opendap/a.HDF5?precipitationCal".to_string(),
            cache_path: Utf8PathBuf::from("/cache/a.json"),
            variables: vec!["precipitationCal".to_string()],
            window: window(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn transient_failures_are_retried() {
        let client = FlakyClient {
            failures: 3,
            calls: AtomicU32::new(0),
        };
        let store = MemoryStore::default();
        let fetcher = GranuleFetcher::new(&client, &store, quick_retry());
        let data = fetcher.fetch(&granule()).unwrap();
        assert_eq!(data.variables.len(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn persistent_failure_exhausts_attempts() {
        let client = FlakyClient {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let store = MemoryStore::default();
        let fetcher = GranuleFetcher::new(&client, &store, quick_retry());
        let err = fetcher.fetch(&granule()).unwrap_err();
        assert_matches!(err, GpmError::GranuleFetchFailed { attempts: 4, .. });
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert!(store.writes.lock().unwrap().is_empty());
    }

    struct OffGridClient;

    impl DatasetClient for OffGridClient {
        fn open(&self, _query_url: &str) -> Result<DapDataset, GpmError> {
            let mut dataset = sample_dataset("2020-01-01T00:29:59.999Z");
            dataset.arrays[0].dims[1].name = Some("x".to_string());
            Ok(dataset)
        }
    }

    #[test]
    fn requested_variable_missing_after_reshape_is_retried_then_fails() {
        let store = MemoryStore::default();
        let fetcher = GranuleFetcher::new(&OffGridClient, &store, quick_retry());
        assert_matches!(
            fetcher.fetch(&granule()),
            Err(GpmError::GranuleFetchFailed { attempts: 4, reason, .. })
                if reason.contains("precipitationCal")
        );
        assert!(store.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn existing_cache_file_is_not_rewritten() {
        let client = FlakyClient {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let store = MemoryStore::default();
        let fetcher = GranuleFetcher::new(&client, &store, quick_retry());
        fetcher.fetch(&granule()).unwrap();
        fetcher.fetch(&granule()).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn expired_deadline_stops_before_fetching() {
        let client = FlakyClient {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let store = MemoryStore::default();
        let fetcher = GranuleFetcher::new(&client, &store, quick_retry())
            .with_deadline(Some(Instant::now()));
        let err = fetcher.fetch(&granule()).unwrap_err();
        assert_matches!(err, GpmError::GranuleFetchFailed { attempts: 0, .. });
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
