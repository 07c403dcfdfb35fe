use std::fs::File;
use std::io::{self, BufWriter, Write};

use camino::Utf8Path;
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::app::{
    ProgressEvent, ProgressSink, ResolvedUrls, RetrievalFailure, RetrievalResult,
};
use crate::registry::{Registry, UrlLayout};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub mission: String,
    pub product: String,
    pub version: u32,
    pub time_steps: usize,
    pub first_time: Option<NaiveDateTime>,
    pub last_time: Option<NaiveDateTime>,
    pub lon: AxisSummary,
    pub lat: AxisSummary,
    pub variables: Vec<VariableSummary>,
    pub cached_files: Vec<String>,
    pub failures: Vec<RetrievalFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AxisSummary {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableSummary {
    pub name: String,
    pub units: Option<String>,
    pub cells: usize,
    pub missing: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

impl RetrievalSummary {
    pub fn from_result(result: &RetrievalResult) -> Self {
        Self {
            mission: result.mission.clone(),
            product: result.product.clone(),
            version: result.version,
            time_steps: result.times.len(),
            first_time: result.times.first().copied(),
            last_time: result.times.last().copied(),
            lon: AxisSummary::from_values(&result.lon),
            lat: AxisSummary::from_values(&result.lat),
            variables: result
                .variables
                .iter()
                .map(|variable| {
                    let present: Vec<f64> = variable
                        .values
                        .iter()
                        .copied()
                        .filter(|value| !value.is_nan())
                        .collect();
                    let stats = AxisSummary::from_values(&present);
                    VariableSummary {
                        name: variable.name.clone(),
                        units: variable.attributes.get("units").cloned(),
                        cells: variable.values.len(),
                        missing: variable.values.len() - present.len(),
                        min: stats.min,
                        max: stats.max,
                        mean: (!present.is_empty())
                            .then(|| present.iter().sum::<f64>() / present.len() as f64),
                    }
                })
                .collect(),
            cached_files: result
                .granules
                .iter()
                .map(|granule| granule.cache_path.to_string())
                .collect(),
            failures: result.failures.clone(),
        }
    }
}

impl AxisSummary {
    fn from_values(values: &[f64]) -> Self {
        Self {
            count: values.len(),
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductListing {
    pub missions: Vec<MissionListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionListing {
    pub name: String,
    pub base_url: String,
    pub default_version: u32,
    pub products: Vec<ProductSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductSummary {
    pub name: String,
    pub layout: UrlLayout,
    pub variables: Vec<String>,
}

impl ProductListing {
    pub fn from_registry(registry: &Registry) -> Self {
        Self {
            missions: registry
                .missions()
                .map(|mission| MissionListing {
                    name: mission.name().to_string(),
                    base_url: mission.base_url().to_string(),
                    default_version: mission.default_version(),
                    products: mission
                        .products()
                        .map(|product| ProductSummary {
                            name: product.name().to_string(),
                            layout: product.layout(),
                            variables: product.variables().to_vec(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RetrievalSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_urls(urls: &ResolvedUrls) -> io::Result<()> {
        Self::print_json(urls)
    }

    pub fn print_products(listing: &ProductListing) -> io::Result<()> {
        Self::print_json(listing)
    }

    pub fn write_result(path: &Utf8Path, result: &RetrievalResult) -> io::Result<()> {
        let file = File::create(path.as_std_path())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, result).map_err(io::Error::other)?;
        writer.flush()
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let message = event.message.trim();
        let line = match parse_phase(message) {
            Some((phase, detail)) => format!("[{phase}] {detail}"),
            None => message.to_string(),
        };
        match event.elapsed {
            Some(elapsed) => eprintln!("{line} ({:.1}s)", elapsed.as_secs_f64()),
            None => eprintln!("{line}"),
        }
    }
}

pub fn parse_phase(message: &str) -> Option<(&str, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (phase, detail) = rest.split_once(';').unwrap_or((rest, ""));
    Some((phase.trim(), detail.trim()))
}

pub fn print_human_summary(summary: &RetrievalSummary) {
    println!(
        "{} {} v{:02}: {} time steps",
        summary.mission, summary.product, summary.version, summary.time_steps
    );
    if let (Some(first), Some(last)) = (summary.first_time, summary.last_time) {
        println!("  time: {first} .. {last}");
    }
    println!(
        "  grid: {} lon x {} lat",
        summary.lon.count, summary.lat.count
    );
    for variable in &summary.variables {
        let units = variable.units.as_deref().unwrap_or("-");
        match (variable.min, variable.max, variable.mean) {
            (Some(min), Some(max), Some(mean)) => println!(
                "  {} [{units}]: min {min:.3} max {max:.3} mean {mean:.3}, {} of {} cells missing",
                variable.name, variable.missing, variable.cells
            ),
            _ => println!("  {} [{units}]: all {} cells missing", variable.name, variable.cells),
        }
    }
    println!("  cached files: {}", summary.cached_files.len());
    for failure in &summary.failures {
        println!("  skipped {}: {}", failure.target, failure.reason);
    }
}
