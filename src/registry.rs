use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GpmError;

const DEFAULT_REGISTRY: &str = include_str!("registry.json");

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_]+)(?::0(\d+))?\}").unwrap());

#[derive(Debug, Deserialize, Serialize)]
pub struct RegistryFile {
    pub missions: BTreeMap<String, MissionEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MissionEntry {
    pub base_url: String,
    pub process_level: String,
    pub version: u32,
    pub products: BTreeMap<String, ProductEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProductEntry {
    pub template: String,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UrlLayout {
    DayOfYearListing,
    MonthDirect,
}

#[derive(Debug, Clone)]
pub struct Product {
    name: String,
    template: String,
    variables: Vec<String>,
    layout: UrlLayout,
}

impl Product {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn layout(&self) -> UrlLayout {
        self.layout
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|variable| variable == name)
    }

    pub fn directory_template(&self) -> &str {
        self.template
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct Mission {
    name: String,
    base_url: String,
    process_level: String,
    version: u32,
    products: BTreeMap<String, Product>,
}

impl Mission {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn process_level(&self) -> &str {
        &self.process_level
    }

    pub fn default_version(&self) -> u32 {
        self.version
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }

    pub fn product(&self, name: &str) -> Result<&Product, GpmError> {
        self.products.get(name).ok_or_else(|| {
            GpmError::InvalidRequest(format!(
                "product must be one of: {}",
                self.products.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn opendap_root(&self) -> String {
        format!(
            "{}/opendap/{}",
            self.base_url.trim_end_matches('/'),
            self.process_level
        )
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    missions: BTreeMap<String, Mission>,
}

impl Registry {
    pub fn builtin() -> Result<Self, GpmError> {
        Self::from_json(DEFAULT_REGISTRY)
    }

    pub fn load(path: &Path) -> Result<Self, GpmError> {
        let content =
            fs::read_to_string(path).map_err(|_| GpmError::ConfigRead(path.to_path_buf()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, GpmError> {
        let file: RegistryFile = serde_json::from_str(content)
            .map_err(|err| GpmError::ConfigParse(err.to_string()))?;
        Self::resolve(file)
    }

    pub fn resolve(file: RegistryFile) -> Result<Self, GpmError> {
        let mut missions = BTreeMap::new();
        for (mission_name, entry) in file.missions {
            let mut products = BTreeMap::new();
            for (product_name, product) in entry.products {
                if product.variables.is_empty() {
                    return Err(GpmError::ConfigParse(format!(
                        "product {product_name} declares no variables"
                    )));
                }
                let layout = detect_layout(&product.template).ok_or_else(|| {
                    GpmError::ConfigParse(format!(
                        "template for {product_name} has neither a dayofyear nor a month placeholder"
                    ))
                })?;
                products.insert(
                    product_name.clone(),
                    Product {
                        name: product_name,
                        template: product.template.trim().to_string(),
                        variables: product.variables,
                        layout,
                    },
                );
            }
            missions.insert(
                mission_name.clone(),
                Mission {
                    name: mission_name,
                    base_url: entry.base_url,
                    process_level: entry.process_level,
                    version: entry.version,
                    products,
                },
            );
        }
        Ok(Self { missions })
    }

    pub fn missions(&self) -> impl Iterator<Item = &Mission> {
        self.missions.values()
    }

    pub fn mission(&self, name: &str) -> Result<&Mission, GpmError> {
        self.missions.get(name).ok_or_else(|| {
            GpmError::InvalidRequest(format!(
                "mission should be one of: {}",
                self.missions.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

fn detect_layout(template: &str) -> Option<UrlLayout> {
    let directory = template.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    if directory.contains("{dayofyear") {
        Some(UrlLayout::DayOfYearListing)
    } else if template.contains("{month") {
        Some(UrlLayout::MonthDirect)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct TemplateParams {
    pub mission: String,
    pub product: String,
    pub version: u32,
    pub date: NaiveDate,
}

impl TemplateParams {
    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "mission" => self.mission.to_uppercase(),
            "product" => self.product.clone(),
            "version" => self.version.to_string(),
            "year" => self.date.year().to_string(),
            "month" => self.date.month().to_string(),
            "day" => self.date.day().to_string(),
            "dayofyear" => self.date.ordinal().to_string(),
            "date" => self.date.format("%Y%m%d").to_string(),
            _ => return None,
        };
        Some(value)
    }
}

pub fn render_template(template: &str, params: &TemplateParams) -> Result<String, GpmError> {
    let mut rendered = String::with_capacity(template.len() + 16);
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let key = &caps[1];
        let value = params.lookup(key).ok_or_else(|| {
            GpmError::InvalidRequest(format!("unknown template placeholder {{{key}}}"))
        })?;
        let width = caps
            .get(2)
            .and_then(|width| width.as_str().parse::<usize>().ok())
            .unwrap_or(0);
        rendered.push_str(&template[last..whole.start]);
        rendered.push_str(&format!("{value:0>width$}"));
        last = whole.end;
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn params(date: NaiveDate) -> TemplateParams {
        TemplateParams {
            mission: "gpm".to_string(),
            product: "3IMERGHH".to_string(),
            version: 6,
            date,
        }
    }

    #[test]
    fn builtin_registry_layouts() {
        let registry = Registry::builtin().unwrap();
        let gpm = registry.mission("gpm").unwrap();
        assert_eq!(gpm.default_version(), 6);
        assert_eq!(
            gpm.product("3IMERGHH").unwrap().layout(),
            UrlLayout::DayOfYearListing
        );
        assert_eq!(
            gpm.product("3IMERGDF").unwrap().layout(),
            UrlLayout::MonthDirect
        );
        assert_eq!(
            gpm.opendap_root(),
            "https://gpm1.gesdisc.eosdis.nasa.gov:443/opendap/GPM_L3"
        );
    }

    #[test]
    fn unknown_names_are_invalid_requests() {
        let registry = Registry::builtin().unwrap();
        assert_matches!(registry.mission("trmm"), Err(GpmError::InvalidRequest(_)));
        let gpm = registry.mission("gpm").unwrap();
        assert_matches!(gpm.product("3B42"), Err(GpmError::InvalidRequest(_)));
    }

    #[test]
    fn renders_padded_directory() {
        let registry = Registry::builtin().unwrap();
        let product = registry.mission("gpm").unwrap().product("3IMERGHH").unwrap();
        let date = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let dir = render_template(product.directory_template(), &params(date)).unwrap();
        assert_eq!(dir, "GPM_3IMERGHH.06/2020/002");
    }

    #[test]
    fn unknown_placeholder_fails() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let err = render_template("{mission}/{time_start}", &params(date)).unwrap_err();
        assert_matches!(err, GpmError::InvalidRequest(_));
    }

    #[test]
    fn template_without_date_placeholder_is_rejected() {
        let json = r#"{"missions":{"gpm":{"base_url":"https://x","process_level":"L3","version":6,
            "products":{"P":{"template":"{mission}/{year}/file.h5","variables":["a"]}}}}}"#;
        assert_matches!(Registry::from_json(json), Err(GpmError::ConfigParse(_)));
    }
}
