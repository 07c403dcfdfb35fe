use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::catalog::CatalogClient;
use crate::dap::{self, DapDataset};
use crate::error::GpmError;
use crate::granule::DatasetClient;
use crate::query::strip_query;

/// The only host that ever receives the account credentials.
pub const EARTHDATA_LOGIN_HOST: &str = "urs.earthdata.nasa.gov";

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub login_host: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            login_host: EARTHDATA_LOGIN_HOST.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct EarthdataSession {
    client: Client,
    username: String,
    password: String,
    login_host: String,
}

impl EarthdataSession {
    pub fn login(username: &str, password: &str, check_url: &str) -> Result<Self, GpmError> {
        Self::login_with(username, password, check_url, SessionConfig::default())
    }

    pub fn login_with(
        username: &str,
        password: &str,
        check_url: &str,
        config: SessionConfig,
    ) -> Result<Self, GpmError> {
        let session = Self::build(username, password, config)?;
        let response = session.get(check_url)?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GpmError::Auth(format!(
                "{check_url} rejected the credentials for {username} (status {status})"
            )));
        }
        if !status.is_success() {
            return Err(GpmError::Auth(format!(
                "{check_url} returned status {status} during login"
            )));
        }
        debug!(%check_url, "earthdata session established");
        Ok(session)
    }

    pub fn anonymous(config: SessionConfig) -> Result<Self, GpmError> {
        Self::build("", "", config)
    }

    fn build(username: &str, password: &str, config: SessionConfig) -> Result<Self, GpmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gpmdap/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GpmError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .redirect(Policy::none())
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| GpmError::Http(err.to_string()))?;
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
            login_host: config.login_host,
        })
    }

    pub fn get(&self, url: &str) -> Result<Response, GpmError> {
        let mut current =
            Url::parse(url).map_err(|err| GpmError::Http(format!("invalid URL {url}: {err}")))?;
        for _ in 0..MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if !self.username.is_empty() && current.host_str() == Some(self.login_host.as_str()) {
                request = request.basic_auth(&self.username, Some(&self.password));
            }
            let response = request
                .send()
                .map_err(|err| GpmError::Http(err.to_string()))?;
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    GpmError::Http(format!("redirect from {current} without a location"))
                })?;
            current = current
                .join(location)
                .map_err(|err| GpmError::Http(format!("bad redirect target {location}: {err}")))?;
        }
        Err(GpmError::Http(format!("too many redirects for {url}")))
    }

    fn get_success(&self, url: &str) -> Result<Response, GpmError> {
        let response = self.get(url)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "request failed".to_string());
        Err(GpmError::HttpStatus { status, message })
    }
}

impl CatalogClient for EarthdataSession {
    fn fetch_listing(&self, url: &str) -> Result<String, GpmError> {
        self.get_success(url)?
            .text()
            .map_err(|err| GpmError::Http(err.to_string()))
    }
}

impl DatasetClient for EarthdataSession {
    fn open(&self, query_url: &str) -> Result<DapDataset, GpmError> {
        let (dods_url, das_url) = dap_urls(query_url);
        let das = self
            .get_success(&das_url)?
            .text()
            .map_err(|err| GpmError::Http(err.to_string()))?;
        let dods = self
            .get_success(&dods_url)?
            .bytes()
            .map_err(|err| GpmError::Http(err.to_string()))?;
        dap::decode(&dods, &das)
    }
}

pub fn dap_urls(query_url: &str) -> (String, String) {
    let base = strip_query(query_url);
    let dods = match query_url.split_once('?') {
        Some((_, constraint)) => format!("{base}.dods?{constraint}"),
        None => format!("{base}.dods"),
    };
    (dods, format!("{base}.das"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dap_urls_keep_constraint_on_data_only() {
        let (dods, das) = dap_urls("https://host/opendap/f.HDF5?lat[0:1:3],time[0:1:0]");
        assert_eq!(dods, "https://host/opendap/f.HDF5.dods?lat[0:1:3],time[0:1:0]");
        assert_eq!(das, "https://host/opendap/f.HDF5.das");
    }
}
