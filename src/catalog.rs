use chrono::NaiveDate;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use crate::error::GpmError;
use crate::registry::{Mission, Product, TemplateParams, UrlLayout, render_template};

const LISTING_MARKER: &str = ".xml";

pub trait CatalogClient: Send + Sync {
    fn fetch_listing(&self, url: &str) -> Result<String, GpmError>;
}

impl<T: CatalogClient + ?Sized> CatalogClient for &T {
    fn fetch_listing(&self, url: &str) -> Result<String, GpmError> {
        (**self).fetch_listing(url)
    }
}

pub struct CatalogResolver<'a, C: CatalogClient> {
    client: &'a C,
    mission: &'a Mission,
}

impl<'a, C: CatalogClient> CatalogResolver<'a, C> {
    pub fn new(client: &'a C, mission: &'a Mission) -> Self {
        Self { client, mission }
    }

    pub fn resolve(
        &self,
        product: &Product,
        version: u32,
        date: NaiveDate,
    ) -> Result<Vec<String>, GpmError> {
        let params = TemplateParams {
            mission: self.mission.name().to_string(),
            product: product.name().to_string(),
            version,
            date,
        };
        match product.layout() {
            UrlLayout::DayOfYearListing => {
                let directory = render_template(product.directory_template(), &params)?;
                let url = format!("{}/{}/catalog.xml", self.mission.opendap_root(), directory);
                debug!(%url, %date, "fetching catalog listing");
                let document =
                    self.client
                        .fetch_listing(&url)
                        .map_err(|err| GpmError::CatalogUnavailable {
                            url: url.clone(),
                            reason: err.to_string(),
                        })?;
                parse_catalog(&document, self.mission.base_url()).map_err(|err| {
                    GpmError::CatalogUnavailable {
                        url,
                        reason: err.to_string(),
                    }
                })
            }
            UrlLayout::MonthDirect => {
                let path = render_template(product.template(), &params)?;
                Ok(vec![format!("{}/{}", self.mission.opendap_root(), path)])
            }
        }
    }
}

/// Entries live under the first `dataset` child of the root; `catalogRef`
/// entries and `.xml` sidecars are skipped, document order is kept.
pub fn parse_catalog(xml: &str, base_url: &str) -> Result<Vec<String>, GpmError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let base_url = base_url.trim_end_matches('/');
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut in_container = false;
    let mut container_seen = false;
    let mut urls = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => {
                depth += 1;
                if depth == 2 && !container_seen && is_dataset(&element) {
                    in_container = true;
                    container_seen = true;
                } else if depth == 3 && in_container {
                    push_entry(&element, base_url, &mut urls)?;
                }
            }
            Ok(Event::Empty(element)) => {
                if depth + 1 == 3 && in_container {
                    push_entry(&element, base_url, &mut urls)?;
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 && in_container {
                    in_container = false;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(GpmError::CatalogParse(format!(
                    "error at position {}: {err}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if !container_seen {
        return Err(GpmError::CatalogParse(
            "document has no dataset container".to_string(),
        ));
    }
    Ok(urls)
}

fn is_dataset(element: &BytesStart<'_>) -> bool {
    element.local_name().as_ref() == b"dataset"
}

fn push_entry(
    element: &BytesStart<'_>,
    base_url: &str,
    urls: &mut Vec<String>,
) -> Result<(), GpmError> {
    if !is_dataset(element) {
        return Ok(());
    }
    for attr in element.attributes() {
        let attr = attr.map_err(|err| GpmError::CatalogParse(format!("attribute: {err}")))?;
        if attr.key.local_name().as_ref() != b"ID" {
            continue;
        }
        let id = attr
            .unescape_value()
            .map_err(|err| GpmError::CatalogParse(format!("attribute: {err}")))?;
        if !id.contains(LISTING_MARKER) {
            let separator = if id.starts_with('/') { "" } else { "/" };
            urls.push(format!("{base_url}{separator}{id}"));
        }
    }
    Ok(())
}
