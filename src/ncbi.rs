use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::config::{Endpoints, IngestSettings};
use crate::domain::{Db, IdentifierRecord, normalize_pmcid, normalize_pmid};
use crate::error::IngestError;
use crate::xml::XmlNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub count: u64,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFormat {
    Pdf,
    Tgz,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaLink {
    pub format: LinkFormat,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OaLookup {
    pub links: Vec<OaLink>,
    pub error: Option<String>,
}

impl OaLookup {
    pub fn link(&self, format: LinkFormat) -> Option<&OaLink> {
        self.links.iter().find(|link| link.format == format)
    }
}

pub trait NcbiClient: Send + Sync {
    fn search(
        &self,
        db: Db,
        term: &str,
        retstart: u64,
        retmax: u64,
    ) -> Result<SearchPage, IngestError>;
    fn convert_ids(&self, db: Db, ids: &[String]) -> Result<Vec<IdentifierRecord>, IngestError>;
    fn fetch_metadata(&self, db: Db, ids: &[String]) -> Result<String, IngestError>;
    fn lookup_open_access(&self, pmcid: &str) -> Result<OaLookup, IngestError>;
}

pub struct NcbiHttpClient {
    client: Client,
    endpoints: Endpoints,
    api_key: Option<String>,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl NcbiHttpClient {
    pub fn new(settings: &IngestSettings) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pubmed-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::NcbiHttp(err.to_string()))?,
        );

        let api_key = std::env::var("NCBI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        // E-utilities allow 3 requests/s anonymously and 10 with a key.
        let request_delay = if api_key.is_some() {
            settings.request_delay.min(Duration::from_millis(100))
        } else {
            settings.request_delay
        };

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| IngestError::NcbiHttp(err.to_string()))?;

        Ok(Self {
            client,
            endpoints: settings.endpoints.clone(),
            api_key,
            request_delay,
            last_request: Mutex::new(None),
        })
    }

    fn throttle(&self) {
        let mut last = match self.last_request.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_delay {
                thread::sleep(self.request_delay - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn get_xml(&self, url: &str, params: &[(&str, String)]) -> Result<String, IngestError> {
        let mut query = params.to_vec();
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.clone()));
        }
        let start = Instant::now();
        let response = self.send_with_retries(|| self.client.get(url).query(&query))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "NCBI request failed".to_string());
            return Err(IngestError::NcbiStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| IngestError::NcbiHttp(err.to_string()))?;
        debug!(url, latency_ms = start.elapsed().as_millis() as u64, "ncbi.response");
        Ok(body)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, IngestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            self.throttle();
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(status, attempt, delay_ms = delay, "retrying NCBI request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(error = %err, attempt, delay_ms = delay, "retrying NCBI request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::NcbiHttp(err.to_string()));
                }
            }
        }
    }
}

impl NcbiClient for NcbiHttpClient {
    fn search(
        &self,
        db: Db,
        term: &str,
        retstart: u64,
        retmax: u64,
    ) -> Result<SearchPage, IngestError> {
        let body = self.get_xml(
            &self.endpoints.esearch,
            &[
                ("db", db.as_str().to_string()),
                ("term", term.to_string()),
                ("retstart", retstart.to_string()),
                ("retmax", retmax.to_string()),
                ("retmode", "xml".to_string()),
            ],
        )?;
        parse_search_page(&body)
    }

    fn convert_ids(&self, db: Db, ids: &[String]) -> Result<Vec<IdentifierRecord>, IngestError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = self.get_xml(
            &self.endpoints.idconv,
            &[
                ("ids", ids.join(",")),
                ("format", "xml".to_string()),
                ("tool", "pubmed-ingest".to_string()),
            ],
        )?;
        parse_id_conversion(&body, db, ids)
    }

    fn fetch_metadata(&self, db: Db, ids: &[String]) -> Result<String, IngestError> {
        let query_ids = ids
            .iter()
            .map(|id| match db {
                Db::Pubmed => id.clone(),
                Db::Pmc => id.trim_start_matches("PMC").to_string(),
            })
            .collect::<Vec<_>>();
        self.get_xml(
            &self.endpoints.efetch,
            &[
                ("db", db.as_str().to_string()),
                ("id", query_ids.join(",")),
                ("retmode", "xml".to_string()),
            ],
        )
    }

    fn lookup_open_access(&self, pmcid: &str) -> Result<OaLookup, IngestError> {
        let body = self.get_xml(&self.endpoints.oa, &[("id", pmcid.to_string())])?;
        parse_oa_lookup(&body)
    }
}

pub fn parse_search_page(xml: &str) -> Result<SearchPage, IngestError> {
    let doc = XmlNode::parse(xml)?;
    let root = doc
        .child("eSearchResult")
        .ok_or_else(|| IngestError::Xml("missing eSearchResult".to_string()))?;
    let count = root
        .find_text("Count")
        .ok_or_else(|| {
            let reason = root
                .find_text("ERROR")
                .unwrap_or_else(|| "missing Count".to_string());
            IngestError::Xml(reason)
        })?
        .parse::<u64>()
        .map_err(|err| IngestError::Xml(format!("invalid Count: {err}")))?;
    let ids = root
        .find_all("IdList/Id")
        .into_iter()
        .map(XmlNode::text)
        .filter(|id| !id.is_empty())
        .collect();
    Ok(SearchPage { count, ids })
}

/// Maps every requested id to an identifier record. Ids the service did not
/// mention keep only the requested identifier.
pub fn parse_id_conversion(
    xml: &str,
    db: Db,
    requested: &[String],
) -> Result<Vec<IdentifierRecord>, IngestError> {
    let doc = XmlNode::parse(xml)?;
    let normalize = |value: &str| match db {
        Db::Pubmed => normalize_pmid(value),
        Db::Pmc => normalize_pmcid(value),
    };

    let mut by_requested = HashMap::new();
    for record in doc.descendants("record") {
        if let Some(key) = record.attr("requested-id").and_then(normalize) {
            by_requested.entry(key).or_insert(record);
        }
    }

    let mut records = Vec::with_capacity(requested.len());
    for raw in requested {
        let Some(key) = normalize(raw.as_str()) else {
            warn!(%db, id = %raw, "dropping unparsable identifier");
            continue;
        };
        let mut record = IdentifierRecord::default();
        match db {
            Db::Pubmed => record.pmid = Some(key.clone()),
            Db::Pmc => record.pmcid = Some(key.clone()),
        }
        if let Some(node) = by_requested.get(&key) {
            if let Some(pmid) = node.attr("pmid") {
                record.pmid = Some(pmid.to_string());
            }
            if let Some(pmcid) = node.attr("pmcid") {
                record.pmcid = Some(pmcid.to_string());
            }
            if let Some(doi) = node.attr("doi") {
                record.doi = Some(doi.to_string());
            }
            if node.attr("status") == Some("error") {
                record.error = Some(
                    node.attr("errmsg")
                        .unwrap_or("id conversion error")
                        .to_string(),
                );
            }
        } else {
            record.error = Some("not returned by id conversion".to_string());
        }
        match record.normalized() {
            Ok(record) => records.push(record),
            Err(err) => warn!(%db, id = %raw, error = %err, "dropping identifier"),
        }
    }
    Ok(records)
}

pub fn parse_oa_lookup(xml: &str) -> Result<OaLookup, IngestError> {
    let doc = XmlNode::parse(xml)?;
    let root = doc
        .child("OA")
        .ok_or_else(|| IngestError::Xml("missing OA root".to_string()))?;
    let links = root
        .find_all("records/record/link")
        .into_iter()
        .filter_map(|link| {
            let format = match link.attr("format")? {
                "pdf" => LinkFormat::Pdf,
                "tgz" => LinkFormat::Tgz,
                _ => return None,
            };
            let href = link.attr("href")?.trim().to_string();
            (!href.is_empty()).then_some(OaLink { format, href })
        })
        .collect();
    Ok(OaLookup {
        links,
        error: root.find_text("error"),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
