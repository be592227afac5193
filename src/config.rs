use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Db;
use crate::error::IngestError;

pub const DEFAULT_CONFIG_FILE: &str = "pubmed-ingest.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub admin_set_title: Option<String>,
    #[serde(default)]
    pub depositor: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub store_root: Option<PathBuf>,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub affiliation_variants: Option<Vec<String>>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub outcome_flush_threshold: Option<usize>,
    #[serde(default)]
    pub max_lookup_retries: Option<u32>,
    #[serde(default)]
    pub repository_base_url: Option<String>,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoints {
    pub esearch: String,
    pub efetch: String,
    pub idconv: String,
    pub oa: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            esearch: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi".to_string(),
            efetch: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi".to_string(),
            idconv: "https://www.ncbi.nlm.nih.gov/pmc/utils/idconv/v1.0/".to_string(),
            oa: "https://www.ncbi.nlm.nih.gov/pmc/utils/oa/oa.fcgi".to_string(),
        }
    }
}

/// Values given on the command line; each one wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub admin_set_title: Option<String>,
    pub depositor: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub store_root: Option<PathBuf>,
}

/// Identity of one ingest run. Persisted in the checkpoint so a resumed run
/// keeps the parameters it was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub admin_set_title: String,
    pub depositor: String,
    pub output_dir: PathBuf,
}

impl RunParameters {
    pub fn layout(&self) -> RunLayout {
        RunLayout::new(&self.output_dir)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub page_size: u64,
    pub batch_size: usize,
    pub request_delay: Duration,
    pub outcome_flush_threshold: usize,
    pub max_lookup_retries: u32,
    pub search_query: Option<String>,
    pub affiliation_variants: Vec<String>,
    pub store_root: PathBuf,
    pub repository_base_url: String,
    pub endpoints: Endpoints,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            page_size: 200,
            batch_size: 200,
            request_delay: Duration::from_millis(400),
            outcome_flush_threshold: 50,
            max_lookup_retries: 3,
            search_query: None,
            affiliation_variants: default_affiliation_variants(),
            store_root: default_store_root(),
            repository_base_url: "https://cdr.lib.unc.edu/concern/articles".to_string(),
            endpoints: Endpoints::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: IngestSettings,
    pub run: Option<RunParameters>,
}

impl ResolvedConfig {
    /// Run parameters for a fresh run; each missing field is a fatal error.
    pub fn require_run(&self) -> Result<&RunParameters, IngestError> {
        self.run.as_ref().ok_or_else(|| {
            IngestError::ConfigParse("start_date, end_date and depositor are required".to_string())
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, IngestError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, overrides)
    }

    /// An explicit path must exist; without one the default file is optional.
    pub fn load(path: Option<&str>) -> Result<Config, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| IngestError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, IngestError> {
        let defaults = IngestSettings::default();
        let settings = IngestSettings {
            page_size: positive(config.page_size, defaults.page_size, "page_size")?,
            batch_size: positive(config.batch_size, defaults.batch_size, "batch_size")?,
            request_delay: config
                .request_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            outcome_flush_threshold: positive(
                config.outcome_flush_threshold,
                defaults.outcome_flush_threshold,
                "outcome_flush_threshold",
            )?,
            max_lookup_retries: config
                .max_lookup_retries
                .unwrap_or(defaults.max_lookup_retries)
                .max(1),
            search_query: config.search_query.filter(|q| !q.trim().is_empty()),
            affiliation_variants: config
                .affiliation_variants
                .unwrap_or(defaults.affiliation_variants),
            store_root: overrides
                .store_root
                .or(config.store_root)
                .unwrap_or(defaults.store_root),
            repository_base_url: config
                .repository_base_url
                .unwrap_or(defaults.repository_base_url),
            endpoints: config.endpoints.unwrap_or(defaults.endpoints),
        };

        let start = overrides.start_date.or(config.start_date);
        let end = overrides.end_date.or(config.end_date);
        let admin_set = overrides.admin_set_title.or(config.admin_set_title);
        let depositor = overrides.depositor.or(config.depositor);
        let output_dir = overrides.output_dir.or(config.output_dir);

        let run = match (start, end, depositor) {
            (Some(start), Some(end), Some(depositor)) => {
                let admin_set_title = admin_set
                    .filter(|title| !title.trim().is_empty())
                    .ok_or_else(|| {
                        IngestError::MissingAdminSet("no admin_set_title configured".to_string())
                    })?;
                let start_date = parse_date(&start)?;
                let end_date = parse_date(&end)?;
                if start_date > end_date {
                    return Err(IngestError::InvalidDateRange(format!(
                        "start {start_date} is after end {end_date}"
                    )));
                }
                let output_dir = output_dir.unwrap_or_else(|| {
                    PathBuf::from("output").join(format!("pubmed_ingest_{start_date}_{end_date}"))
                });
                Some(RunParameters {
                    start_date,
                    end_date,
                    admin_set_title,
                    depositor,
                    output_dir,
                })
            }
            _ => None,
        };

        Ok(ResolvedConfig { settings, run })
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, IngestError> {
    let trimmed = value.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y/%m/%d"))
        .map_err(|_| IngestError::InvalidDateRange(format!("unparsable date: {value}")))
}

fn positive<T>(value: Option<T>, default: T, name: &str) -> Result<T, IngestError>
where
    T: Copy + PartialEq + Default,
{
    match value {
        Some(v) if v == T::default() => Err(IngestError::ConfigParse(format!(
            "{name} must be greater than zero"
        ))),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

pub fn default_affiliation_variants() -> Vec<String> {
    vec![
        "University of North Carolina at Chapel Hill".to_string(),
        "University of North Carolina-Chapel Hill".to_string(),
        "University of North Carolina, Chapel Hill".to_string(),
        "UNC-Chapel Hill".to_string(),
        "UNC Chapel Hill".to_string(),
        "UNC School of Medicine".to_string(),
        "UNC Gillings School of Global Public Health".to_string(),
        "UNC Eshelman School of Pharmacy".to_string(),
        "UNC Lineberger".to_string(),
        "Lineberger Comprehensive Cancer Center".to_string(),
    ]
}

fn default_store_root() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.data_dir().join("pubmed-ingest").join("repository"))
        .unwrap_or_else(|| PathBuf::from(".pubmed-ingest").join("repository"))
}

/// File names inside one run's output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLayout {
    pub output_dir: PathBuf,
    pub tracker: PathBuf,
    pub pubmed_ids: PathBuf,
    pub pmc_ids: PathBuf,
    pub pubmed_alternate_ids: PathBuf,
    pub pmc_alternate_ids: PathBuf,
    pub metadata_results: PathBuf,
    pub attachment_results: PathBuf,
    pub final_report: PathBuf,
    pub summary: PathBuf,
    pub staging_dir: PathBuf,
}

impl RunLayout {
    pub fn new(output_dir: &Path) -> Self {
        let join = |name: &str| output_dir.join(name);
        Self {
            output_dir: output_dir.to_path_buf(),
            tracker: join("ingest_progress.json"),
            pubmed_ids: join("pubmed_ids.jsonl"),
            pmc_ids: join("pmc_ids.jsonl"),
            pubmed_alternate_ids: join("pubmed_alternate_ids.jsonl"),
            pmc_alternate_ids: join("pmc_alternate_ids.jsonl"),
            metadata_results: join("metadata_ingest_results.jsonl"),
            attachment_results: join("attachment_results.jsonl"),
            final_report: join("final_report.json"),
            summary: join("summary.txt"),
            staging_dir: join("staging"),
        }
    }

    pub fn ids_path(&self, db: Db) -> &Path {
        match db {
            Db::Pubmed => &self.pubmed_ids,
            Db::Pmc => &self.pmc_ids,
        }
    }

    pub fn alternate_ids_path(&self, db: Db) -> &Path {
        match db {
            Db::Pubmed => &self.pubmed_alternate_ids,
            Db::Pmc => &self.pmc_alternate_ids,
        }
    }
}
