#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;

use pubmed_ingest::config::{IngestSettings, RunParameters};
use pubmed_ingest::coordinator::IngestReport;
use pubmed_ingest::domain::{Db, IdentifierRecord};
use pubmed_ingest::error::IngestError;
use pubmed_ingest::ncbi::{LinkFormat, NcbiClient, OaLink, OaLookup, SearchPage};
use pubmed_ingest::notify::Notifier;
use pubmed_ingest::store::LocalWorkStore;
use pubmed_ingest::transfer::FileTransfer;

pub const ADMIN_SET: &str = "Open Access Articles";
pub const UNC: &str = "Department of Medicine, University of North Carolina at Chapel Hill, NC, USA";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub search: usize,
    pub convert: usize,
    pub fetch: usize,
    pub lookup: usize,
}

#[derive(Default)]
pub struct MockNcbi {
    pub search_results: HashMap<Db, Vec<String>>,
    pub conversions: HashMap<String, IdentifierRecord>,
    pub documents: HashMap<String, String>,
    pub oa: HashMap<String, OaLookup>,
    /// Search offsets that fail once with a transient error.
    pub search_failures: Mutex<Vec<u64>>,
    /// Conversion batches, by first id, that fail once.
    pub convert_failures: Mutex<Vec<String>>,
    pub fetch_failures: Mutex<usize>,
    pub lookup_failures: Mutex<usize>,
    pub calls: Mutex<Calls>,
}

impl MockNcbi {
    pub fn calls(&self) -> Calls {
        *self.calls.lock().unwrap()
    }

    pub fn with_search(mut self, db: Db, ids: &[&str]) -> Self {
        self.search_results
            .insert(db, ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn with_conversion(mut self, requested: &str, record: IdentifierRecord) -> Self {
        self.conversions.insert(requested.to_string(), record);
        self
    }

    pub fn with_document(mut self, id: &str, xml: String) -> Self {
        self.documents.insert(id.to_string(), xml);
        self
    }

    pub fn with_link(mut self, pmcid: &str, format: LinkFormat, href: &str) -> Self {
        self.oa.insert(
            pmcid.to_string(),
            OaLookup {
                links: vec![OaLink {
                    format,
                    href: href.to_string(),
                }],
                error: None,
            },
        );
        self
    }
}

impl NcbiClient for &MockNcbi {
    fn search(
        &self,
        db: Db,
        _term: &str,
        retstart: u64,
        retmax: u64,
    ) -> Result<SearchPage, IngestError> {
        self.calls.lock().unwrap().search += 1;
        {
            let mut failures = self.search_failures.lock().unwrap();
            if let Some(position) = failures.iter().position(|&start| start == retstart) {
                failures.remove(position);
                return Err(IngestError::NcbiStatus {
                    status: 429,
                    message: "too many requests".to_string(),
                });
            }
        }
        let ids = self.search_results.get(&db).cloned().unwrap_or_default();
        let page = ids
            .iter()
            .skip(retstart as usize)
            .take(retmax as usize)
            .cloned()
            .collect();
        Ok(SearchPage {
            count: ids.len() as u64,
            ids: page,
        })
    }

    fn convert_ids(&self, db: Db, ids: &[String]) -> Result<Vec<IdentifierRecord>, IngestError> {
        self.calls.lock().unwrap().convert += 1;
        {
            let mut failures = self.convert_failures.lock().unwrap();
            if let Some(position) = failures.iter().position(|first| ids.first() == Some(first)) {
                failures.remove(position);
                return Err(IngestError::NcbiHttp("connection reset".to_string()));
            }
        }
        ids.iter()
            .map(|id| match self.conversions.get(id) {
                Some(record) => Ok(record.clone()),
                None => {
                    let mut record = IdentifierRecord::from_db_id(db, id)?;
                    record.error = Some("not returned by id conversion".to_string());
                    Ok(record)
                }
            })
            .collect()
    }

    fn fetch_metadata(&self, db: Db, ids: &[String]) -> Result<String, IngestError> {
        self.calls.lock().unwrap().fetch += 1;
        {
            let mut failures = self.fetch_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(IngestError::NcbiHttp("connection reset".to_string()));
            }
        }
        let body = ids
            .iter()
            .filter_map(|id| self.documents.get(id).cloned())
            .collect::<String>();
        Ok(match db {
            Db::Pubmed => format!("<PubmedArticleSet>{body}</PubmedArticleSet>"),
            Db::Pmc => format!("<pmc-articleset>{body}</pmc-articleset>"),
        })
    }

    fn lookup_open_access(&self, pmcid: &str) -> Result<OaLookup, IngestError> {
        self.calls.lock().unwrap().lookup += 1;
        {
            let mut failures = self.lookup_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(IngestError::NcbiStatus {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
        }
        Ok(self.oa.get(pmcid).cloned().unwrap_or_else(|| OaLookup {
            links: Vec::new(),
            error: Some("identifier is not Open Access".to_string()),
        }))
    }
}

/// Serves a one-page PDF for `.pdf` URLs and a package with a nested PDF for
/// `.tar.gz` URLs. Packages whose URL contains `figures-only` hold no PDF.
#[derive(Default)]
pub struct MockTransfer {
    pub downloads: Mutex<Vec<String>>,
}

impl MockTransfer {
    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl FileTransfer for &MockTransfer {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, IngestError> {
        self.downloads.lock().unwrap().push(url.to_string());
        if url.ends_with(".tar.gz") {
            write_package(destination, !url.contains("figures-only"));
        } else {
            std::fs::write(destination, b"%PDF-1.4 test").unwrap();
        }
        Ok(std::fs::metadata(destination).unwrap().len())
    }
}

fn write_package(destination: &Path, with_pdf: bool) {
    let file = File::create(destination).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let mut entries = vec![("PMC/figure1.jpg", b"jpeg".as_slice())];
    if with_pdf {
        entries.push(("PMC/main/article.pdf", b"%PDF-1.4 package".as_slice()));
    }
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

#[derive(Default)]
pub struct MockNotifier {
    pub sent: Mutex<Vec<usize>>,
}

impl Notifier for &MockNotifier {
    fn send_summary(&self, report: &IngestReport) -> Result<(), IngestError> {
        self.sent.lock().unwrap().push(report.total_unique_records);
        Ok(())
    }
}

pub fn params(output_dir: &Path) -> RunParameters {
    RunParameters {
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        admin_set_title: ADMIN_SET.to_string(),
        depositor: "admin".to_string(),
        output_dir: output_dir.to_path_buf(),
    }
}

pub fn settings(store_root: &Path) -> IngestSettings {
    IngestSettings {
        page_size: 2,
        batch_size: 2,
        outcome_flush_threshold: 2,
        affiliation_variants: vec!["University of North Carolina at Chapel Hill".to_string()],
        store_root: store_root.to_path_buf(),
        repository_base_url: "https://repo.example/concern/articles".to_string(),
        ..IngestSettings::default()
    }
}

pub fn open_store(root: &Path) -> LocalWorkStore {
    let store = LocalWorkStore::open(root, "https://repo.example/concern/articles").unwrap();
    store.ensure_admin_set(ADMIN_SET).unwrap();
    store
}

pub fn run_dir(temp: &Path) -> PathBuf {
    temp.join("run")
}

pub fn ids(pmid: Option<&str>, pmcid: Option<&str>, doi: Option<&str>) -> IdentifierRecord {
    IdentifierRecord::new(pmid, pmcid, doi).unwrap()
}

pub fn pubmed_article(pmid: &str, doi: Option<&str>, title: &str, affiliation: &str) -> String {
    let doi = doi
        .map(|doi| format!(r#"<ArticleId IdType="doi">{doi}</ArticleId>"#))
        .unwrap_or_default();
    format!(
        r#"<PubmedArticle><MedlineCitation><PMID Version="1">{pmid}</PMID><Article>
<Journal><JournalIssue><PubDate><Year>2024</Year><Month>Jan</Month></PubDate></JournalIssue><Title>Test Journal</Title></Journal>
<ArticleTitle>{title}</ArticleTitle>
<AuthorList><Author><LastName>Doe</LastName><ForeName>Alex</ForeName><AffiliationInfo><Affiliation>{affiliation}</Affiliation></AffiliationInfo></Author></AuthorList>
</Article></MedlineCitation><PubmedData><ArticleIdList><ArticleId IdType="pubmed">{pmid}</ArticleId>{doi}</ArticleIdList></PubmedData></PubmedArticle>"#
    )
}

pub fn pmc_article(pmcid: &str, doi: Option<&str>, title: &str, affiliation: &str) -> String {
    let digits = pmcid.trim_start_matches("PMC");
    let doi = doi
        .map(|doi| format!(r#"<article-id pub-id-type="doi">{doi}</article-id>"#))
        .unwrap_or_default();
    format!(
        r#"<article><front><journal-meta><journal-title-group><journal-title>Test Journal</journal-title></journal-title-group></journal-meta>
<article-meta><article-id pub-id-type="pmc">{digits}</article-id>{doi}
<title-group><article-title>{title}</article-title></title-group>
<contrib-group><contrib contrib-type="author"><name><surname>Roe</surname><given-names>Sam</given-names></name><xref ref-type="aff" rid="a1"/></contrib>
<aff id="a1">{affiliation}</aff></contrib-group>
<pub-date pub-type="epub"><year>2024</year><month>1</month><day>15</day></pub-date>
</article-meta></front></article>"#
    )
}
