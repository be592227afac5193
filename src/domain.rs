use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Db {
    Pubmed,
    Pmc,
}

impl Db {
    pub const ALL: [Db; 2] = [Db::Pubmed, Db::Pmc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Db::Pubmed => "pubmed",
            Db::Pmc => "pmc",
        }
    }
}

impl fmt::Display for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Db {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pubmed" => Ok(Db::Pubmed),
            "pmc" => Ok(Db::Pmc),
            other => Err(IngestError::ConfigParse(format!("unknown database: {other}"))),
        }
    }
}

/// Normalizes a PMC identifier to `PMC<digits>`. Bare digits are accepted.
pub fn normalize_pmcid(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let digits = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("PMC") => &trimmed[3..],
        _ => trimmed,
    };
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(format!("PMC{digits}"))
}

pub fn normalize_pmid(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn normalize_doi(value: &str) -> Option<String> {
    let mut trimmed = value.trim();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(head) = trimmed.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                trimmed = trimmed[prefix.len()..].trim();
            }
        }
    }
    if !trimmed.starts_with("10.") || !trimmed.contains('/') {
        return None;
    }
    Some(trimmed.to_string())
}

/// Canonical identity of an article across namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DedupKey {
    Doi(String),
    Pmcid(String),
    Pmid(String),
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::Doi(value) => write!(f, "doi:{value}"),
            DedupKey::Pmcid(value) => write!(f, "pmcid:{value}"),
            DedupKey::Pmid(value) => write!(f, "pmid:{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentifierRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IdentifierRecord {
    pub fn new(
        pmid: Option<&str>,
        pmcid: Option<&str>,
        doi: Option<&str>,
    ) -> Result<Self, IngestError> {
        Self {
            pmid: pmid.map(str::to_string),
            pmcid: pmcid.map(str::to_string),
            doi: doi.map(str::to_string),
            ..Self::default()
        }
        .normalized()
    }

    pub fn from_db_id(db: Db, id: &str) -> Result<Self, IngestError> {
        match db {
            Db::Pubmed => Self::new(Some(id), None, None),
            Db::Pmc => Self::new(None, Some(id), None),
        }
    }

    /// Normalizes the identifier fields and enforces that at least one is set.
    pub fn normalized(mut self) -> Result<Self, IngestError> {
        self.pmid = self.pmid.as_deref().and_then(normalize_pmid);
        self.pmcid = self.pmcid.as_deref().and_then(normalize_pmcid);
        self.doi = self.doi.as_deref().and_then(normalize_doi);
        if self.pmid.is_none() && self.pmcid.is_none() && self.doi.is_none() {
            return Err(IngestError::InvalidIdentifier(
                "record carries no pmid, pmcid or doi".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn dedup_key(&self) -> Option<DedupKey> {
        if let Some(doi) = self.doi.as_deref().filter(|v| !v.is_empty()) {
            return Some(DedupKey::Doi(doi.to_ascii_lowercase()));
        }
        if let Some(pmcid) = self.pmcid.as_deref().filter(|v| !v.is_empty()) {
            return Some(DedupKey::Pmcid(pmcid.to_ascii_uppercase()));
        }
        self.pmid
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|pmid| DedupKey::Pmid(pmid.to_string()))
    }

    /// Identifiers in the order they are checked against the record store.
    pub fn lookup_candidates(&self) -> Vec<DedupKey> {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        let mut candidates = Vec::new();
        if let Some(doi) = non_empty(&self.doi) {
            candidates.push(DedupKey::Doi(doi.to_ascii_lowercase()));
        }
        if let Some(pmcid) = non_empty(&self.pmcid) {
            candidates.push(DedupKey::Pmcid(pmcid.to_ascii_uppercase()));
        }
        if let Some(pmid) = non_empty(&self.pmid) {
            candidates.push(DedupKey::Pmid(pmid));
        }
        candidates
    }

    pub fn id_for(&self, db: Db) -> Option<&str> {
        match db {
            Db::Pubmed => self.pmid.as_deref(),
            Db::Pmc => self.pmcid.as_deref(),
        }
    }

    pub fn with_work(mut self, work_id: &str, cdr_url: Option<String>) -> Self {
        self.work_id = Some(work_id.to_string());
        self.cdr_url = cdr_url;
        self
    }

    pub fn label(&self) -> String {
        self.dedup_key()
            .map(|key| key.to_string())
            .unwrap_or_else(|| "unidentified".to_string())
    }
}

/// One line of a raw search-result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: u64,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    SuccessfullyIngested,
    SuccessfullyAttached,
    Skipped,
    SkippedNonMatchingAffiliation,
    Failed,
}

impl OutcomeCategory {
    pub const ALL: [OutcomeCategory; 5] = [
        OutcomeCategory::SuccessfullyIngested,
        OutcomeCategory::SuccessfullyAttached,
        OutcomeCategory::Skipped,
        OutcomeCategory::SkippedNonMatchingAffiliation,
        OutcomeCategory::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCategory::SuccessfullyIngested => "successfully_ingested",
            OutcomeCategory::SuccessfullyAttached => "successfully_attached",
            OutcomeCategory::Skipped => "skipped",
            OutcomeCategory::SkippedNonMatchingAffiliation => "skipped_non_matching_affiliation",
            OutcomeCategory::Failed => "failed",
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub ids: IdentifierRecord,
    pub timestamp: String,
    pub category: OutcomeCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl OutcomeRecord {
    pub fn new(ids: IdentifierRecord, category: OutcomeCategory, message: impl Into<String>) -> Self {
        Self {
            ids,
            timestamp: iso_timestamp(),
            category,
            message: message.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
    #[serde(default)]
    pub affiliations: Vec<String>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkAttributes {
    pub title: String,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub date_issued: Option<String>,
    #[serde(default)]
    pub journal_title: Option<String>,
    #[serde(default)]
    pub journal_volume: Option<String>,
    #[serde(default)]
    pub journal_issue: Option<String>,
    #[serde(default)]
    pub page_start: Option<String>,
    #[serde(default)]
    pub page_end: Option<String>,
    #[serde(default)]
    pub issn: Vec<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub funders: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub pmid: Option<String>,
    #[serde(default)]
    pub pmcid: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub identifier: Vec<String>,
    pub resource_type: String,
    #[serde(default)]
    pub admin_set_title: Option<String>,
    #[serde(default)]
    pub depositor: Option<String>,
}

impl WorkAttributes {
    pub fn affiliations(&self) -> impl Iterator<Item = &str> {
        self.authors
            .iter()
            .flat_map(|author| author.affiliations.iter().map(String::as_str))
    }

    /// Rebuilds the formatted `identifier` list from the bare id fields.
    pub fn refresh_identifier_list(&mut self) {
        let mut identifier = Vec::new();
        if let Some(pmid) = &self.pmid {
            identifier.push(format!("PMID: {pmid}"));
        }
        if let Some(pmcid) = &self.pmcid {
            identifier.push(format!("PMCID: {pmcid}"));
        }
        if let Some(doi) = &self.doi {
            identifier.push(format!("DOI: https://dx.doi.org/{doi}"));
        }
        self.identifier = identifier;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn normalize_pmcid_variants() {
        assert_eq!(normalize_pmcid("pmc123").as_deref(), Some("PMC123"));
        assert_eq!(normalize_pmcid(" 456 ").as_deref(), Some("PMC456"));
        assert_eq!(normalize_pmcid("PMCX1"), None);
    }

    #[test]
    fn normalize_doi_strips_resolver() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1000/ABC").as_deref(),
            Some("10.1000/ABC")
        );
        assert_eq!(normalize_doi("not-a-doi"), None);
    }

    #[test]
    fn record_requires_an_identifier() {
        let err = IdentifierRecord::new(None, Some("bogus"), Some("")).unwrap_err();
        assert_matches!(err, IngestError::InvalidIdentifier(_));
    }

    #[test]
    fn dedup_key_prefers_doi_then_pmcid() {
        let full = IdentifierRecord::new(Some("1"), Some("PMC2"), Some("10.1/Abc")).unwrap();
        assert_eq!(full.dedup_key(), Some(DedupKey::Doi("10.1/abc".to_string())));

        let no_doi = IdentifierRecord::new(Some("1"), Some("2"), None).unwrap();
        assert_eq!(no_doi.dedup_key(), Some(DedupKey::Pmcid("PMC2".to_string())));

        let pmid_only = IdentifierRecord::new(Some("1"), None, None).unwrap();
        assert_eq!(pmid_only.dedup_key(), Some(DedupKey::Pmid("1".to_string())));
    }

    #[test]
    fn lookup_candidates_keep_their_namespace() {
        let record = IdentifierRecord::new(Some("7000001"), Some("pmc7000001"), Some("10.1/Abc"))
            .unwrap();
        assert_eq!(
            record.lookup_candidates(),
            vec![
                DedupKey::Doi("10.1/abc".to_string()),
                DedupKey::Pmcid("PMC7000001".to_string()),
                DedupKey::Pmid("7000001".to_string()),
            ]
        );
    }

    #[test]
    fn outcome_category_serializes_snake_case() {
        let json = serde_json::to_string(&OutcomeCategory::SkippedNonMatchingAffiliation).unwrap();
        assert_eq!(json, "\"skipped_non_matching_affiliation\"");
    }
}
