use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::attributes::{AffiliationMatcher, builder_for};
use crate::config::IngestSettings;
use crate::domain::{
    Db, IdentifierRecord, OutcomeCategory, OutcomeRecord, WorkAttributes, normalize_pmcid,
    normalize_pmid,
};
use crate::error::IngestError;
use crate::jsonl::{BufferedOutcomeLog, read_identifier_records};
use crate::ncbi::NcbiClient;
use crate::store::WorkStore;
use crate::tracker::{IngestTracker, Stage};
use crate::xml::XmlNode;

static PMC_ERROR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bPMC(\d+)\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetadataProgress {
    pub complete: bool,
    pub staged: usize,
    pub recorded: u64,
    pub abandoned_batches: usize,
}

/// Creates one work per new identifier record from fetched metadata
/// documents. Every decision lands in the metadata outcome log, which is also
/// what a resumed run consults to skip records.
pub struct MetadataIngestService<'a> {
    client: &'a dyn NcbiClient,
    store: &'a dyn WorkStore,
    tracker: &'a mut IngestTracker,
    admin_set_id: String,
    matcher: AffiliationMatcher,
    log: BufferedOutcomeLog,
    staged: Vec<IdentifierRecord>,
    staged_db: Option<Db>,
    cursor_base: u64,
    recorded: u64,
}

impl<'a> MetadataIngestService<'a> {
    pub fn new(
        client: &'a dyn NcbiClient,
        store: &'a dyn WorkStore,
        settings: &IngestSettings,
        tracker: &'a mut IngestTracker,
        admin_set_id: &str,
    ) -> Result<Self, IngestError> {
        let log = BufferedOutcomeLog::open(
            &tracker.layout().metadata_results,
            settings.outcome_flush_threshold,
        )?;
        Ok(Self {
            client,
            store,
            tracker,
            admin_set_id: admin_set_id.to_string(),
            matcher: AffiliationMatcher::new(&settings.affiliation_variants)?,
            log,
            staged: Vec::new(),
            staged_db: None,
            cursor_base: 0,
            recorded: 0,
        })
    }

    pub fn staged(&self) -> &[IdentifierRecord] {
        &self.staged
    }

    /// Reads the adjusted id list for `db` and stages every record that has
    /// no outcome yet and no matching work in the store. Matches are recorded
    /// as `skipped` right away.
    pub fn load_alternate_ids_from_file(&mut self, path: &Path, db: Db) -> Result<usize, IngestError> {
        let stage = Stage::Metadata(db);
        self.staged.clear();
        self.staged_db = Some(db);
        self.cursor_base = self.tracker.cursor(stage);
        self.recorded = 0;
        if self.tracker.is_completed(stage) {
            return Ok(0);
        }

        let records = read_identifier_records(path)?;
        let total = records.len();
        let mut already_done = 0;
        for record in records {
            let Some(key) = record.dedup_key() else {
                continue;
            };
            if self.log.contains(&key) {
                already_done += 1;
                continue;
            }
            match self.find_existing(&record) {
                Ok(Some(work_id)) => {
                    let url = self.store.work_url(&work_id);
                    self.record(OutcomeRecord::new(
                        record.with_work(&work_id, url),
                        OutcomeCategory::Skipped,
                        "work already exists",
                    ))?;
                }
                Ok(None) => self.staged.push(record),
                Err(err) => {
                    warn!(%db, id = %record.label(), error = %err, "existence check failed");
                    self.record(OutcomeRecord::new(
                        record,
                        OutcomeCategory::Failed,
                        err.to_string(),
                    ))?;
                }
            }
        }
        self.log.flush()?;
        self.checkpoint(stage);
        info!(
            %db,
            total,
            already_done,
            staged = self.staged.len(),
            existing = self.recorded,
            "loaded identifier records"
        );
        Ok(self.staged.len())
    }

    /// Fetches metadata for the staged records in batches and ingests each
    /// returned document. A batch whose fetch fails is abandoned without
    /// outcomes so a later run retries it.
    pub fn batch_retrieve_and_process_metadata(
        &mut self,
        batch_size: usize,
        db: Db,
    ) -> Result<MetadataProgress, IngestError> {
        let stage = Stage::Metadata(db);
        if self.tracker.is_completed(stage) {
            info!(%db, "metadata already ingested, skipping");
            return Ok(MetadataProgress {
                complete: true,
                staged: 0,
                recorded: self.tracker.cursor(stage),
                abandoned_batches: 0,
            });
        }
        if self.staged_db != Some(db) {
            return Err(IngestError::StageIncomplete(format!(
                "no identifier records loaded for {db}"
            )));
        }

        let staged = std::mem::take(&mut self.staged);
        let mut abandoned = 0;
        for (batch_no, chunk) in staged.chunks(batch_size.max(1)).enumerate() {
            let mut ids = Vec::with_capacity(chunk.len());
            let mut requested = Vec::with_capacity(chunk.len());
            for record in chunk {
                match record.id_for(db) {
                    Some(id) => {
                        ids.push(id.to_string());
                        requested.push(record);
                    }
                    None => self.record(OutcomeRecord::new(
                        record.clone(),
                        OutcomeCategory::Failed,
                        format!("record has no {db} identifier"),
                    ))?,
                }
            }
            if ids.is_empty() {
                continue;
            }

            let body = match self.client.fetch_metadata(db, &ids) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%db, batch = batch_no, size = ids.len(), error = %err, "metadata fetch failed, abandoning batch");
                    abandoned += 1;
                    continue;
                }
            };
            match XmlNode::parse(&body) {
                Ok(doc) => self.process_batch(db, &requested, &doc)?,
                Err(err) => {
                    for record in requested {
                        self.record(OutcomeRecord::new(
                            record.clone(),
                            OutcomeCategory::Failed,
                            format!("unreadable metadata response: {err}"),
                        ))?;
                    }
                }
            }
            self.log.flush()?;
            self.checkpoint(stage);
            debug!(%db, batch = batch_no, recorded = self.recorded, "metadata batch processed");
        }

        self.log.flush()?;
        self.checkpoint(stage);
        let complete = abandoned == 0;
        if complete {
            self.tracker.mark_completed(stage);
            self.tracker.save();
        }
        info!(%db, staged = staged.len(), recorded = self.recorded, abandoned, "metadata ingest finished");
        Ok(MetadataProgress {
            complete,
            staged: staged.len(),
            recorded: self.recorded,
            abandoned_batches: abandoned,
        })
    }

    fn process_batch(
        &mut self,
        db: Db,
        requested: &[&IdentifierRecord],
        doc: &XmlNode,
    ) -> Result<(), IngestError> {
        let set = doc.children().next();
        let mut documents: HashMap<String, &XmlNode> = HashMap::new();
        let mut errors: HashMap<String, String> = HashMap::new();
        for node in set.into_iter().flat_map(XmlNode::children) {
            if node.name == "error" {
                for id in error_ids(node) {
                    errors.insert(id, node.text());
                }
                continue;
            }
            match document_id(db, node) {
                Some(id) => {
                    documents.entry(id).or_insert(node);
                }
                None => warn!(%db, element = %node.name, "document without identifier"),
            }
        }

        for record in requested {
            let Some(id) = record.id_for(db) else {
                continue;
            };
            let outcome = if let Some(message) = errors.get(id) {
                OutcomeRecord::new((*record).clone(), OutcomeCategory::Failed, message.clone())
            } else if let Some(node) = documents.get(id) {
                self.ingest_document(record, node)
            } else {
                let message = match db {
                    Db::Pubmed => "pmid not present in metadata response",
                    Db::Pmc => "metadata not returned",
                };
                OutcomeRecord::new((*record).clone(), OutcomeCategory::Failed, message)
            };
            self.record(outcome)?;
        }
        Ok(())
    }

    fn ingest_document(&self, record: &IdentifierRecord, node: &XmlNode) -> OutcomeRecord {
        let Some(builder) = builder_for(node) else {
            return OutcomeRecord::new(
                record.clone(),
                OutcomeCategory::Failed,
                format!("no attribute builder for <{}>", node.name),
            );
        };
        let params = self.tracker.parameters();
        let mut attrs = match builder.build(&params.admin_set_title, &params.depositor) {
            Ok(attrs) => attrs,
            Err(err) => {
                return OutcomeRecord::new(record.clone(), OutcomeCategory::Failed, err.to_string());
            }
        };
        fill_missing_ids(&mut attrs, record);

        if !self.matcher.matches(&attrs) {
            return OutcomeRecord::new(
                record.clone(),
                OutcomeCategory::SkippedNonMatchingAffiliation,
                "no author affiliation matches",
            );
        }

        let combined = IdentifierRecord {
            pmid: attrs.pmid.clone(),
            pmcid: attrs.pmcid.clone(),
            doi: attrs.doi.clone(),
            ..IdentifierRecord::default()
        };
        match self.find_existing(&combined) {
            Ok(Some(work_id)) => {
                let url = self.store.work_url(&work_id);
                return OutcomeRecord::new(
                    record.clone().with_work(&work_id, url),
                    OutcomeCategory::Skipped,
                    "work already exists",
                );
            }
            Ok(None) => {}
            Err(err) => {
                return OutcomeRecord::new(record.clone(), OutcomeCategory::Failed, err.to_string());
            }
        }

        let work_id = match self.store.create_work(&attrs) {
            Ok(work_id) => work_id,
            Err(err) => {
                return OutcomeRecord::new(record.clone(), OutcomeCategory::Failed, err.to_string());
            }
        };
        if let Err(err) =
            self.store
                .assign_admin_set(&work_id, &self.admin_set_id, &params.depositor)
        {
            if let Err(delete_err) = self.store.delete_work(&work_id) {
                error!(work_id = %work_id, error = %delete_err, "failed to delete partial work");
            }
            return OutcomeRecord::new(record.clone(), OutcomeCategory::Failed, err.to_string());
        }

        let url = self.store.work_url(&work_id);
        debug!(work_id = %work_id, id = %record.label(), "created work");
        OutcomeRecord::new(
            record.clone().with_work(&work_id, url),
            OutcomeCategory::SuccessfullyIngested,
            "work created",
        )
    }

    fn find_existing(&self, record: &IdentifierRecord) -> Result<Option<String>, IngestError> {
        for candidate in record.lookup_candidates() {
            if let Some(work_id) = self.store.find_work_by_alternate_id(&candidate)? {
                return Ok(Some(work_id));
            }
        }
        Ok(None)
    }

    fn record(&mut self, outcome: OutcomeRecord) -> Result<(), IngestError> {
        self.recorded += 1;
        self.log.record(outcome)
    }

    fn checkpoint(&mut self, stage: Stage) {
        self.tracker
            .advance_cursor(stage, self.cursor_base + self.recorded);
        self.tracker.save();
    }
}

fn fill_missing_ids(attrs: &mut WorkAttributes, record: &IdentifierRecord) {
    if attrs.pmid.is_none() {
        attrs.pmid = record.pmid.clone();
    }
    if attrs.pmcid.is_none() {
        attrs.pmcid = record.pmcid.clone();
    }
    if attrs.doi.is_none() {
        attrs.doi = record.doi.clone();
    }
    attrs.refresh_identifier_list();
}

/// The id a fetched document answers to in the namespace it was fetched from.
fn document_id(db: Db, node: &XmlNode) -> Option<String> {
    match db {
        Db::Pubmed => node
            .find_text("MedlineCitation/PMID")
            .and_then(|pmid| normalize_pmid(&pmid)),
        Db::Pmc => node
            .find("front/article-meta")?
            .children_named("article-id")
            .filter(|id| {
                matches!(
                    id.attr("pub-id-type"),
                    Some("pmc") | Some("pmcid") | Some("pmcaid")
                )
            })
            .find_map(|id| normalize_pmcid(&id.text())),
    }
}

/// PMC ids named by an `<error>` element of a PMC efetch response.
/// The `id` attribute when it holds a PMC id, otherwise every `PMC<digits>`
/// token in the element text.
fn error_ids(node: &XmlNode) -> Vec<String> {
    if let Some(id) = node.attr("id").and_then(normalize_pmcid) {
        return vec![id];
    }
    PMC_ERROR_ID
        .captures_iter(&node.text())
        .filter_map(|caps| caps.get(1))
        .filter_map(|digits| normalize_pmcid(digits.as_str()))
        .collect()
}
