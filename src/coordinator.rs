use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{IngestSettings, RunLayout, RunParameters};
use crate::domain::{Db, OutcomeCategory, OutcomeRecord, iso_timestamp};
use crate::error::IngestError;
use crate::file_attachment::FileAttachmentService;
use crate::fs_util::write_atomic;
use crate::id_retrieval::IdRetrievalService;
use crate::jsonl::read_all;
use crate::metadata_ingest::MetadataIngestService;
use crate::ncbi::NcbiClient;
use crate::notify::Notifier;
use crate::store::{AttachmentService, WorkStore};
use crate::tracker::{IngestTracker, Stage};
use crate::transfer::FileTransfer;

/// Final outcome of a run, grouped by category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub start_date: String,
    pub end_date: String,
    pub admin_set_title: String,
    pub generated_at: String,
    pub total_unique_records: usize,
    pub counts: BTreeMap<OutcomeCategory, usize>,
    pub records: BTreeMap<OutcomeCategory, Vec<OutcomeRecord>>,
}

impl IngestReport {
    pub fn from_buckets(params: &RunParameters, buckets: ResultBuckets) -> Self {
        let mut keys = HashSet::new();
        for record in buckets.values().flatten() {
            if let Some(key) = record.ids.dedup_key() {
                keys.insert(key);
            }
        }
        let counts = OutcomeCategory::ALL
            .into_iter()
            .map(|category| {
                let count = buckets.get(&category).map_or(0, Vec::len);
                (category, count)
            })
            .collect();
        Self {
            start_date: params.start_date.to_string(),
            end_date: params.end_date.to_string(),
            admin_set_title: params.admin_set_title.clone(),
            generated_at: iso_timestamp(),
            total_unique_records: keys.len(),
            counts,
            records: buckets,
        }
    }

    /// Rebuilds the report from a run directory without touching the network.
    pub fn from_run_dir(output_dir: &Path) -> Result<Self, IngestError> {
        let layout = RunLayout::new(output_dir);
        if !layout.tracker.exists() {
            return Err(IngestError::MissingCheckpoint(layout.tracker));
        }
        let tracker = IngestTracker::load(&layout.tracker)?;
        let buckets = bucket_outcomes(read_all(&layout.attachment_results)?);
        Ok(Self::from_buckets(tracker.parameters(), buckets))
    }

    pub fn count(&self, category: OutcomeCategory) -> usize {
        self.counts.get(&category).copied().unwrap_or_default()
    }

    pub fn records(&self, category: OutcomeCategory) -> &[OutcomeRecord] {
        self.records.get(&category).map_or(&[], Vec::as_slice)
    }
}

pub type ResultBuckets = BTreeMap<OutcomeCategory, Vec<OutcomeRecord>>;

pub fn bucket_outcomes(outcomes: Vec<OutcomeRecord>) -> ResultBuckets {
    let mut buckets: ResultBuckets = OutcomeCategory::ALL
        .into_iter()
        .map(|category| (category, Vec::new()))
        .collect();
    for outcome in outcomes {
        buckets.entry(outcome.category).or_default().push(outcome);
    }
    buckets
}

/// Drives one run through every stage, skipping the ones the checkpoint
/// already marks complete.
pub struct PubmedIngestCoordinator<N, T, S, M>
where
    N: NcbiClient,
    T: FileTransfer,
    S: WorkStore + AttachmentService,
    M: Notifier,
{
    ncbi: N,
    transfer: T,
    store: S,
    notifier: M,
    settings: IngestSettings,
}

impl<N, T, S, M> PubmedIngestCoordinator<N, T, S, M>
where
    N: NcbiClient,
    T: FileTransfer,
    S: WorkStore + AttachmentService,
    M: Notifier,
{
    pub fn new(ncbi: N, transfer: T, store: S, notifier: M, settings: IngestSettings) -> Self {
        Self {
            ncbi,
            transfer,
            store,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn run(&self, params: &RunParameters) -> Result<IngestReport, IngestError> {
        let admin_set_id = self.require_admin_set(&params.admin_set_title)?;
        let layout = params.layout();
        if layout.tracker.exists() {
            return Err(IngestError::RunExists(layout.output_dir));
        }
        let mut tracker = IngestTracker::build(params, false)?;
        self.execute(&mut tracker, &admin_set_id)
    }

    pub fn resume(&self, output_dir: &Path) -> Result<IngestReport, IngestError> {
        let layout = RunLayout::new(output_dir);
        if !layout.tracker.exists() {
            return Err(IngestError::MissingCheckpoint(layout.tracker));
        }
        let title = IngestTracker::load(&layout.tracker)?
            .parameters()
            .admin_set_title
            .clone();
        let admin_set_id = self.require_admin_set(&title)?;
        let mut tracker = IngestTracker::resume(output_dir)?;
        self.execute(&mut tracker, &admin_set_id)
    }

    fn require_admin_set(&self, title: &str) -> Result<String, IngestError> {
        self.store
            .find_admin_set(title)?
            .ok_or_else(|| IngestError::MissingAdminSet(title.to_string()))
    }

    fn execute(
        &self,
        tracker: &mut IngestTracker,
        admin_set_id: &str,
    ) -> Result<IngestReport, IngestError> {
        let params = tracker.parameters().clone();
        info!(
            start = %params.start_date,
            end = %params.end_date,
            output_dir = %params.output_dir.display(),
            "starting ingest"
        );

        self.stage("build_id_lists", || self.build_id_lists(tracker))?;
        self.stage("load_and_ingest_metadata", || {
            self.load_and_ingest_metadata(tracker, admin_set_id)
        })?;
        self.stage("attach_files", || self.attach_files(tracker))?;
        let buckets = self.stage("load_results", || self.load_results(tracker))?;
        let report = self.stage("finalize_report", || self.finalize_report(tracker, buckets))?;
        self.stage("send_summary_email", || self.send_summary(tracker, &report))?;

        info!(
            total_unique_records = report.total_unique_records,
            "ingest complete"
        );
        Ok(report)
    }

    fn stage<R>(
        &self,
        name: &str,
        step: impl FnOnce() -> Result<R, IngestError>,
    ) -> Result<R, IngestError> {
        step().inspect_err(|err| error!(stage = name, error = %err, "stage failed"))
    }

    fn build_id_lists(&self, tracker: &mut IngestTracker) -> Result<(), IngestError> {
        if tracker.is_completed(Stage::BuildIdLists) {
            info!("id lists already built, skipping");
            return Ok(());
        }
        let layout = tracker.layout().clone();
        {
            let mut service = IdRetrievalService::new(&self.ncbi, &self.settings, tracker);
            for db in Db::ALL {
                let progress = service.retrieve_ids_within_date_range(layout.ids_path(db), db)?;
                if !progress.complete {
                    return Err(IngestError::StageIncomplete(format!(
                        "{db} search stopped at {} of {}",
                        progress.written, progress.total
                    )));
                }
            }
            for db in Db::ALL {
                let progress = service.stream_and_write_alternate_ids(
                    layout.ids_path(db),
                    layout.alternate_ids_path(db),
                    db,
                    self.settings.batch_size,
                )?;
                if !progress.complete {
                    return Err(IngestError::StageIncomplete(format!(
                        "{db} id conversion stopped after {} search hits",
                        progress.total
                    )));
                }
            }
            service.adjust_id_lists(
                layout.alternate_ids_path(Db::Pubmed),
                layout.alternate_ids_path(Db::Pmc),
            )?;
        }
        tracker.mark_completed(Stage::BuildIdLists);
        tracker.save();
        Ok(())
    }

    fn load_and_ingest_metadata(
        &self,
        tracker: &mut IngestTracker,
        admin_set_id: &str,
    ) -> Result<(), IngestError> {
        if tracker.is_completed(Stage::LoadAndIngestMetadata) {
            info!("metadata already ingested, skipping");
            return Ok(());
        }
        let layout = tracker.layout().clone();
        let mut service =
            MetadataIngestService::new(&self.ncbi, &self.store, &self.settings, tracker, admin_set_id)?;
        let mut incomplete = Vec::new();
        // PMC first: a PubMed record of the same article then finds the work.
        for db in [Db::Pmc, Db::Pubmed] {
            service.load_alternate_ids_from_file(layout.alternate_ids_path(db), db)?;
            let progress = service.batch_retrieve_and_process_metadata(self.settings.batch_size, db)?;
            if !progress.complete {
                warn!(%db, abandoned = progress.abandoned_batches, "metadata batches abandoned");
                incomplete.push(format!("{db}: {} batches abandoned", progress.abandoned_batches));
            }
        }
        drop(service);

        if !incomplete.is_empty() {
            return Err(IngestError::StageIncomplete(incomplete.join(", ")));
        }
        tracker.mark_completed(Stage::LoadAndIngestMetadata);
        tracker.save();
        Ok(())
    }

    fn attach_files(&self, tracker: &mut IngestTracker) -> Result<(), IngestError> {
        let mut service = FileAttachmentService::new(
            &self.ncbi,
            &self.transfer,
            &self.store,
            &self.store,
            &self.settings,
            tracker,
        )?;
        service.attach_files()?;
        Ok(())
    }

    fn load_results(&self, tracker: &mut IngestTracker) -> Result<ResultBuckets, IngestError> {
        let outcomes = read_all::<OutcomeRecord>(&tracker.layout().attachment_results)?;
        let buckets = bucket_outcomes(outcomes);
        if !tracker.is_completed(Stage::LoadResults) {
            for (category, records) in &buckets {
                tracker.set_counter(Stage::LoadResults, category.as_str(), records.len() as u64);
            }
            tracker.mark_completed(Stage::LoadResults);
            tracker.save();
        }
        Ok(buckets)
    }

    fn finalize_report(
        &self,
        tracker: &mut IngestTracker,
        buckets: ResultBuckets,
    ) -> Result<IngestReport, IngestError> {
        let path = tracker.layout().final_report.clone();
        if tracker.is_completed(Stage::FinalizeReport) {
            match load_report(&path) {
                Ok(report) => {
                    info!("final report already written, skipping");
                    return Ok(report);
                }
                Err(err) => warn!(error = %err, "final report unreadable, rebuilding"),
            }
        }

        let report = IngestReport::from_buckets(tracker.parameters(), buckets);
        let content = serde_json::to_vec_pretty(&report)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        write_atomic(&path, &content)?;
        tracker.set_counter(
            Stage::FinalizeReport,
            "total_unique_records",
            report.total_unique_records as u64,
        );
        tracker.mark_completed(Stage::FinalizeReport);
        tracker.save();
        info!(path = %path.display(), "final report written");
        Ok(report)
    }

    fn send_summary(
        &self,
        tracker: &mut IngestTracker,
        report: &IngestReport,
    ) -> Result<(), IngestError> {
        if tracker.is_completed(Stage::SendSummary) {
            info!("summary already sent, skipping");
            return Ok(());
        }
        self.notifier.send_summary(report)?;
        tracker.mark_completed(Stage::SendSummary);
        tracker.save();
        Ok(())
    }
}

fn load_report(path: &Path) -> Result<IngestReport, IngestError> {
    let content =
        fs::read_to_string(path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    serde_json::from_str(&content).map_err(|err| IngestError::Filesystem(err.to_string()))
}
