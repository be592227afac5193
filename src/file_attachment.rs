use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IngestSettings;
use crate::domain::{OutcomeCategory, OutcomeRecord};
use crate::error::IngestError;
use crate::fs_util::{extract_tgz, find_first_pdf};
use crate::jsonl::{BufferedOutcomeLog, read_all};
use crate::ncbi::{LinkFormat, NcbiClient, OaLookup};
use crate::store::{AttachmentService, WorkStore};
use crate::tracker::{IngestTracker, Stage};
use crate::transfer::FileTransfer;

pub const NO_LINK_MESSAGE: &str = "no PDF or TGZ link found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AttachmentProgress {
    pub complete: bool,
    pub processed: u64,
    pub previously_recorded: u64,
    pub downloads: u64,
}

/// Why a metadata outcome does not go through the download path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filtered {
    /// An earlier run already wrote this record to the attachment log.
    AlreadyRecorded,
    /// Final outcome for the record, written without a download.
    Outcome(OutcomeRecord),
}

/// Attaches open-access PDFs to the works the metadata stage created or
/// matched, writing one attachment outcome per metadata outcome.
pub struct FileAttachmentService<'a> {
    client: &'a dyn NcbiClient,
    transfer: &'a dyn FileTransfer,
    store: &'a dyn WorkStore,
    attachments: &'a dyn AttachmentService,
    tracker: &'a mut IngestTracker,
    max_lookup_retries: u32,
    save_every: u64,
    log: BufferedOutcomeLog,
}

impl<'a> FileAttachmentService<'a> {
    pub fn new(
        client: &'a dyn NcbiClient,
        transfer: &'a dyn FileTransfer,
        store: &'a dyn WorkStore,
        attachments: &'a dyn AttachmentService,
        settings: &IngestSettings,
        tracker: &'a mut IngestTracker,
    ) -> Result<Self, IngestError> {
        let log = BufferedOutcomeLog::open(
            &tracker.layout().attachment_results,
            settings.outcome_flush_threshold,
        )?;
        Ok(Self {
            client,
            transfer,
            store,
            attachments,
            tracker,
            max_lookup_retries: settings.max_lookup_retries.max(1),
            save_every: settings.outcome_flush_threshold.max(1) as u64,
            log,
        })
    }

    pub fn attach_files(&mut self) -> Result<AttachmentProgress, IngestError> {
        let stage = Stage::AttachFiles;
        if self.tracker.is_completed(stage) {
            info!("attachments already processed, skipping");
            return Ok(AttachmentProgress {
                complete: true,
                processed: self.tracker.cursor(stage),
                ..AttachmentProgress::default()
            });
        }

        let metadata_path = self.tracker.layout().metadata_results.clone();
        let outcomes: Vec<OutcomeRecord> = read_all(&metadata_path)?;
        let mut progress = AttachmentProgress::default();
        info!(records = outcomes.len(), "attaching files");

        for (index, metadata) in outcomes.iter().enumerate() {
            let outcome = match self.filter_record(metadata)? {
                Some(Filtered::AlreadyRecorded) => {
                    progress.previously_recorded += 1;
                    None
                }
                Some(Filtered::Outcome(outcome)) => Some(outcome),
                None => {
                    progress.downloads += 1;
                    Some(self.process_record(metadata))
                }
            };
            if let Some(outcome) = outcome {
                debug!(id = %outcome.ids.label(), category = %outcome.category, "attachment outcome");
                self.log.record(outcome)?;
            }
            progress.processed += 1;

            let cursor = index as u64 + 1;
            self.tracker.advance_cursor(stage, cursor);
            if cursor % self.save_every == 0 {
                self.log.flush()?;
                self.tracker.save();
            }
        }

        self.log.flush()?;
        self.tracker.save();
        self.tracker.mark_completed(stage);
        self.tracker.save();
        progress.complete = true;
        info!(
            processed = progress.processed,
            downloads = progress.downloads,
            previously_recorded = progress.previously_recorded,
            "attachment stage finished"
        );
        Ok(progress)
    }

    /// Decides whether a metadata outcome skips the download path. `None`
    /// means the record should be processed.
    pub fn filter_record(&self, metadata: &OutcomeRecord) -> Result<Option<Filtered>, IngestError> {
        let Some(key) = metadata.ids.dedup_key() else {
            return Ok(Some(Filtered::AlreadyRecorded));
        };
        if self.log.contains(&key) {
            return Ok(Some(Filtered::AlreadyRecorded));
        }

        match metadata.category {
            OutcomeCategory::Failed | OutcomeCategory::SkippedNonMatchingAffiliation => {
                return Ok(Some(Filtered::Outcome(metadata.clone())));
            }
            OutcomeCategory::SuccessfullyIngested
            | OutcomeCategory::Skipped
            | OutcomeCategory::SuccessfullyAttached => {}
        }

        let Some(work_id) = metadata.ids.work_id.as_deref() else {
            return Ok(Some(Filtered::Outcome(OutcomeRecord::new(
                metadata.ids.clone(),
                OutcomeCategory::Failed,
                "metadata outcome has no work id",
            ))));
        };

        if metadata.ids.pmcid.is_none() {
            let category = match metadata.category {
                OutcomeCategory::SuccessfullyIngested => OutcomeCategory::SuccessfullyIngested,
                _ => OutcomeCategory::Skipped,
            };
            return Ok(Some(Filtered::Outcome(OutcomeRecord::new(
                metadata.ids.clone(),
                category,
                "no PMCID, metadata only",
            ))));
        }

        let file_sets = match self.store.file_set_ids(work_id) {
            Ok(file_sets) => file_sets,
            Err(err) => {
                return Ok(Some(Filtered::Outcome(OutcomeRecord::new(
                    metadata.ids.clone(),
                    OutcomeCategory::Failed,
                    err.to_string(),
                ))));
            }
        };
        if !file_sets.is_empty() {
            return Ok(Some(Filtered::Outcome(OutcomeRecord::new(
                metadata.ids.clone(),
                OutcomeCategory::Skipped,
                "work already has files",
            ))));
        }
        Ok(None)
    }

    /// Looks up the open-access package, downloads it and attaches the PDF.
    /// Failures become a `failed` outcome for this record only.
    pub fn process_record(&self, metadata: &OutcomeRecord) -> OutcomeRecord {
        let ids = metadata.ids.clone();
        let (Some(pmcid), Some(work_id)) = (ids.pmcid.clone(), ids.work_id.clone()) else {
            return OutcomeRecord::new(ids, OutcomeCategory::Failed, "record has no pmcid or work id");
        };

        let lookup = match self.lookup_with_retries(&pmcid) {
            Ok(lookup) => lookup,
            Err(err) => {
                return OutcomeRecord::new(
                    ids,
                    OutcomeCategory::Failed,
                    format!("open access lookup failed: {err}"),
                );
            }
        };
        let link = lookup
            .link(LinkFormat::Pdf)
            .or_else(|| lookup.link(LinkFormat::Tgz))
            .cloned();
        let Some(link) = link else {
            if let Some(reason) = &lookup.error {
                debug!(pmcid = %pmcid, reason = %reason, "no open access package");
            }
            return OutcomeRecord::new(ids, OutcomeCategory::SuccessfullyAttached, NO_LINK_MESSAGE);
        };

        match self.download_and_attach(&work_id, &pmcid, link.format, &link.href) {
            Ok(file_name) => OutcomeRecord::new(
                ids,
                OutcomeCategory::SuccessfullyAttached,
                format!("attached {file_name}"),
            )
            .with_file_name(file_name),
            Err(err) => {
                warn!(pmcid = %pmcid, work_id = %work_id, error = %err, "attachment failed");
                OutcomeRecord::new(ids, OutcomeCategory::Failed, err.to_string())
            }
        }
    }

    /// `<pmcid>_<NNN>.pdf`, numbered after the work's existing file sets.
    pub fn generate_filename_for_work(
        &self,
        work_id: &str,
        pmcid: &str,
    ) -> Result<String, IngestError> {
        let existing = self.store.file_set_ids(work_id)?.len();
        Ok(format!("{pmcid}_{:03}.pdf", existing + 1))
    }

    fn lookup_with_retries(&self, pmcid: &str) -> Result<OaLookup, IngestError> {
        let mut attempt = 1;
        loop {
            match self.client.lookup_open_access(pmcid) {
                Ok(lookup) => return Ok(lookup),
                Err(err) if attempt < self.max_lookup_retries => {
                    warn!(pmcid, attempt, error = %err, "open access lookup failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn download_and_attach(
        &self,
        work_id: &str,
        pmcid: &str,
        format: LinkFormat,
        href: &str,
    ) -> Result<String, IngestError> {
        let file_name = self.generate_filename_for_work(work_id, pmcid)?;
        let staging_root = &self.tracker.layout().staging_dir;
        fs::create_dir_all(staging_root).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(pmcid)
            .tempdir_in(staging_root)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;

        let pdf = match format {
            LinkFormat::Pdf => {
                let target = staging.path().join(&file_name);
                self.transfer.download(href, &target)?;
                target
            }
            LinkFormat::Tgz => {
                let archive = staging.path().join(format!("{pmcid}.tar.gz"));
                self.transfer.download(href, &archive)?;
                let extracted = staging.path().join("extracted");
                extract_tgz(&archive, &extracted)?;
                find_first_pdf(&extracted)?.ok_or_else(|| {
                    IngestError::Archive(format!("no PDF found in {}", file_label(&archive)))
                })?
            }
        };

        let file_id = self.attachments.attach_file(work_id, &pdf, &file_name)?;
        info!(pmcid, work_id, file_id = %file_id, file = %file_name, "attached file");
        Ok(file_name)
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
