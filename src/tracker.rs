use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{RunLayout, RunParameters};
use crate::domain::{Db, iso_timestamp};
use crate::error::IngestError;
use crate::fs_util::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BuildIdLists,
    RetrieveIds(Db),
    AlternateIds(Db),
    AdjustIdLists,
    LoadAndIngestMetadata,
    Metadata(Db),
    AttachFiles,
    LoadResults,
    FinalizeReport,
    SendSummary,
}

impl Stage {
    pub fn all() -> Vec<Stage> {
        let mut stages = vec![Stage::BuildIdLists];
        stages.extend(Db::ALL.map(Stage::RetrieveIds));
        stages.extend(Db::ALL.map(Stage::AlternateIds));
        stages.push(Stage::AdjustIdLists);
        stages.push(Stage::LoadAndIngestMetadata);
        stages.extend(Db::ALL.map(Stage::Metadata));
        stages.extend([
            Stage::AttachFiles,
            Stage::LoadResults,
            Stage::FinalizeReport,
            Stage::SendSummary,
        ]);
        stages
    }

    pub fn key(&self) -> String {
        match self {
            Stage::BuildIdLists => "build_id_lists".to_string(),
            Stage::RetrieveIds(db) => format!("retrieve_ids_within_date_range.{db}"),
            Stage::AlternateIds(db) => format!("stream_and_write_alternate_ids.{db}"),
            Stage::AdjustIdLists => "adjust_id_lists".to_string(),
            Stage::LoadAndIngestMetadata => "load_and_ingest_metadata".to_string(),
            Stage::Metadata(db) => format!("batch_retrieve_and_process_metadata.{db}"),
            Stage::AttachFiles => "attach_files".to_string(),
            Stage::LoadResults => "load_results".to_string(),
            Stage::FinalizeReport => "finalize_report".to_string(),
            Stage::SendSummary => "send_summary_email".to_string(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub parameters: RunParameters,
    pub layout: RunLayout,
    pub started_at: String,
    #[serde(default)]
    pub restarted_at: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    pub run: RunInfo,
    #[serde(default)]
    pub stages: BTreeMap<String, StageProgress>,
}

/// Durable checkpoint of pipeline progress, rewritten in full on every save.
#[derive(Debug)]
pub struct IngestTracker {
    path: PathBuf,
    state: TrackerState,
}

impl IngestTracker {
    pub fn build(params: &RunParameters, resume: bool) -> Result<Self, IngestError> {
        if resume {
            Self::resume(&params.output_dir)
        } else {
            Self::create(params)
        }
    }

    pub fn create(params: &RunParameters) -> Result<Self, IngestError> {
        let layout = params.layout();
        fs::create_dir_all(&layout.output_dir)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let stages = Stage::all()
            .into_iter()
            .map(|stage| (stage.key(), StageProgress::default()))
            .collect();
        let tracker = Self {
            path: layout.tracker.clone(),
            state: TrackerState {
                run: RunInfo {
                    parameters: params.clone(),
                    layout,
                    started_at: iso_timestamp(),
                    restarted_at: Vec::new(),
                },
                stages,
            },
        };
        // Nothing can be resumed without this first write, so it is not optional.
        tracker.try_save()?;
        info!(path = %tracker.path.display(), "created ingest checkpoint");
        Ok(tracker)
    }

    pub fn resume(output_dir: &Path) -> Result<Self, IngestError> {
        let layout = RunLayout::new(output_dir);
        if !layout.tracker.exists() {
            return Err(IngestError::MissingCheckpoint(layout.tracker));
        }
        let mut tracker = Self::load(&layout.tracker)?;
        tracker.state.run.parameters.output_dir = output_dir.to_path_buf();
        tracker.state.run.layout = layout;
        tracker.state.run.restarted_at.push(iso_timestamp());
        tracker.save();
        info!(
            path = %tracker.path.display(),
            restarts = tracker.state.run.restarted_at.len(),
            "resuming from ingest checkpoint"
        );
        Ok(tracker)
    }

    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let content = fs::read_to_string(path)
            .map_err(|err| IngestError::CheckpointParse(format!("{}: {err}", path.display())))?;
        let state: TrackerState = serde_json::from_str(&content)
            .map_err(|err| IngestError::CheckpointParse(format!("{}: {err}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn parameters(&self) -> &RunParameters {
        &self.state.run.parameters
    }

    pub fn layout(&self) -> &RunLayout {
        &self.state.run.layout
    }

    pub fn get(&self, key: &str) -> Option<&StageProgress> {
        self.state.stages.get(key)
    }

    pub fn set(&mut self, key: &str, value: StageProgress) {
        self.state.stages.insert(key.to_string(), value);
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.get(&stage.key()).is_some_and(|progress| progress.completed)
    }

    pub fn cursor(&self, stage: Stage) -> u64 {
        self.get(&stage.key()).map_or(0, |progress| progress.cursor)
    }

    /// Moves the cursor forward. Completed stages and backwards moves are ignored.
    pub fn advance_cursor(&mut self, stage: Stage, cursor: u64) {
        let progress = self.state.stages.entry(stage.key()).or_default();
        if progress.completed {
            warn!(%stage, cursor, "ignoring cursor write to completed stage");
            return;
        }
        if cursor < progress.cursor {
            warn!(%stage, cursor, current = progress.cursor, "ignoring backwards cursor move");
            return;
        }
        progress.cursor = cursor;
    }

    pub fn mark_completed(&mut self, stage: Stage) {
        self.state.stages.entry(stage.key()).or_default().completed = true;
    }

    pub fn counter(&self, stage: Stage, name: &str) -> Option<u64> {
        self.get(&stage.key())
            .and_then(|progress| progress.counters.get(name).copied())
    }

    pub fn set_counter(&mut self, stage: Stage, name: &str, value: u64) {
        self.state
            .stages
            .entry(stage.key())
            .or_default()
            .counters
            .insert(name.to_string(), value);
    }

    /// Rewrites the checkpoint. Failures are logged; the in-memory state stays
    /// authoritative for the rest of the run.
    pub fn save(&self) {
        if let Err(err) = self.try_save() {
            error!(path = %self.path.display(), error = %err, "failed to save ingest checkpoint");
        }
    }

    pub fn try_save(&self) -> Result<(), IngestError> {
        let content = serde_json::to_vec_pretty(&self.state)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        write_atomic(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::NaiveDate;

    use super::*;

    fn params(dir: &Path) -> RunParameters {
        RunParameters {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            admin_set_title: "Open Access Articles".to_string(),
            depositor: "admin".to_string(),
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn fresh_tracker_is_persisted_with_all_stages() {
        let temp = tempfile::tempdir().unwrap();
        let tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
        assert!(tracker.path().exists());
        for stage in Stage::all() {
            assert_eq!(tracker.get(&stage.key()), Some(&StageProgress::default()));
        }
    }

    #[test]
    fn resume_without_checkpoint_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let err = IngestTracker::build(&params(temp.path()), true).unwrap_err();
        assert_matches!(err, IngestError::MissingCheckpoint(_));
    }

    #[test]
    fn completed_stage_rejects_cursor_writes() {
        let temp = tempfile::tempdir().unwrap();
        let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
        let stage = Stage::RetrieveIds(Db::Pubmed);
        tracker.advance_cursor(stage, 400);
        tracker.advance_cursor(stage, 200);
        assert_eq!(tracker.cursor(stage), 400);
        tracker.mark_completed(stage);
        tracker.advance_cursor(stage, 600);
        assert_eq!(tracker.cursor(stage), 400);
    }

    #[test]
    fn resume_restores_progress_and_records_restart() {
        let temp = tempfile::tempdir().unwrap();
        let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
        tracker.advance_cursor(Stage::AlternateIds(Db::Pmc), 17);
        tracker.mark_completed(Stage::AdjustIdLists);
        tracker.set_counter(Stage::AdjustIdLists, "pmc_original_size", 9);
        tracker.save();

        let resumed = IngestTracker::resume(temp.path()).unwrap();
        assert_eq!(resumed.cursor(Stage::AlternateIds(Db::Pmc)), 17);
        assert!(resumed.is_completed(Stage::AdjustIdLists));
        assert_eq!(resumed.counter(Stage::AdjustIdLists, "pmc_original_size"), Some(9));
        assert_eq!(resumed.state().run.restarted_at.len(), 1);
        assert_eq!(resumed.parameters().admin_set_title, "Open Access Articles");
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("ingest_progress.json"), b"{not json").unwrap();
        let err = IngestTracker::resume(temp.path()).unwrap_err();
        assert_matches!(err, IngestError::CheckpointParse(_));
    }
}
