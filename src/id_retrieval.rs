use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{IngestSettings, RunParameters};
use crate::domain::{Db, DedupKey, IdentifierRecord, SearchHit, normalize_pmcid, normalize_pmid};
use crate::error::IngestError;
use crate::jsonl::{JsonLines, JsonLinesWriter, read_identifier_records, write_all_atomic};
use crate::ncbi::NcbiClient;
use crate::tracker::{IngestTracker, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RetrievalProgress {
    pub complete: bool,
    pub total: u64,
    pub written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AdjustSummary {
    pub pubmed_original_size: u64,
    pub pubmed_adjusted_size: u64,
    pub pmc_original_size: u64,
    pub pmc_adjusted_size: u64,
}

/// Builds the per-database identifier lists: raw search hits, their
/// cross-namespace identifier records, and the de-overlapped final lists.
pub struct IdRetrievalService<'a> {
    client: &'a dyn NcbiClient,
    settings: &'a IngestSettings,
    tracker: &'a mut IngestTracker,
}

impl<'a> IdRetrievalService<'a> {
    pub fn new(
        client: &'a dyn NcbiClient,
        settings: &'a IngestSettings,
        tracker: &'a mut IngestTracker,
    ) -> Self {
        Self {
            client,
            settings,
            tracker,
        }
    }

    /// Pages the search API from the stored cursor and appends every hit to
    /// `output_path`. A failed request stops the pass with the cursor at the
    /// last fully written page.
    pub fn retrieve_ids_within_date_range(
        &mut self,
        output_path: &Path,
        db: Db,
    ) -> Result<RetrievalProgress, IngestError> {
        let stage = Stage::RetrieveIds(db);
        if self.tracker.is_completed(stage) {
            info!(%db, "search results already retrieved, skipping");
            return Ok(RetrievalProgress {
                complete: true,
                total: self.tracker.counter(stage, "total").unwrap_or_default(),
                written: 0,
            });
        }

        let term = search_term(self.tracker.parameters(), self.settings.search_query.as_deref());
        let mut cursor = self.tracker.cursor(stage);
        let mut total = self.tracker.counter(stage, "total").unwrap_or_default();
        let mut written = 0;
        let mut writer = JsonLinesWriter::append(output_path)?;
        info!(%db, cursor, term = %term, "retrieving ids");

        loop {
            let page = match self
                .client
                .search(db, &term, cursor, self.settings.page_size)
            {
                Ok(page) => page,
                Err(err) if err.is_transient() => {
                    warn!(%db, cursor, error = %err, "search request failed, halting retrieval");
                    return Ok(RetrievalProgress {
                        complete: false,
                        total,
                        written,
                    });
                }
                Err(err) => return Err(err),
            };
            total = page.count;
            self.tracker.set_counter(stage, "total", total);
            if page.ids.is_empty() {
                break;
            }

            for (offset, raw) in page.ids.iter().enumerate() {
                let id = match db {
                    Db::Pubmed => normalize_pmid(raw),
                    Db::Pmc => normalize_pmcid(raw),
                };
                let Some(id) = id else {
                    warn!(%db, id = %raw, "skipping unparsable search hit");
                    continue;
                };
                writer.write(&SearchHit {
                    index: cursor + offset as u64,
                    id,
                })?;
                written += 1;
            }
            writer.flush()?;

            cursor += page.ids.len() as u64;
            self.tracker.advance_cursor(stage, cursor);
            self.tracker.save();
            info!(%db, cursor, total, "search page written");
            if cursor >= total {
                break;
            }
        }

        self.tracker.mark_completed(stage);
        self.tracker.save();
        info!(%db, total, written, "id retrieval complete");
        Ok(RetrievalProgress {
            complete: true,
            total,
            written,
        })
    }

    /// Converts the search hits in `input_path` into identifier records, one
    /// id-conversion call per batch.
    pub fn stream_and_write_alternate_ids(
        &mut self,
        input_path: &Path,
        output_path: &Path,
        db: Db,
        batch_size: usize,
    ) -> Result<RetrievalProgress, IngestError> {
        let stage = Stage::AlternateIds(db);
        if self.tracker.is_completed(stage) {
            info!(%db, "alternate ids already written, skipping");
            return Ok(RetrievalProgress {
                complete: true,
                total: self.tracker.cursor(stage),
                written: 0,
            });
        }

        let mut reader = JsonLines::<SearchHit>::open(input_path)?;
        let mut cursor = self.tracker.cursor(stage);
        let skipped = reader.skip_lines(cursor)?;
        if skipped < cursor {
            warn!(%db, cursor, lines = skipped, "input is shorter than the stored cursor");
        }
        let mut writer = JsonLinesWriter::append(output_path)?;
        let mut written = 0;

        loop {
            let batch = reader.next_batch(batch_size.max(1))?;
            if batch.lines == 0 {
                break;
            }
            let ids = batch
                .items
                .iter()
                .map(|hit| hit.id.clone())
                .collect::<Vec<_>>();
            let records = if ids.is_empty() {
                Vec::new()
            } else {
                match self.client.convert_ids(db, &ids) {
                    Ok(records) => records,
                    Err(err) if err.is_transient() => {
                        warn!(%db, cursor, error = %err, "id conversion failed, halting");
                        return Ok(RetrievalProgress {
                            complete: false,
                            total: cursor,
                            written,
                        });
                    }
                    Err(err) => return Err(err),
                }
            };
            for record in &records {
                writer.write(record)?;
            }
            writer.flush()?;
            written += records.len() as u64;

            cursor += batch.lines;
            self.tracker.advance_cursor(stage, cursor);
            self.tracker.save();
            info!(%db, cursor, batch = records.len(), "alternate ids written");
        }

        self.tracker.mark_completed(stage);
        self.tracker.save();
        Ok(RetrievalProgress {
            complete: true,
            total: cursor,
            written,
        })
    }

    /// Removes overlap between the two lists: PMC records win, and a PubMed
    /// record is dropped when a PMC record or an earlier PubMed record shares
    /// its dedup key.
    pub fn adjust_id_lists(
        &mut self,
        pubmed_path: &Path,
        pmc_path: &Path,
    ) -> Result<AdjustSummary, IngestError> {
        let stage = Stage::AdjustIdLists;
        if self.tracker.is_completed(stage) {
            info!("id lists already adjusted, skipping");
            return Ok(self.adjust_summary());
        }

        let pmc = read_identifier_records(pmc_path)?;
        let pubmed = read_identifier_records(pubmed_path)?;
        let pmc_original = pmc.len() as u64;
        let pubmed_original = pubmed.len() as u64;

        let mut seen = HashSet::new();
        let pmc = retain_first_by_key(pmc, &mut seen);
        let pubmed = retain_first_by_key(pubmed, &mut seen);

        write_all_atomic(pmc_path, &pmc)?;
        write_all_atomic(pubmed_path, &pubmed)?;

        for (db, original, adjusted) in [
            (Db::Pubmed, pubmed_original, pubmed.len() as u64),
            (Db::Pmc, pmc_original, pmc.len() as u64),
        ] {
            self.tracker
                .set_counter(stage, &format!("{db}_original_size"), original);
            self.tracker
                .set_counter(stage, &format!("{db}_adjusted_size"), adjusted);
        }
        self.tracker.mark_completed(stage);
        self.tracker.save();

        let summary = self.adjust_summary();
        info!(
            pubmed_original = summary.pubmed_original_size,
            pubmed_adjusted = summary.pubmed_adjusted_size,
            pmc_original = summary.pmc_original_size,
            pmc_adjusted = summary.pmc_adjusted_size,
            "adjusted id lists"
        );
        Ok(summary)
    }

    fn adjust_summary(&self) -> AdjustSummary {
        let counter = |name: &str| {
            self.tracker
                .counter(Stage::AdjustIdLists, name)
                .unwrap_or_default()
        };
        AdjustSummary {
            pubmed_original_size: counter("pubmed_original_size"),
            pubmed_adjusted_size: counter("pubmed_adjusted_size"),
            pmc_original_size: counter("pmc_original_size"),
            pmc_adjusted_size: counter("pmc_adjusted_size"),
        }
    }
}

fn retain_first_by_key(
    records: Vec<IdentifierRecord>,
    seen: &mut HashSet<DedupKey>,
) -> Vec<IdentifierRecord> {
    records
        .into_iter()
        .filter(|record| record.dedup_key().is_some_and(|key| seen.insert(key)))
        .collect()
}

/// Publication-date range query, optionally narrowed by a configured query.
pub fn search_term(params: &RunParameters, query: Option<&str>) -> String {
    let range = format!(
        "{}:{}[dp]",
        params.start_date.format("%Y/%m/%d"),
        params.end_date.format("%Y/%m/%d")
    );
    match query {
        Some(query) => format!("({query}) AND {range}"),
        None => range,
    }
}
