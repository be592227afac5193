mod common;

use assert_matches::assert_matches;

use pubmed_ingest::domain::{Db, OutcomeCategory, OutcomeRecord, WorkAttributes};
use pubmed_ingest::error::IngestError;
use pubmed_ingest::jsonl::{read_all, write_all_atomic};
use pubmed_ingest::metadata_ingest::MetadataIngestService;
use pubmed_ingest::store::WorkStore;
use pubmed_ingest::tracker::{IngestTracker, Stage};

use common::{MockNcbi, UNC, ids, open_store, params, pmc_article, pubmed_article, settings};

fn outcomes(path: &std::path::Path) -> Vec<OutcomeRecord> {
    read_all(path).unwrap()
}

#[test]
fn resumed_load_stages_only_records_without_outcomes() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default()
        .with_document("PMC2002", pmc_article("PMC2002", None, "Second", UNC))
        .with_document("PMC2003", pmc_article("PMC2003", None, "Third", UNC));
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();

    write_all_atomic(
        &layout.pmc_alternate_ids,
        &[
            ids(None, Some("PMC2001"), None),
            ids(None, Some("PMC2002"), None),
            ids(None, Some("PMC2003"), None),
        ],
    )
    .unwrap();
    // An interrupted run already decided the first record.
    write_all_atomic(
        &layout.metadata_results,
        &[OutcomeRecord::new(
            ids(None, Some("PMC2001"), None),
            OutcomeCategory::Failed,
            "metadata not returned",
        )],
    )
    .unwrap();
    tracker.advance_cursor(Stage::Metadata(Db::Pmc), 1);

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    let staged = service
        .load_alternate_ids_from_file(&layout.pmc_alternate_ids, Db::Pmc)
        .unwrap();
    assert_eq!(staged, 2);
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pmc)
        .unwrap();
    assert!(progress.complete);
    assert_eq!(progress.recorded, 2);
    drop(service);

    let logged = outcomes(&layout.metadata_results);
    assert_eq!(logged.len(), 3);
    assert!(
        logged[1..]
            .iter()
            .all(|outcome| outcome.category == OutcomeCategory::SuccessfullyIngested)
    );
    assert_eq!(store.works().unwrap().len(), 2);
    assert_eq!(tracker.cursor(Stage::Metadata(Db::Pmc)), 3);
    assert!(tracker.is_completed(Stage::Metadata(Db::Pmc)));
    assert_eq!(ncbi.calls().fetch, 1);
}

#[test]
fn existing_work_is_recorded_as_skipped_without_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default().with_document(
        "301",
        pubmed_article("301", Some("10.5/x"), "Existing", UNC),
    );
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();

    let first_dir = temp.path().join("first");
    let mut tracker = IngestTracker::build(&params(&first_dir), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(
        &layout.pubmed_alternate_ids,
        &[ids(Some("301"), None, Some("10.5/x"))],
    )
    .unwrap();
    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    service
        .load_alternate_ids_from_file(&layout.pubmed_alternate_ids, Db::Pubmed)
        .unwrap();
    service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pubmed)
        .unwrap();
    drop(service);
    let work_id = store.works().unwrap()[0].id.clone();

    // A second run sees the same article under its DOI only.
    let second_dir = temp.path().join("second");
    let mut tracker = IngestTracker::build(&params(&second_dir), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(&layout.pmc_alternate_ids, &[ids(None, Some("PMC9999"), Some("10.5/X"))])
        .unwrap();
    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    let staged = service
        .load_alternate_ids_from_file(&layout.pmc_alternate_ids, Db::Pmc)
        .unwrap();
    assert_eq!(staged, 0);
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pmc)
        .unwrap();
    assert!(progress.complete);
    drop(service);

    let logged = outcomes(&layout.metadata_results);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].category, OutcomeCategory::Skipped);
    assert_eq!(logged[0].ids.work_id.as_deref(), Some(work_id.as_str()));
    assert_eq!(
        logged[0].ids.cdr_url.as_deref(),
        Some(format!("https://repo.example/concern/articles/{work_id}").as_str())
    );
    assert_eq!(store.works().unwrap().len(), 1);
    assert_eq!(ncbi.calls().fetch, 1);
}

#[test]
fn pmid_does_not_match_a_work_with_the_same_digits_as_pmcid() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default().with_document(
        "7000001",
        pubmed_article("7000001", None, "Different article", UNC),
    );
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();
    let existing = store
        .create_work(&WorkAttributes {
            title: "Unrelated".to_string(),
            pmcid: Some("PMC7000001".to_string()),
            pmid: Some("99".to_string()),
            resource_type: "Article".to_string(),
            ..WorkAttributes::default()
        })
        .unwrap();
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(&layout.pubmed_alternate_ids, &[ids(Some("7000001"), None, None)]).unwrap();

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    let staged = service
        .load_alternate_ids_from_file(&layout.pubmed_alternate_ids, Db::Pubmed)
        .unwrap();
    assert_eq!(staged, 1);
    service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pubmed)
        .unwrap();
    drop(service);

    let logged = outcomes(&layout.metadata_results);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].category, OutcomeCategory::SuccessfullyIngested);
    assert_ne!(logged[0].ids.work_id.as_deref(), Some(existing.as_str()));
    assert_eq!(store.works().unwrap().len(), 2);
}

#[test]
fn articles_without_matching_affiliation_are_not_created() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default()
        .with_document(
            "401",
            pubmed_article("401", None, "Elsewhere", "Department of Biology, Duke University"),
        )
        .with_document("402", pubmed_article("402", None, "Local", UNC));
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(
        &layout.pubmed_alternate_ids,
        &[ids(Some("401"), None, None), ids(Some("402"), None, None)],
    )
    .unwrap();

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    service
        .load_alternate_ids_from_file(&layout.pubmed_alternate_ids, Db::Pubmed)
        .unwrap();
    service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pubmed)
        .unwrap();
    drop(service);

    let logged = outcomes(&layout.metadata_results);
    assert_eq!(logged[0].category, OutcomeCategory::SkippedNonMatchingAffiliation);
    assert_eq!(logged[1].category, OutcomeCategory::SuccessfullyIngested);
    let works = store.works().unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].attributes.pmid.as_deref(), Some("402"));
    assert_eq!(works[0].admin_set_id.as_deref(), Some(admin_set.as_str()));
}

#[test]
fn pmc_error_elements_and_missing_documents_fail_their_records() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default().with_document(
        "PMC5001",
        r#"<error id="PMC5001">The following PMCID is not available: PMC5001</error>"#.to_string(),
    );
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(
        &layout.pmc_alternate_ids,
        &[ids(None, Some("PMC5001"), None), ids(None, Some("PMC5002"), None)],
    )
    .unwrap();

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    service
        .load_alternate_ids_from_file(&layout.pmc_alternate_ids, Db::Pmc)
        .unwrap();
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pmc)
        .unwrap();
    assert!(progress.complete);
    drop(service);

    let logged = outcomes(&layout.metadata_results);
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[0].category, OutcomeCategory::Failed);
    assert!(logged[0].message.contains("not available"));
    assert_eq!(logged[1].category, OutcomeCategory::Failed);
    assert_eq!(logged[1].message, "metadata not returned");
    assert!(store.works().unwrap().is_empty());
}

#[test]
fn failed_fetch_abandons_batch_without_outcomes() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default()
        .with_document("501", pubmed_article("501", None, "One", UNC))
        .with_document("502", pubmed_article("502", None, "Two", UNC))
        .with_document("503", pubmed_article("503", None, "Three", UNC));
    *ncbi.fetch_failures.lock().unwrap() = 1;
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let admin_set = store.find_admin_set(common::ADMIN_SET).unwrap().unwrap();
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();
    write_all_atomic(
        &layout.pubmed_alternate_ids,
        &[
            ids(Some("501"), None, None),
            ids(Some("502"), None, None),
            ids(Some("503"), None, None),
        ],
    )
    .unwrap();

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    service
        .load_alternate_ids_from_file(&layout.pubmed_alternate_ids, Db::Pubmed)
        .unwrap();
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pubmed)
        .unwrap();
    assert!(!progress.complete);
    assert_eq!(progress.abandoned_batches, 1);
    assert_eq!(progress.recorded, 1);
    drop(service);
    assert!(!tracker.is_completed(Stage::Metadata(Db::Pubmed)));

    // The retry only picks up the abandoned batch.
    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, &admin_set).unwrap();
    let staged = service
        .load_alternate_ids_from_file(&layout.pubmed_alternate_ids, Db::Pubmed)
        .unwrap();
    assert_eq!(staged, 2);
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pubmed)
        .unwrap();
    assert!(progress.complete);
    drop(service);

    assert_eq!(outcomes(&layout.metadata_results).len(), 3);
    assert_eq!(store.works().unwrap().len(), 3);
    assert_eq!(tracker.cursor(Stage::Metadata(Db::Pubmed)), 3);
}

#[test]
fn processing_requires_loaded_records_for_the_namespace() {
    let temp = tempfile::tempdir().unwrap();
    let ncbi = MockNcbi::default();
    let client = &ncbi;
    let settings = settings(&temp.path().join("repo"));
    let store = open_store(&settings.store_root);
    let mut tracker = IngestTracker::build(&params(temp.path()), false).unwrap();
    let layout = tracker.layout().clone();

    let mut service =
        MetadataIngestService::new(&client, &store, &settings, &mut tracker, "open-access-articles")
            .unwrap();
    let err = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pmc)
        .unwrap_err();
    assert_matches!(err, IngestError::StageIncomplete(_));

    // A missing id list loads as empty.
    let staged = service
        .load_alternate_ids_from_file(&layout.pmc_alternate_ids, Db::Pmc)
        .unwrap();
    assert_eq!(staged, 0);
    let progress = service
        .batch_retrieve_and_process_metadata(settings.batch_size, Db::Pmc)
        .unwrap();
    assert!(progress.complete);
    assert_eq!(ncbi.calls().fetch, 0);
}
