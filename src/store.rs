use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{
    DedupKey, WorkAttributes, iso_timestamp, normalize_doi, normalize_pmcid, normalize_pmid,
};
use crate::error::IngestError;
use crate::fs_util::write_atomic;

/// Record-store contract the pipeline depends on.
pub trait WorkStore: Send + Sync {
    fn find_admin_set(&self, title: &str) -> Result<Option<String>, IngestError>;
    /// Work whose identifier in the key's own namespace equals the key.
    fn find_work_by_alternate_id(&self, key: &DedupKey) -> Result<Option<String>, IngestError>;
    fn create_work(&self, attributes: &WorkAttributes) -> Result<String, IngestError>;
    fn assign_admin_set(
        &self,
        work_id: &str,
        admin_set_id: &str,
        depositor: &str,
    ) -> Result<(), IngestError>;
    fn delete_work(&self, work_id: &str) -> Result<(), IngestError>;
    fn file_set_ids(&self, work_id: &str) -> Result<Vec<String>, IngestError>;
    fn work_url(&self, work_id: &str) -> Option<String>;
}

pub trait AttachmentService: Send + Sync {
    fn attach_file(&self, work_id: &str, file: &Path, file_name: &str)
    -> Result<String, IngestError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSet {
    pub id: String,
    pub title: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    pub id: String,
    pub file_name: String,
    pub attached_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWork {
    pub id: String,
    pub attributes: WorkAttributes,
    #[serde(default)]
    pub admin_set_id: Option<String>,
    #[serde(default)]
    pub depositor: Option<String>,
    #[serde(default)]
    pub file_sets: Vec<FileSet>,
    pub created_at: String,
}

#[derive(Debug, Default)]
struct StoreIndex {
    admin_sets: BTreeMap<String, AdminSet>,
    works: BTreeMap<String, StoredWork>,
    next_id: u64,
}

/// Filesystem-backed store: one JSON document per work, attached files
/// beside it. Every document write is atomic.
#[derive(Debug)]
pub struct LocalWorkStore {
    root: Utf8PathBuf,
    base_url: String,
    index: Mutex<StoreIndex>,
}

impl LocalWorkStore {
    pub fn open(root: &Path, base_url: &str) -> Result<Self, IngestError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|_| IngestError::Filesystem("non-utf8 store root".to_string()))?;
        fs::create_dir_all(root.join("works").as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        fs::create_dir_all(root.join("admin_sets").as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;

        let mut index = StoreIndex::default();
        for path in json_files(&root.join("admin_sets"))? {
            let admin_set: AdminSet = read_json(&path)?;
            index.admin_sets.insert(admin_set.id.clone(), admin_set);
        }
        for entry in read_dirs(&root.join("works"))? {
            let path = entry.join("work.json");
            if !path.as_std_path().exists() {
                continue;
            }
            let work: StoredWork = read_json(&path)?;
            if let Some(n) = work.id.strip_prefix("work_").and_then(|n| n.parse::<u64>().ok()) {
                index.next_id = index.next_id.max(n);
            }
            index.works.insert(work.id.clone(), work);
        }
        debug!(
            root = %root,
            works = index.works.len(),
            admin_sets = index.admin_sets.len(),
            "opened local work store"
        );

        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_admin_set(&self, title: &str) -> Result<AdminSet, IngestError> {
        let mut index = self.lock()?;
        if let Some(existing) = index.admin_sets.values().find(|set| set.title == title) {
            return Ok(existing.clone());
        }
        let admin_set = AdminSet {
            id: slug(title),
            title: title.to_string(),
            created_at: iso_timestamp(),
        };
        write_json(
            &self.root.join("admin_sets").join(format!("{}.json", admin_set.id)),
            &admin_set,
        )?;
        index
            .admin_sets
            .insert(admin_set.id.clone(), admin_set.clone());
        info!(id = %admin_set.id, title, "created admin set");
        Ok(admin_set)
    }

    pub fn work(&self, work_id: &str) -> Result<Option<StoredWork>, IngestError> {
        Ok(self.lock()?.works.get(work_id).cloned())
    }

    pub fn works(&self) -> Result<Vec<StoredWork>, IngestError> {
        Ok(self.lock()?.works.values().cloned().collect())
    }

    pub fn file_path(&self, work_id: &str, file_name: &str) -> Utf8PathBuf {
        self.work_dir(work_id).join("files").join(file_name)
    }

    fn work_dir(&self, work_id: &str) -> Utf8PathBuf {
        self.root.join("works").join(work_id)
    }

    fn write_work(&self, work: &StoredWork) -> Result<(), IngestError> {
        write_json(&self.work_dir(&work.id).join("work.json"), work)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreIndex>, IngestError> {
        self.index
            .lock()
            .map_err(|_| IngestError::Store("store index lock poisoned".to_string()))
    }
}

impl WorkStore for LocalWorkStore {
    fn find_admin_set(&self, title: &str) -> Result<Option<String>, IngestError> {
        Ok(self
            .lock()?
            .admin_sets
            .values()
            .find(|set| set.title == title)
            .map(|set| set.id.clone()))
    }

    fn find_work_by_alternate_id(&self, key: &DedupKey) -> Result<Option<String>, IngestError> {
        let index = self.lock()?;
        let found = index.works.values().find(|work| {
            let attrs = &work.attributes;
            match key {
                DedupKey::Doi(doi) => attrs
                    .doi
                    .as_deref()
                    .and_then(normalize_doi)
                    .is_some_and(|value| value.eq_ignore_ascii_case(doi)),
                DedupKey::Pmcid(pmcid) => attrs
                    .pmcid
                    .as_deref()
                    .and_then(normalize_pmcid)
                    .is_some_and(|value| value.eq_ignore_ascii_case(pmcid)),
                DedupKey::Pmid(pmid) => attrs
                    .pmid
                    .as_deref()
                    .and_then(normalize_pmid)
                    .is_some_and(|value| value == *pmid),
            }
        });
        Ok(found.map(|work| work.id.clone()))
    }

    fn create_work(&self, attributes: &WorkAttributes) -> Result<String, IngestError> {
        if attributes.title.trim().is_empty() {
            return Err(IngestError::Store("work title is required".to_string()));
        }
        let mut index = self.lock()?;
        index.next_id += 1;
        let work = StoredWork {
            id: format!("work_{}", index.next_id),
            attributes: attributes.clone(),
            admin_set_id: None,
            depositor: None,
            file_sets: Vec::new(),
            created_at: iso_timestamp(),
        };
        self.write_work(&work)?;
        let id = work.id.clone();
        index.works.insert(id.clone(), work);
        Ok(id)
    }

    fn assign_admin_set(
        &self,
        work_id: &str,
        admin_set_id: &str,
        depositor: &str,
    ) -> Result<(), IngestError> {
        let mut index = self.lock()?;
        if !index.admin_sets.contains_key(admin_set_id) {
            return Err(IngestError::MissingAdminSet(admin_set_id.to_string()));
        }
        let mut work = index
            .works
            .get(work_id)
            .cloned()
            .ok_or_else(|| IngestError::WorkNotFound(work_id.to_string()))?;
        work.admin_set_id = Some(admin_set_id.to_string());
        work.depositor = Some(depositor.to_string());
        self.write_work(&work)?;
        index.works.insert(work_id.to_string(), work);
        Ok(())
    }

    fn delete_work(&self, work_id: &str) -> Result<(), IngestError> {
        let mut index = self.lock()?;
        let dir = self.work_dir(work_id);
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        index.works.remove(work_id);
        Ok(())
    }

    fn file_set_ids(&self, work_id: &str) -> Result<Vec<String>, IngestError> {
        let index = self.lock()?;
        let work = index
            .works
            .get(work_id)
            .ok_or_else(|| IngestError::WorkNotFound(work_id.to_string()))?;
        Ok(work.file_sets.iter().map(|set| set.id.clone()).collect())
    }

    fn work_url(&self, work_id: &str) -> Option<String> {
        Some(format!("{}/{work_id}", self.base_url))
    }
}

impl AttachmentService for LocalWorkStore {
    fn attach_file(
        &self,
        work_id: &str,
        file: &Path,
        file_name: &str,
    ) -> Result<String, IngestError> {
        let mut index = self.lock()?;
        let mut work = index
            .works
            .get(work_id)
            .cloned()
            .ok_or_else(|| IngestError::WorkNotFound(work_id.to_string()))?;

        let dest = self.file_path(work_id, file_name);
        copy_file_atomic(file, &dest)?;

        let file_set = FileSet {
            id: format!("{work_id}_fs{}", work.file_sets.len() + 1),
            file_name: file_name.to_string(),
            attached_at: iso_timestamp(),
        };
        let id = file_set.id.clone();
        work.file_sets.push(file_set);
        self.write_work(&work)?;
        index.works.insert(work_id.to_string(), work);
        Ok(id)
    }
}

fn copy_file_atomic(source: &Path, dest: &Utf8Path) -> Result<(), IngestError> {
    let parent = dest
        .parent()
        .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("pubmed-ingest-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), IngestError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| IngestError::Store(err.to_string()))?;
    write_atomic(path.as_std_path(), &content)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Utf8Path) -> Result<T, IngestError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| IngestError::Store(format!("{path}: {err}")))
}

fn json_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IngestError> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter(|path| path.is_file() && path.extension() == Some("json"))
        .collect())
}

fn read_dirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IngestError> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter(|path| path.is_dir())
        .collect())
}

fn list_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IngestError> {
    let mut items = Vec::new();
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| IngestError::Filesystem("non-utf8 path in store".to_string()))?;
        items.push(path);
    }
    items.sort();
    Ok(items)
}

fn slug(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "admin-set".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn attributes(title: &str, doi: Option<&str>, pmcid: Option<&str>) -> WorkAttributes {
        WorkAttributes {
            title: title.to_string(),
            doi: doi.map(str::to_string),
            pmcid: pmcid.map(str::to_string),
            resource_type: "Article".to_string(),
            ..WorkAttributes::default()
        }
    }

    fn doi(value: &str) -> DedupKey {
        DedupKey::Doi(value.to_string())
    }

    fn pmcid(value: &str) -> DedupKey {
        DedupKey::Pmcid(value.to_string())
    }

    #[test]
    fn create_find_and_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalWorkStore::open(temp.path(), "https://repo.example/articles/").unwrap();
        let id = store
            .create_work(&attributes("A", Some("10.1/Mixed"), Some("PMC7")))
            .unwrap();
        assert_eq!(id, "work_1");
        assert_eq!(
            store.find_work_by_alternate_id(&doi("10.1/mixed")).unwrap(),
            Some(id.clone())
        );
        assert_eq!(
            store.find_work_by_alternate_id(&pmcid("PMC7")).unwrap(),
            Some(id.clone())
        );
        assert_eq!(store.find_work_by_alternate_id(&pmcid("PMC8")).unwrap(), None);
        // Same digits in the PubMed namespace name another article.
        assert_eq!(
            store
                .find_work_by_alternate_id(&DedupKey::Pmid("7".to_string()))
                .unwrap(),
            None
        );
        assert_eq!(
            store.work_url(&id).as_deref(),
            Some("https://repo.example/articles/work_1")
        );

        drop(store);
        let reopened = LocalWorkStore::open(temp.path(), "https://repo.example").unwrap();
        assert!(reopened.work("work_1").unwrap().is_some());
        let next = reopened.create_work(&attributes("B", None, None)).unwrap();
        assert_eq!(next, "work_2");
    }

    #[test]
    fn admin_set_assignment_and_deletion() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalWorkStore::open(temp.path(), "https://repo.example").unwrap();
        let admin_set = store.ensure_admin_set("Open Access Articles").unwrap();
        assert_eq!(admin_set.id, "open-access-articles");
        assert_eq!(
            store.find_admin_set("Open Access Articles").unwrap(),
            Some(admin_set.id.clone())
        );

        let id = store.create_work(&attributes("A", None, Some("PMC1"))).unwrap();
        let err = store.assign_admin_set(&id, "nope", "admin").unwrap_err();
        assert_matches!(err, IngestError::MissingAdminSet(_));
        store.assign_admin_set(&id, &admin_set.id, "admin").unwrap();
        assert_eq!(
            store.work(&id).unwrap().unwrap().admin_set_id.as_deref(),
            Some("open-access-articles")
        );

        store.delete_work(&id).unwrap();
        assert_eq!(store.find_work_by_alternate_id(&pmcid("PMC1")).unwrap(), None);
    }

    #[test]
    fn attach_file_records_file_sets() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalWorkStore::open(&temp.path().join("repo"), "https://repo.example").unwrap();
        let id = store.create_work(&attributes("A", None, Some("PMC1"))).unwrap();
        let pdf = temp.path().join("in.pdf");
        fs::write(&pdf, b"%PDF").unwrap();

        let fs_id = store.attach_file(&id, &pdf, "PMC1_001.pdf").unwrap();
        assert_eq!(fs_id, "work_1_fs1");
        assert_eq!(store.file_set_ids(&id).unwrap(), vec!["work_1_fs1"]);
        assert!(store.file_path(&id, "PMC1_001.pdf").as_std_path().exists());
    }

    #[test]
    fn empty_title_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalWorkStore::open(temp.path(), "https://repo.example").unwrap();
        let err = store.create_work(&attributes(" ", None, None)).unwrap_err();
        assert_matches!(err, IngestError::Store(_));
    }
}
