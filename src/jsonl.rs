use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::domain::{DedupKey, IdentifierRecord, OutcomeRecord};
use crate::error::IngestError;
use crate::fs_util::write_atomic;

/// Streaming reader over a JSON Lines file. Blank and malformed lines are
/// skipped; a crash can leave a truncated last line behind.
pub struct JsonLines<T> {
    lines: Lines<BufReader<File>>,
    path: PathBuf,
    line_no: u64,
    _marker: PhantomData<T>,
}

#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub lines: u64,
}

impl<T: DeserializeOwned> JsonLines<T> {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let file = File::open(path)
            .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            path: path.to_path_buf(),
            line_no: 0,
            _marker: PhantomData,
        })
    }

    pub fn lines_read(&self) -> u64 {
        self.line_no
    }

    pub fn skip_lines(&mut self, count: u64) -> Result<u64, IngestError> {
        let mut skipped = 0;
        while skipped < count {
            match self.next_line()? {
                Some(_) => skipped += 1,
                None => break,
            }
        }
        Ok(skipped)
    }

    /// Reads up to `size` raw lines and returns the records parsed from them.
    pub fn next_batch(&mut self, size: usize) -> Result<Batch<T>, IngestError> {
        let mut items = Vec::new();
        let mut lines = 0;
        while lines < size as u64 {
            let Some(line) = self.next_line()? else {
                break;
            };
            lines += 1;
            if let Some(item) = self.parse(&line) {
                items.push(item);
            }
        }
        Ok(Batch { items, lines })
    }

    fn next_line(&mut self) -> Result<Option<String>, IngestError> {
        match self.lines.next() {
            Some(Ok(line)) => {
                self.line_no += 1;
                Ok(Some(line))
            }
            Some(Err(err)) => Err(IngestError::Filesystem(format!(
                "read {}: {err}",
                self.path.display()
            ))),
            None => Ok(None),
        }
    }

    fn parse(&self, line: &str) -> Option<T> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    line = self.line_no,
                    error = %err,
                    "skipping malformed JSON line"
                );
                None
            }
        }
    }
}

impl<T: DeserializeOwned> Iterator for JsonLines<T> {
    type Item = Result<T, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_line() {
                Ok(Some(line)) => {
                    if let Some(item) = self.parse(&line) {
                        return Some(Ok(item));
                    }
                }
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// All records of a JSON Lines file; a missing file reads as empty.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, IngestError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    JsonLines::open(path)?.collect()
}

/// Identifier records of a JSON Lines file. Lines without any identifier are
/// dropped with a warning.
pub fn read_identifier_records(path: &Path) -> Result<Vec<IdentifierRecord>, IngestError> {
    let mut records = Vec::new();
    for record in read_all::<IdentifierRecord>(path)? {
        match record.normalized() {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping identifier record"),
        }
    }
    Ok(records)
}

pub fn write_all_atomic<T: Serialize>(path: &Path, items: &[T]) -> Result<(), IngestError> {
    let mut content = Vec::new();
    for item in items {
        serde_json::to_writer(&mut content, item)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        content.push(b'\n');
    }
    write_atomic(path, &content)
}

pub struct JsonLinesWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonLinesWriter {
    /// Opens `path` for appending, terminating a truncated last line first.
    pub fn append(path: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
        if ends_without_newline(&mut file)? {
            file.write_all(b"\n")
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), IngestError> {
        serde_json::to_writer(&mut self.writer, value)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    pub fn flush(&mut self) -> Result<(), IngestError> {
        self.writer
            .flush()
            .map_err(|err| IngestError::Filesystem(format!("flush {}: {err}", self.path.display())))
    }
}

fn ends_without_newline(file: &mut File) -> Result<bool, IngestError> {
    let len = file
        .metadata()
        .map_err(|err| IngestError::Filesystem(err.to_string()))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Ok(last[0] != b'\n')
}

/// Append-only outcome log with a write-ahead buffer. Records are held in
/// memory until `threshold` of them accumulate, then written in one append.
/// Membership is answered from everything flushed by earlier runs plus
/// everything recorded in this one.
pub struct BufferedOutcomeLog {
    path: PathBuf,
    buffer: Vec<OutcomeRecord>,
    threshold: usize,
    seen: HashSet<DedupKey>,
    written: usize,
}

impl BufferedOutcomeLog {
    pub fn open(path: &Path, threshold: usize) -> Result<Self, IngestError> {
        let seen = read_all::<OutcomeRecord>(path)?
            .iter()
            .filter_map(|record| record.ids.dedup_key())
            .collect::<HashSet<_>>();
        debug!(path = %path.display(), known = seen.len(), "opened outcome log");
        Ok(Self {
            path: path.to_path_buf(),
            buffer: Vec::new(),
            threshold: threshold.max(1),
            seen,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Outcomes recorded through this handle, flushed or not.
    pub fn recorded(&self) -> usize {
        self.written + self.buffer.len()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn record(&mut self, outcome: OutcomeRecord) -> Result<(), IngestError> {
        if let Some(key) = outcome.ids.dedup_key() {
            self.seen.insert(key);
        }
        self.buffer.push(outcome);
        if self.buffer.len() >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), IngestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut writer = JsonLinesWriter::append(&self.path)?;
        for outcome in &self.buffer {
            writer.write(outcome)?;
        }
        writer.flush()?;
        self.written += self.buffer.len();
        debug!(path = %self.path.display(), count = self.buffer.len(), "flushed outcomes");
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for BufferedOutcomeLog {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(path = %self.path.display(), error = %err, "failed to flush outcome log");
        }
    }
}
