pub mod attributes;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod file_attachment;
pub mod fs_util;
pub mod id_retrieval;
pub mod jsonl;
pub mod metadata_ingest;
pub mod ncbi;
pub mod notify;
pub mod output;
pub mod store;
pub mod tracker;
pub mod transfer;
pub mod xml;
