pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod storage;
#[cfg(test)]
mod http_test;

pub use error::{Result, StorageError, StreamError};
pub use hub::{HubConfig, StreamHub};
