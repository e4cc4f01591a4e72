//! Streaming bulk-add client.
//!
//! Sends an ordered stream of files and directories to an ingestion service
//! over one duplex channel and streams back a content identifier per entry.
//!
//! ```no_run
//! use futures::TryStreamExt;
//! use ingest::{normalize_path, AddOptions, ClientConfig, IngestClient, TcpConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> ingest::Result<()> {
//! let config = ClientConfig::default();
//! let client = IngestClient::new(Arc::new(TcpConnector::new(None)), config);
//! let options = AddOptions::new()
//!     .with_url("127.0.0.1:5002")
//!     .with_progress(|bytes, path| eprintln!("{} {}", bytes, path));
//!
//! let mut results = client.add_all(normalize_path("photos", 256 * 1024), options);
//! while let Some(added) = results.try_next().await? {
//!     println!("{} {}", added.cid, added.path);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cid;
pub mod config;
pub mod error;
pub mod streaming;
pub mod transport;

pub use cid::{default_parser, Cid, CidError, CidParser, CidVersion};
pub use config::ClientConfig;
pub use error::{IngestError, Result};
pub use streaming::{
    entries_from_iter, normalize_path, AddAll, AddEvent, AddEvents, AddOptions, AddResult,
    CancelHandle, Entry, EntryStream, IngestClient, Mtime,
};
pub use transport::{ServerCommand, TcpConnector};
