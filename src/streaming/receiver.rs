//! Receiver side of the ingest pipeline.
//!
//! Pulls replies from the channel source one at a time, routes PROGRESS to
//! the caller and projects RESULT replies into [`AddResult`]s. Nothing is
//! buffered beyond the reply being handled.

use crate::cid::{Cid, CidParser};
use crate::error::{IngestError, Result};
use crate::streaming::channel::{InboundMessage, MessageSource, ResultReply};
use crate::streaming::entry::Mtime;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Progress callback, invoked inline with `(bytes, path)` for every PROGRESS reply
pub type ProgressFn = Arc<dyn Fn(u64, &str) + Send + Sync>;

/// One imported entry as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddResult {
    pub path: String,
    pub cid: Cid,
    pub mode: u32,
    pub mtime: Mtime,
    pub size: u64,
}

/// Tagged alternative to the progress callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddEvent {
    Progress { bytes: u64, path: String },
    Added(AddResult),
}

pub struct Receiver {
    source: Box<dyn MessageSource>,
    cid_parser: CidParser,
    progress: Option<ProgressFn>,
    ready: Option<oneshot::Sender<()>>,
    done: bool,
}

impl Receiver {
    pub fn new(source: Box<dyn MessageSource>, cid_parser: CidParser) -> Self {
        Self {
            source,
            cid_parser,
            progress: None,
            ready: None,
            done: false,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Signal fired on the first pull. Dropping it unfired (on `close`)
    /// tells the sender the reader is gone.
    pub fn with_ready(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    fn signal_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            // Sender already gone (cancelled); the source will tell us
            let _ = ready.send(());
        }
    }

    /// Next reply as an event. Yields an error at most once, then `None`.
    pub async fn next_event(&mut self) -> Option<Result<AddEvent>> {
        if self.done {
            return None;
        }
        self.signal_ready();

        let event = match self.source.next().await {
            None => {
                self.done = true;
                return None;
            }
            Some(Ok(InboundMessage::Progress(p))) => Ok(AddEvent::Progress {
                bytes: p.bytes,
                path: p.path,
            }),
            Some(Ok(InboundMessage::Result(r))) => self.project(r).map(AddEvent::Added),
            Some(Err(e)) => Err(e),
        };
        if event.is_err() {
            self.done = true;
        }
        Some(event)
    }

    /// Next result. PROGRESS replies go to the callback and are not yielded.
    pub async fn next_result(&mut self) -> Option<Result<AddResult>> {
        loop {
            match self.next_event().await? {
                Ok(AddEvent::Progress { bytes, path }) => {
                    if let Some(progress) = &self.progress {
                        progress(bytes, &path);
                    }
                }
                Ok(AddEvent::Added(result)) => return Some(Ok(result)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Close the read direction. Later pulls yield `None`.
    pub async fn close(&mut self) {
        self.done = true;
        self.ready = None;
        self.source.close().await;
    }

    fn project(&self, reply: ResultReply) -> Result<AddResult> {
        let cid = (self.cid_parser)(&reply.cid).map_err(|source| IngestError::InvalidCid {
            path: reply.path.clone(),
            cid: reply.cid.clone(),
            source,
        })?;
        Ok(AddResult {
            path: reply.path,
            cid,
            mode: reply.mode,
            mtime: Mtime::new(reply.mtime, reply.mtime_nsecs),
            size: reply.size,
        })
    }
}
