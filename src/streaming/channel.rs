//! Channel types for the ingest pipeline.
//!
//! One duplex channel per add operation: the Sender pushes into the sink,
//! the Receiver pulls from the source. Adapters must make an aborting
//! `end(Some(err))` on the sink observable as `err` on the source.

use crate::error::{IngestError, Result};
use crate::streaming::entry::Mtime;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// =============================================================================
// OutboundMessage: client -> service
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Directory,
    File,
}

/// One unit sent on the channel.
///
/// Optional fields are `None` when the entry had no value; adapters must
/// not turn them into zeroes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// 1-based position of the originating entry
    pub index: u64,
    pub kind: MessageKind,
    pub path: String,
    pub mode: Option<u32>,
    pub mtime: Option<Mtime>,
    /// File chunk; `None` on directories and on the end-of-file message
    pub content: Option<Bytes>,
}

impl OutboundMessage {
    /// Content-less FILE message closing a file entry
    pub fn is_end_of_file(&self) -> bool {
        self.kind == MessageKind::File && self.content.is_none()
    }

    /// Last message belonging to its entry
    pub fn ends_entry(&self) -> bool {
        self.content.is_none()
    }
}

// =============================================================================
// InboundMessage: service -> client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReply {
    pub bytes: u64,
    pub path: String,
}

/// Per-entry import result as sent by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultReply {
    pub path: String,
    pub cid: String,
    pub mode: u32,
    pub mtime: i64,
    pub mtime_nsecs: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Progress(ProgressReply),
    Result(ResultReply),
}

// =============================================================================
// Duplex interface
// =============================================================================

/// Write direction of a duplex channel
#[async_trait]
pub trait MessageSink: Send {
    async fn push(&mut self, message: OutboundMessage) -> Result<()>;

    /// Terminate the write direction. `None` half-closes; `Some(err)` aborts
    /// and must surface `err` on the paired source.
    async fn end(&mut self, error: Option<IngestError>) -> Result<()>;
}

/// Read direction of a duplex channel
#[async_trait]
pub trait MessageSource: Send {
    /// Next reply; `None` once the channel closed cleanly.
    async fn next(&mut self) -> Option<Result<InboundMessage>>;

    /// Stop reading and release the read direction.
    async fn close(&mut self);
}

pub struct Duplex {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

/// Opens one duplex channel per add operation
#[async_trait]
pub trait DuplexConnector: Send + Sync {
    async fn open(&self, endpoint: Option<&str>) -> Result<Duplex>;
}

// =============================================================================
// Abort signal shared by a sink/source pair
// =============================================================================

pub struct AbortTrigger {
    tx: watch::Sender<Option<IngestError>>,
}

pub struct AbortWatch {
    rx: watch::Receiver<Option<IngestError>>,
}

pub fn abort_signal() -> (AbortTrigger, AbortWatch) {
    let (tx, rx) = watch::channel(None);
    (AbortTrigger { tx }, AbortWatch { rx })
}

impl AbortTrigger {
    pub fn abort(&self, error: IngestError) {
        self.tx.send_replace(Some(error));
    }
}

impl AbortWatch {
    /// Resolves with the abort error. Pends forever if the trigger is
    /// dropped without aborting.
    pub async fn aborted(&mut self) -> IngestError {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// In-memory duplex
// =============================================================================

/// What the service side observes on an in-memory channel
#[derive(Debug)]
pub enum ServiceRequest {
    Message(OutboundMessage),
    /// Client ended its write direction, with the abort error if any
    End(Option<IngestError>),
}

/// Service-facing half of an in-memory duplex
pub struct ServiceEnd {
    pub endpoint: Option<String>,
    pub requests: mpsc::Receiver<ServiceRequest>,
    pub replies: mpsc::Sender<Result<InboundMessage>>,
}

pub struct MemorySink {
    requests: mpsc::Sender<ServiceRequest>,
    abort: AbortTrigger,
    ended: bool,
}

pub struct MemorySource {
    replies: mpsc::Receiver<Result<InboundMessage>>,
    abort: AbortWatch,
    done: bool,
}

/// Create a bounded in-memory duplex. `capacity` bounds each direction.
pub fn memory_channel(capacity: usize) -> (Duplex, ServiceEnd) {
    let capacity = capacity.max(1);
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (rep_tx, rep_rx) = mpsc::channel(capacity);
    let (trigger, watch) = abort_signal();

    let duplex = Duplex {
        sink: Box::new(MemorySink {
            requests: req_tx,
            abort: trigger,
            ended: false,
        }),
        source: Box::new(MemorySource {
            replies: rep_rx,
            abort: watch,
            done: false,
        }),
    };
    let service = ServiceEnd {
        endpoint: None,
        requests: req_rx,
        replies: rep_tx,
    };
    (duplex, service)
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn push(&mut self, message: OutboundMessage) -> Result<()> {
        if self.ended {
            return Err(IngestError::transport("Write after end of input"));
        }
        self.requests
            .send(ServiceRequest::Message(message))
            .await
            .map_err(|_| IngestError::transport("Service closed the channel"))
    }

    async fn end(&mut self, error: Option<IngestError>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        match error {
            None => {
                // The service may already be gone; its replies decide the outcome
                let _ = self.requests.send(ServiceRequest::End(None)).await;
            }
            Some(err) => {
                self.abort.abort(err.clone());
                // Never block an abort on a service that stopped reading
                let _ = self.requests.try_send(ServiceRequest::End(Some(err)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Option<Result<InboundMessage>> {
        if self.done {
            return None;
        }
        tokio::select! {
            biased;
            err = self.abort.aborted() => {
                self.done = true;
                Some(Err(err))
            }
            reply = self.replies.recv() => match reply {
                Some(Ok(msg)) => Some(Ok(msg)),
                Some(Err(err)) => {
                    self.done = true;
                    Some(Err(err))
                }
                None => {
                    self.done = true;
                    None
                }
            },
        }
    }

    async fn close(&mut self) {
        self.done = true;
        self.replies.close();
    }
}

/// Connector handing the service half of every opened channel to an
/// in-process service through `incoming`.
pub struct MemoryConnector {
    capacity: usize,
    incoming: mpsc::UnboundedSender<ServiceEnd>,
}

impl MemoryConnector {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                capacity,
                incoming: tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl DuplexConnector for MemoryConnector {
    async fn open(&self, endpoint: Option<&str>) -> Result<Duplex> {
        let (duplex, mut service) = memory_channel(self.capacity);
        service.endpoint = endpoint.map(str::to_string);
        self.incoming
            .send(service)
            .map_err(|_| IngestError::transport("No service is accepting channels"))?;
        Ok(duplex)
    }
}

// =============================================================================
// Tests
// =============================================================================
