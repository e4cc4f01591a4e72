//! Add pipeline.
//!
//! Wires one duplex channel per operation: a spawned [`Sender`] drains the
//! entry stream into the sink while the caller pulls results through the
//! [`Receiver`]. The operation is a lazy stream; nothing happens until it
//! is first polled, and dropping it cancels the operation.

use crate::cid::{default_parser, CidParser};
use crate::config::ClientConfig;
use crate::error::{IngestError, Result};
use crate::streaming::channel::DuplexConnector;
use crate::streaming::entry::EntryStream;
use crate::streaming::receiver::{AddEvent, AddResult, ProgressFn, Receiver};
use crate::streaming::sender::{SendStats, Sender};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long a failed or finished operation waits for its sender task
const SENDER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Options
// =============================================================================

/// Per-operation options. Unset values fall back to the client config.
#[derive(Clone, Default)]
pub struct AddOptions {
    pub progress: Option<ProgressFn>,
    pub timeout: Option<Duration>,
    pub url: Option<String>,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64, &str) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

impl std::fmt::Debug for AddOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddOptions")
            .field("progress", &self.progress.is_some())
            .field("timeout", &self.timeout)
            .field("url", &self.url)
            .finish()
    }
}

// =============================================================================
// Client
// =============================================================================

pub struct IngestClient {
    connector: Arc<dyn DuplexConnector>,
    config: ClientConfig,
    cid_parser: CidParser,
}

impl IngestClient {
    pub fn new(connector: Arc<dyn DuplexConnector>, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            cid_parser: default_parser(),
        }
    }

    /// Replace the parser applied to every returned `cid`.
    pub fn with_cid_parser(mut self, cid_parser: CidParser) -> Self {
        self.cid_parser = cid_parser;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Add every entry and stream back one result per imported entry.
    /// PROGRESS replies go to `options.progress`.
    pub fn add_all(&self, entries: EntryStream, options: AddOptions) -> AddAll {
        self.start(entries, options)
    }

    /// Like [`add_all`](Self::add_all), but progress is interleaved with
    /// results instead of going to a callback.
    pub fn add_all_events(&self, entries: EntryStream, options: AddOptions) -> AddEvents {
        self.start(entries, options)
    }

    fn start<T: Output>(&self, entries: EntryStream, options: AddOptions) -> IngestStream<T> {
        let cancel = CancellationToken::new();
        let operation = Operation {
            connector: self.connector.clone(),
            endpoint: options.url.or_else(|| self.config.url.clone()),
            cid_parser: self.cid_parser.clone(),
            progress: options.progress,
            timeout: options.timeout.or_else(|| self.config.timeout()),
            deadline: None,
            cancel: cancel.clone(),
            state: State::Created(entries),
        };

        let inner = stream::unfold(operation, |mut op| async move {
            op.step::<T>().await.map(|item| (item, op))
        })
        .fuse()
        .boxed();

        IngestStream { inner, cancel }
    }
}

// =============================================================================
// Output stream
// =============================================================================

/// Results of one add operation
pub type AddAll = IngestStream<AddResult>;

/// Progress and results of one add operation
pub type AddEvents = IngestStream<AddEvent>;

/// Lazy, cancellable stream of one add operation's output.
///
/// A failure is yielded once, after which the stream ends. Items yielded
/// before it stay valid.
pub struct IngestStream<T> {
    inner: BoxStream<'static, Result<T>>,
    cancel: CancellationToken,
}

/// Cancels an operation from elsewhere
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> IngestStream<T> {
    /// The next poll yields `IngestError::Cancelled` and closes the channel.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }
}

impl<T> Stream for IngestStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> Drop for IngestStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the receiver yields for an output type
#[async_trait]
trait Output: Sized + Send + 'static {
    async fn pull(receiver: &mut Receiver) -> Option<Result<Self>>;
}

#[async_trait]
impl Output for AddResult {
    async fn pull(receiver: &mut Receiver) -> Option<Result<Self>> {
        receiver.next_result().await
    }
}

#[async_trait]
impl Output for AddEvent {
    async fn pull(receiver: &mut Receiver) -> Option<Result<Self>> {
        receiver.next_event().await
    }
}

// =============================================================================
// Operation state machine
// =============================================================================

enum State {
    Created(EntryStream),
    Running {
        receiver: Receiver,
        send: JoinHandle<SendStats>,
        send_cancel: CancellationToken,
    },
    Finished,
}

struct Operation {
    connector: Arc<dyn DuplexConnector>,
    endpoint: Option<String>,
    cid_parser: CidParser,
    progress: Option<ProgressFn>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    state: State,
}

impl Operation {
    async fn step<T: Output>(&mut self) -> Option<Result<T>> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Created(entries) => {
                self.deadline = self.timeout.map(|t| Instant::now() + t);
                match self.open(entries).await {
                    Ok(running) => self.state = running,
                    Err(e) => {
                        log_failure(&e, None);
                        return Some(Err(e));
                    }
                }
            }
            other => self.state = other,
        }

        let State::Running { receiver, .. } = &mut self.state else {
            return None;
        };
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(IngestError::Cancelled)),
            _ = deadline_elapsed(self.deadline) => Some(Err(timeout_error(self.timeout))),
            item = T::pull(receiver) => item,
        };

        match item {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(e)) => {
                self.fail(&e).await;
                Some(Err(e))
            }
            None => {
                self.complete().await;
                None
            }
        }
    }

    /// Open the channel and start the sender. The deadline and cancellation
    /// cover the open too.
    async fn open(&mut self, entries: EntryStream) -> Result<State> {
        tracing::debug!(
            "Opening ingest channel to {}",
            self.endpoint.as_deref().unwrap_or("default endpoint")
        );
        let duplex = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            _ = deadline_elapsed(self.deadline) => return Err(timeout_error(self.timeout)),
            duplex = self.connector.open(self.endpoint.as_deref()) => duplex?,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let send_cancel = self.cancel.child_token();
        let send = tokio::spawn(Sender::new(ready_rx, send_cancel.clone()).run(entries, duplex.sink));
        let receiver = Receiver::new(duplex.source, self.cid_parser.clone())
            .with_progress(self.progress.clone())
            .with_ready(ready_tx);

        Ok(State::Running {
            receiver,
            send,
            send_cancel,
        })
    }

    /// Stop the sender and close the read side. The sender is joined in the
    /// background so the error reaches the caller without waiting on it.
    async fn fail(&mut self, err: &IngestError) {
        if let State::Running {
            mut receiver,
            send,
            send_cancel,
        } = std::mem::replace(&mut self.state, State::Finished)
        {
            send_cancel.cancel();
            receiver.close().await;
            let err = err.clone();
            tokio::spawn(async move {
                let stats = join_sender(send).await;
                log_failure(&err, Some(&stats));
            });
        }
    }

    async fn complete(&mut self) {
        if let State::Running { send, .. } = std::mem::replace(&mut self.state, State::Finished) {
            let stats = join_sender(send).await;
            tracing::debug!(
                "Add complete: {} entries sent ({} bytes)",
                stats.entries,
                stats.bytes
            );
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn timeout_error(timeout: Option<Duration>) -> IngestError {
    IngestError::Timeout(timeout.unwrap_or_default())
}

async fn join_sender(mut send: JoinHandle<SendStats>) -> SendStats {
    match tokio::time::timeout(SENDER_SHUTDOWN_GRACE, &mut send).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            tracing::warn!("Sender task failed: {}", e);
            SendStats::default()
        }
        Err(_) => {
            tracing::warn!("Sender did not stop within {:?}, aborting it", SENDER_SHUTDOWN_GRACE);
            send.abort();
            SendStats::default()
        }
    }
}

fn log_failure(err: &IngestError, stats: Option<&SendStats>) {
    let sent = stats.map_or(0, |s| s.entries);
    if err.is_cancellation() {
        tracing::debug!("Add stopped after {} entries sent: {}", sent, err);
    } else {
        tracing::warn!("Add failed after {} entries sent: {}", sent, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{
        InboundMessage, MemoryConnector, ResultReply, ServiceEnd, ServiceRequest,
    };
    use crate::streaming::entry::{entries_from_iter, Entry};
    use futures::TryStreamExt;

    const CID: &str = "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy";

    fn client() -> (IngestClient, tokio::sync::mpsc::UnboundedReceiver<ServiceEnd>) {
        let (connector, incoming) = MemoryConnector::new(16);
        (IngestClient::new(connector, ClientConfig::default()), incoming)
    }

    /// Echo service: one RESULT per completed entry, then close.
    async fn echo_service(mut service: ServiceEnd) {
        while let Some(req) = service.requests.recv().await {
            match req {
                ServiceRequest::Message(msg) if msg.ends_entry() => {
                    let reply = InboundMessage::Result(ResultReply {
                        path: msg.path,
                        cid: CID.to_string(),
                        mode: msg.mode.unwrap_or(0o644),
                        mtime: 0,
                        mtime_nsecs: 0,
                        size: 0,
                    });
                    if service.replies.send(Ok(reply)).await.is_err() {
                        return;
                    }
                }
                ServiceRequest::Message(_) => {}
                ServiceRequest::End(_) => return,
            }
        }
    }

    #[tokio::test]
    async fn test_add_all_yields_results() {
        let (client, mut incoming) = client();
        tokio::spawn(async move {
            while let Some(service) = incoming.recv().await {
                tokio::spawn(echo_service(service));
            }
        });

        let entries = entries_from_iter(vec![
            Entry::directory("a"),
            Entry::file_from_chunks("a/b", vec![&b"data"[..]]),
        ]);
        let results: Vec<AddResult> = client
            .add_all(entries, AddOptions::new())
            .try_collect()
            .await
            .unwrap();
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b"]);
    }

    #[tokio::test]
    async fn test_lazy_until_polled() {
        let (client, mut incoming) = client();
        let stream = client.add_all(entries_from_iter(vec![]), AddOptions::new());
        tokio::task::yield_now().await;
        assert!(incoming.try_recv().is_err());
        drop(stream);
    }

    #[tokio::test]
    async fn test_url_option_overrides_config() {
        let (connector, mut incoming) = MemoryConnector::new(4);
        let config = ClientConfig {
            url: Some("config-host:1".into()),
            ..ClientConfig::default()
        };
        let client = IngestClient::new(connector, config);

        let mut stream = client.add_all(
            entries_from_iter(vec![]),
            AddOptions::new().with_url("option-host:2"),
        );
        let poll = tokio::spawn(async move { stream.next().await.is_none() });

        let service = incoming.recv().await.unwrap();
        assert_eq!(service.endpoint.as_deref(), Some("option-host:2"));
        drop(service);
        assert!(poll.await.unwrap());
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_once() {
        let (client, incoming) = client();
        drop(incoming);

        let mut stream = client.add_all(entries_from_iter(vec![]), AddOptions::new());
        assert!(matches!(
            stream.next().await,
            Some(Err(IngestError::Transport(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_first_poll() {
        let (client, mut incoming) = client();
        let mut stream = client.add_all(entries_from_iter(vec![]), AddOptions::new());
        stream.cancel_handle().cancel();

        assert!(matches!(stream.next().await, Some(Err(IngestError::Cancelled))));
        assert!(stream.next().await.is_none());
        assert!(incoming.try_recv().is_err());
    }
}
