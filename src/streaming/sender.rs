//! Sender task for the ingest pipeline.
//!
//! Waits until the Receiver has started reading, then pumps framed entries
//! into the channel sink one entry at a time. The outcome is reported only
//! through the sink: a clean end half-closes it, any failure aborts it with
//! the error, which the channel replays to the Receiver.

use crate::error::{IngestError, Result};
use crate::streaming::channel::MessageSink;
use crate::streaming::entry::EntryStream;
use crate::streaming::framer::frame_all;
use futures::TryStreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Counters reported when the sender finishes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    /// Entries whose last message was sent
    pub entries: u64,
    pub messages: u64,
    /// Content bytes sent
    pub bytes: u64,
}

pub struct Sender {
    ready: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

impl Sender {
    /// `ready` fires when the Receiver first pulls from the channel.
    pub fn new(ready: oneshot::Receiver<()>, cancel: CancellationToken) -> Self {
        Self { ready, cancel }
    }

    /// Run the sender to completion. Never fails: errors go to the sink.
    pub async fn run(self, entries: EntryStream, mut sink: Box<dyn MessageSink>) -> SendStats {
        let Sender { ready, cancel } = self;
        let mut stats = SendStats::default();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            r = ready => r.is_ok(),
        };
        if !started {
            tracing::debug!("Sender stopped before the receiver became ready");
            end_sink(sink.as_mut(), Some(IngestError::Cancelled)).await;
            return stats;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            r = pump(entries, sink.as_mut(), &mut stats) => r,
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(
                    "Sent {} entries ({} messages, {} bytes)",
                    stats.entries,
                    stats.messages,
                    stats.bytes
                );
                // A service that stopped reading can stall the half-close
                let ended = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = end_sink(sink.as_mut(), None) => true,
                };
                if !ended {
                    tracing::debug!("Sender cancelled while closing the channel");
                    end_sink(sink.as_mut(), Some(IngestError::Cancelled)).await;
                }
            }
            Err(err) => {
                if err.is_cancellation() {
                    tracing::debug!("Sender cancelled after {} entries", stats.entries);
                } else {
                    tracing::warn!("Aborting upload after {} entries: {}", stats.entries, err);
                }
                end_sink(sink.as_mut(), Some(err)).await;
            }
        }
        stats
    }
}

async fn pump(entries: EntryStream, sink: &mut dyn MessageSink, stats: &mut SendStats) -> Result<()> {
    let mut messages = frame_all(entries);
    while let Some(msg) = messages.try_next().await? {
        let ends_entry = msg.ends_entry();
        let len = msg.content.as_ref().map_or(0, |c| c.len() as u64);
        sink.push(msg).await?;
        stats.messages += 1;
        stats.bytes += len;
        if ends_entry {
            stats.entries += 1;
        }
    }
    Ok(())
}

async fn end_sink(sink: &mut dyn MessageSink, error: Option<IngestError>) {
    if let Err(e) = sink.end(error).await {
        // Surfaces on the read side through the transport
        tracing::debug!("Failed to end channel sink: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{memory_channel, ServiceRequest};
    use crate::streaming::entry::{entries_from_iter, Entry};
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use std::io;

    async fn drain(service: &mut crate::streaming::channel::ServiceEnd) -> Vec<ServiceRequest> {
        let mut seen = Vec::new();
        while let Some(req) = service.requests.recv().await {
            let done = matches!(req, ServiceRequest::End(_));
            seen.push(req);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_sends_all_then_half_closes() {
        let (duplex, mut service) = memory_channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        let sender = Sender::new(ready_rx, CancellationToken::new());

        let entries = entries_from_iter(vec![
            Entry::directory("a"),
            Entry::file_from_chunks("b", vec![Bytes::from_static(b"12345")]),
        ]);
        let handle = tokio::spawn(sender.run(entries, duplex.sink));
        ready_tx.send(()).unwrap();

        let seen = drain(&mut service).await;
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[3], ServiceRequest::End(None)));

        let stats = handle.await.unwrap();
        assert_eq!(
            stats,
            SendStats {
                entries: 2,
                messages: 3,
                bytes: 5
            }
        );
    }

    #[tokio::test]
    async fn test_waits_for_ready() {
        let (duplex, mut service) = memory_channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        let sender = Sender::new(ready_rx, CancellationToken::new());
        let handle = tokio::spawn(sender.run(
            entries_from_iter(vec![Entry::directory("a")]),
            duplex.sink,
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(service.requests.try_recv().is_err());

        ready_tx.send(()).unwrap();
        let seen = drain(&mut service).await;
        assert_eq!(seen.len(), 2);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_gone_sends_nothing() {
        let (duplex, mut service) = memory_channel(8);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        drop(ready_tx);

        let sender = Sender::new(ready_rx, CancellationToken::new());
        let stats = sender
            .run(entries_from_iter(vec![Entry::directory("a")]), duplex.sink)
            .await;

        assert_eq!(stats.messages, 0);
        let seen = drain(&mut service).await;
        assert!(matches!(
            seen.as_slice(),
            [ServiceRequest::End(Some(IngestError::Cancelled))]
        ));
    }

    #[tokio::test]
    async fn test_content_failure_aborts_sink() {
        let (mut duplex, mut service) = memory_channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).unwrap();

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"x")),
            Err(io::Error::new(io::ErrorKind::Other, "read failed")),
        ])
        .boxed();
        let entries = entries_from_iter(vec![
            Entry::directory("one"),
            Entry::file("two", broken),
            Entry::directory("three"),
        ]);
        let stats = Sender::new(ready_rx, CancellationToken::new())
            .run(entries, duplex.sink)
            .await;
        assert_eq!(stats.entries, 1);

        let seen = drain(&mut service).await;
        let indexes: Vec<u64> = seen
            .iter()
            .filter_map(|r| match r {
                ServiceRequest::Message(m) => Some(m.index),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, vec![1, 2]);
        assert!(matches!(
            seen.last(),
            Some(ServiceRequest::End(Some(IngestError::Input { .. })))
        ));

        // The abort is replayed on the read side
        assert!(matches!(
            duplex.source.next().await,
            Some(Err(IngestError::Input { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_push() {
        // Capacity 1 and nobody reading: the second push blocks
        let (duplex, mut service) = memory_channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).unwrap();
        let cancel = CancellationToken::new();

        let entries = entries_from_iter((0..10).map(|i| Entry::directory(format!("d{}", i))));
        let handle = tokio::spawn(Sender::new(ready_rx, cancel.clone()).run(entries, duplex.sink));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.messages, 1);

        // The full channel could not take End; the sink drop closes it instead
        let seen = drain(&mut service).await;
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], ServiceRequest::Message(m) if m.path == "d0"));
    }

    #[tokio::test]
    async fn test_cancel_stops_blocked_half_close() {
        // The only slot holds the entry, so End(None) cannot be delivered
        let (duplex, mut service) = memory_channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).unwrap();
        let cancel = CancellationToken::new();

        let entries = entries_from_iter(vec![Entry::directory("only")]);
        let handle = tokio::spawn(Sender::new(ready_rx, cancel.clone()).run(entries, duplex.sink));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        cancel.cancel();

        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sender stuck in half-close")
            .unwrap();
        assert_eq!(stats.entries, 1);

        let seen = drain(&mut service).await;
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], ServiceRequest::Message(m) if m.path == "only"));
    }
}
