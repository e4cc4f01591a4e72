//! Duplex adapter over any tokio byte stream pair.
//!
//! The sink writes HELLO before the first ADD and flushes at every entry
//! boundary. Ending cleanly writes INPUT_END and shuts the writer down;
//! aborting writes ABORT (best effort) and replays the error on the source.

use crate::error::{IngestError, Result};
use crate::streaming::channel::{
    abort_signal, AbortTrigger, AbortWatch, Duplex, InboundMessage, MessageSink, MessageSource,
    OutboundMessage,
};
use crate::streaming::protocol::{
    decode_inbound, encode_add, encode_input_end, read_frame, write_frame, Hello, MessageType,
    Reason,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

/// Upper bound on delivering ABORT to a service that stopped reading
const ABORT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FramedSink<W: AsyncWrite + Unpin + Send> {
    writer: BufWriter<W>,
    hello_sent: bool,
    ended: bool,
    abort: AbortTrigger,
}

pub struct FramedSource<R: AsyncRead + Unpin + Send> {
    reader: Option<R>,
    abort: AbortWatch,
    done: bool,
}

pub fn framed_duplex<R, W>(reader: R, writer: W) -> Duplex
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (trigger, watch) = abort_signal();
    Duplex {
        sink: Box::new(FramedSink {
            writer: BufWriter::new(writer),
            hello_sent: false,
            ended: false,
            abort: trigger,
        }),
        source: Box::new(FramedSource {
            reader: Some(reader),
            abort: watch,
            done: false,
        }),
    }
}

impl<W: AsyncWrite + Unpin + Send> FramedSink<W> {
    async fn ensure_hello(&mut self) -> Result<()> {
        if !self.hello_sent {
            write_frame(&mut self.writer, &Hello::new().encode()).await?;
            self.hello_sent = true;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| IngestError::Transport(format!("Failed to flush: {}", e)))
    }

    async fn finish(&mut self) -> Result<()> {
        self.ensure_hello().await?;
        write_frame(&mut self.writer, &encode_input_end()).await?;
        self.flush().await?;
        self.writer
            .shutdown()
            .await
            .map_err(|e| IngestError::Transport(format!("Failed to half-close: {}", e)))
    }

    async fn send_abort(&mut self, reason: &IngestError) -> Result<()> {
        self.ensure_hello().await?;
        let frame = Reason::new(reason.to_string()).encode(MessageType::Abort);
        write_frame(&mut self.writer, &frame).await?;
        self.flush().await?;
        // Shutdown errors are expected on a broken connection
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for FramedSink<W> {
    async fn push(&mut self, message: OutboundMessage) -> Result<()> {
        if self.ended {
            return Err(IngestError::transport("Write after end of input"));
        }
        self.ensure_hello().await?;
        let frame = encode_add(&message)?;
        write_frame(&mut self.writer, &frame).await?;
        if message.ends_entry() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn end(&mut self, error: Option<IngestError>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        match error {
            None => self.finish().await,
            Some(err) => {
                self.abort.abort(err.clone());
                match tokio::time::timeout(ABORT_WRITE_TIMEOUT, self.send_abort(&err)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!("Could not deliver abort to service: {}", e),
                    Err(_) => tracing::debug!("Gave up delivering abort to service"),
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for FramedSource<R> {
    async fn next(&mut self) -> Option<Result<InboundMessage>> {
        if self.done {
            return None;
        }
        let reader = self.reader.as_mut()?;
        let item = tokio::select! {
            biased;
            err = self.abort.aborted() => Some(Err(err)),
            frame = read_frame(reader) => match frame {
                Ok(None) => None,
                Ok(Some((msg_type, payload))) => Some(decode_inbound(msg_type, payload)),
                Err(e) => Some(Err(e)),
            },
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }

    async fn close(&mut self) {
        self.done = true;
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{MessageKind, ProgressReply};
    use crate::streaming::protocol::{decode_add, encode_progress};
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt};

    fn chunk(index: u64, path: &str, data: Option<&'static [u8]>) -> OutboundMessage {
        OutboundMessage {
            index,
            kind: MessageKind::File,
            path: path.to_string(),
            mode: None,
            mtime: None,
            content: data.map(Bytes::from_static),
        }
    }

    #[tokio::test]
    async fn test_sink_writes_hello_adds_and_input_end() {
        let (client, mut server) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(client);
        let mut duplex = framed_duplex(read_half, write_half);

        duplex.sink.push(chunk(1, "f", Some(b"abc"))).await.unwrap();
        duplex.sink.push(chunk(1, "f", None)).await.unwrap();
        duplex.sink.end(None).await.unwrap();

        let (t, _) = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(t, MessageType::Hello);
        let (t, payload) = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(t, MessageType::Add);
        assert_eq!(decode_add(payload).unwrap().content.unwrap(), &b"abc"[..]);
        let (_, payload) = read_frame(&mut server).await.unwrap().unwrap();
        assert!(decode_add(payload).unwrap().is_end_of_file());
        let (t, _) = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(t, MessageType::InputEnd);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_source_reads_replies_until_eof() {
        let (client, mut server) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(client);
        let mut duplex = framed_duplex(read_half, write_half);

        let progress = ProgressReply {
            bytes: 10,
            path: "f".into(),
        };
        write_frame(&mut server, &encode_progress(&progress).unwrap())
            .await
            .unwrap();
        drop(server);

        assert_eq!(
            duplex.source.next().await.unwrap().unwrap(),
            InboundMessage::Progress(progress)
        );
        assert!(duplex.source.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_reaches_both_sides() {
        let (client, mut server) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(client);
        let mut duplex = framed_duplex(read_half, write_half);

        duplex
            .sink
            .end(Some(IngestError::transport("gone")))
            .await
            .unwrap();

        let err = duplex.source.next().await.unwrap().unwrap_err();
        assert!(matches!(err, IngestError::Transport(_)));
        assert!(duplex.source.next().await.is_none());

        let _hello = read_frame(&mut server).await.unwrap().unwrap();
        let (t, payload) = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(t, MessageType::Abort);
        assert!(Reason::decode(payload).unwrap().message.contains("gone"));
    }

    #[tokio::test]
    async fn test_garbage_from_service_is_protocol_error() {
        let (client, mut server) = duplex(1024);
        let (read_half, write_half) = tokio::io::split(client);
        let mut duplex = framed_duplex(read_half, write_half);

        write_frame(&mut server, &encode_input_end()).await.unwrap();

        assert!(matches!(
            duplex.source.next().await,
            Some(Err(IngestError::Protocol(_)))
        ));
        assert!(duplex.source.next().await.is_none());
    }
}
