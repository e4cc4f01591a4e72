//! Message framer.
//!
//! Turns entries into outbound messages. A directory is one message; a file
//! is one message per content chunk plus a content-less end-of-file message.
//! Every message of a file carries the same index, path, mode and mtime.

use crate::error::{IngestError, Result};
use crate::streaming::channel::{MessageKind, OutboundMessage};
use crate::streaming::entry::{Entry, EntryBody, EntryStream, Mtime};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

/// Lazy sequence of messages for one or more entries
pub type MessageStream = BoxStream<'static, Result<OutboundMessage>>;

/// Fields shared by all messages of one entry
#[derive(Debug, Clone)]
struct Header {
    index: u64,
    path: String,
    mode: Option<u32>,
    mtime: Option<Mtime>,
}

impl Header {
    fn message(&self, kind: MessageKind, content: Option<bytes::Bytes>) -> OutboundMessage {
        OutboundMessage {
            index: self.index,
            kind,
            path: self.path.clone(),
            mode: self.mode,
            mtime: self.mtime,
            content,
        }
    }
}

/// Assigns entry indexes, starting at 1
#[derive(Debug)]
pub struct Framer {
    next_index: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self { next_index: 1 }
    }

    /// Index the next entry will receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Assign the next index to `entry` and frame it.
    pub fn frame(&mut self, entry: Entry) -> (u64, MessageStream) {
        let index = self.next_index;
        self.next_index += 1;
        (index, frame_entry(index, entry))
    }
}

/// Frame one entry under a given index.
///
/// A failed chunk read is yielded as `IngestError::Input`; consumers stop at
/// the first error, so the end-of-file message is never reached after one.
pub fn frame_entry(index: u64, entry: Entry) -> MessageStream {
    let Entry {
        path,
        mode,
        mtime,
        body,
    } = entry;
    let header = Header {
        index,
        path,
        mode,
        mtime,
    };

    match body {
        EntryBody::Directory => {
            stream::once(future::ready(Ok(header.message(MessageKind::Directory, None)))).boxed()
        }
        EntryBody::File(content) => {
            let eof = header.message(MessageKind::File, None);
            content
                .map(move |chunk| match chunk {
                    Ok(data) => Ok(header.message(MessageKind::File, Some(data))),
                    Err(e) => Err(IngestError::input(header.path.clone(), e)),
                })
                .chain(stream::once(future::ready(Ok(eof))))
                .boxed()
        }
    }
}

/// Frame a whole entry stream. Entries are framed strictly one after
/// another; a normalizer error is passed through as-is.
pub fn frame_all(entries: EntryStream) -> MessageStream {
    let mut framer = Framer::new();
    entries
        .map_ok(move |entry| framer.frame(entry).1)
        .try_flatten()
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::entry::entries_from_iter;
    use bytes::Bytes;
    use futures::executor::block_on;
    use proptest::prelude::*;
    use std::io;

    fn collect(stream: MessageStream) -> Vec<Result<OutboundMessage>> {
        block_on(stream.collect())
    }

    #[test]
    fn test_directory_single_message() {
        let mut framer = Framer::new();
        let (index, stream) = framer.frame(Entry::directory("d").with_mode(0o755));
        assert_eq!(index, 1);
        assert_eq!(framer.next_index(), 2);

        let msgs = collect(stream);
        assert_eq!(msgs.len(), 1);
        let msg = msgs[0].as_ref().unwrap();
        assert_eq!(msg.kind, MessageKind::Directory);
        assert_eq!(msg.mode, Some(0o755));
        assert_eq!(msg.mtime, None);
        assert!(msg.content.is_none());
    }

    #[test]
    fn test_file_metadata_on_every_chunk() {
        let mtime = Mtime::new(100, 5);
        let entry = Entry::file_from_chunks("f", vec![&b"ab"[..], &b"cd"[..]])
            .with_mode(0o600)
            .with_mtime(mtime);
        let msgs: Vec<OutboundMessage> = collect(frame_entry(3, entry))
            .into_iter()
            .map(|m| m.unwrap())
            .collect();

        assert_eq!(msgs.len(), 3);
        for msg in &msgs {
            assert_eq!(msg.index, 3);
            assert_eq!(msg.kind, MessageKind::File);
            assert_eq!(msg.mode, Some(0o600));
            assert_eq!(msg.mtime, Some(mtime));
        }
        assert_eq!(msgs[0].content.as_deref(), Some(&b"ab"[..]));
        assert_eq!(msgs[1].content.as_deref(), Some(&b"cd"[..]));
        assert!(msgs[2].is_end_of_file());
    }

    #[test]
    fn test_empty_file_still_has_eof() {
        let entry = Entry::file_from_chunks("empty", Vec::<Bytes>::new());
        let msgs = collect(frame_entry(1, entry));
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].as_ref().unwrap().is_end_of_file());
    }

    #[test]
    fn test_chunk_error_is_input_error() {
        let content = stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(io::Error::new(io::ErrorKind::Other, "bad sector")),
        ])
        .boxed();
        let mut msgs = block_on(frame_entry(2, Entry::file("f", content)).collect::<Vec<_>>());
        assert!(msgs[0].is_ok());
        match msgs.remove(1) {
            Err(IngestError::Input { path, .. }) => assert_eq!(path, "f"),
            other => panic!("Expected input error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_all_stops_at_first_error() {
        let content = stream::iter(vec![Err(io::Error::new(io::ErrorKind::Other, "boom"))]).boxed();
        let entries = entries_from_iter(vec![
            Entry::directory("a"),
            Entry::file("b", content),
            Entry::directory("c"),
        ]);
        let result: Result<Vec<OutboundMessage>> = block_on(frame_all(entries).try_collect());
        assert!(matches!(result, Err(IngestError::Input { .. })));
    }

    #[test]
    fn test_frame_all_example_order() {
        let entries = entries_from_iter(vec![
            Entry::directory("/a"),
            Entry::file_from_chunks("/b", vec![&b"chunk1"[..], &b"chunk2"[..]]),
        ]);
        let msgs: Vec<OutboundMessage> = block_on(frame_all(entries).try_collect()).unwrap();
        let summary: Vec<(u64, MessageKind, &str, Option<&[u8]>)> = msgs
            .iter()
            .map(|m| (m.index, m.kind, m.path.as_str(), m.content.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, MessageKind::Directory, "/a", None),
                (2, MessageKind::File, "/b", Some(&b"chunk1"[..])),
                (2, MessageKind::File, "/b", Some(&b"chunk2"[..])),
                (2, MessageKind::File, "/b", None),
            ]
        );
    }

    proptest! {
        /// None = directory, Some(n) = file with n chunks
        #[test]
        fn prop_indexes_and_chunk_counts(shape in prop::collection::vec(prop::option::of(0usize..5), 0..20)) {
            let entries: Vec<Entry> = shape
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    None => Entry::directory(format!("d{}", i)),
                    Some(n) => Entry::file_from_chunks(
                        format!("f{}", i),
                        (0..*n).map(|c| Bytes::from(vec![c as u8; c + 1])),
                    ),
                })
                .collect();

            let msgs: Vec<OutboundMessage> =
                block_on(frame_all(entries_from_iter(entries)).try_collect()).unwrap();

            // Non-decreasing and 1-based
            prop_assert!(msgs.windows(2).all(|w| w[0].index <= w[1].index));

            for (i, s) in shape.iter().enumerate() {
                let index = i as u64 + 1;
                let own: Vec<&OutboundMessage> = msgs.iter().filter(|m| m.index == index).collect();
                match s {
                    None => {
                        prop_assert_eq!(own.len(), 1);
                        prop_assert_eq!(own[0].kind, MessageKind::Directory);
                    }
                    Some(n) => {
                        prop_assert_eq!(own.len(), n + 1);
                        prop_assert!(own[..*n].iter().all(|m| m.content.is_some()));
                        prop_assert!(own[*n].is_end_of_file());
                    }
                }
            }
        }
    }
}
