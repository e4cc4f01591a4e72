//! Streaming add pipeline.
//!
//! One add operation = one duplex channel, two concurrent tasks:
//!
//! ```text
//! +------------+     +----------+      sink      +---------+
//! | EntryStream| --> |  Framer  | --> Sender --> |         |
//! +------------+     +----------+                | service |
//!                  results <-- Receiver <------- |         |
//!                                        source  +---------+
//! ```
//!
//! The Sender starts only after the Receiver has begun reading. A send-side
//! failure aborts the sink and comes back to the caller through the source.

pub mod channel;
pub mod entry;
pub mod framer;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    memory_channel, Duplex, DuplexConnector, InboundMessage, MemoryConnector, MessageKind,
    MessageSink, MessageSource, OutboundMessage, ProgressReply, ResultReply, ServiceEnd,
    ServiceRequest,
};
pub use entry::{entries_from_iter, file_chunks, normalize_path, Entry, EntryBody, EntryKind, EntryStream, Mtime};
pub use framer::{frame_all, frame_entry, Framer, MessageStream};
pub use pipeline::{AddAll, AddEvents, AddOptions, CancelHandle, IngestClient, IngestStream};
pub use protocol::{MessageType, PROTOCOL_VERSION};
pub use receiver::{AddEvent, AddResult, ProgressFn, Receiver};
pub use sender::{SendStats, Sender};
