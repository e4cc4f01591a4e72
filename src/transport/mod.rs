//! Duplex channel adapters speaking the framed wire protocol.

pub mod framed;
pub mod server;
pub mod tcp;

pub use framed::{framed_duplex, FramedSink, FramedSource};
pub use server::ServerCommand;
pub use tcp::{parse_endpoint, TcpConnector};
