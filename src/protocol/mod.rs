//! Backend communication protocol.
//!
//! This module defines how a client and the configuration backend exchange
//! messages: the wire framing, the blocking transport that moves whole
//! messages over a stream socket, the request/reply client, one-way
//! notifications and the backend's session server.
//!
//! # Key Components
//!
//! - [`Message`]: one framed message, built from an XML body.
//! - [`ProtocolTransport`]: sends and receives [`Message`]s over any byte stream
//!   (unix socket, TCP connection, or an in-memory mock in tests).
//! - [`RpcClient`]: synchronous request/reply over one channel.
//! - [`BackendServer`]: accepts sessions and answers them, checking NACM
//!   before running any operation.
//!
//! # Binary Format
//!
//! ```text
//! offset 0   total_length   u32, big-endian, counts the header too
//! offset 4   body           total_length - 4 bytes
//! ```
//!
//! Bodies built from a string carry a trailing NUL which is part of
//! `total_length`. There is no version field and no checksum; a short header
//! or body leaves the stream out of sync and the channel must be closed.
//!
//! # Interruption
//!
//! All I/O goes through [`read_full`]/[`write_full`], which retry interrupted
//! and would-block system calls until a [`CancelToken`] owned by the caller
//! is cancelled.
mod atomic;
mod client;
mod message;
mod notify;
mod server;
mod thread;
mod transport;

pub use atomic::{CancelToken, Transfer, read_full, write_full};
pub use client::{RpcClient, one_shot, one_shot_keep_open, rpc};
pub use message::{BodyBuilder, HEADER_LEN, Message, MessageError};
pub use notify::notification;
pub use server::{Backend, BackendConfig, BackendServer, DEFAULT_MAX_SESSIONS, ServerError};
pub use thread::SessionThreads;
pub use transport::{
    Channel, ConnectError, Endpoint, FramingError, ProtocolTransport, TransportError,
    connect_inet, connect_unix,
};
