//! Client-server communication protocol.
//!
//! This module implements a small framework for serving GameMaker clients over
//! TCP. Clients send binary request frames, the server queues them per
//! connection, and a single processing thread later answers them in order.
//!
//! # Overview
//!
//! ```text
//! socket bytes -> framing thread -> RequestQueue -> processing sweep -> response bytes
//! ```
//!
//! - [`Server`]: owns the listening socket and the live connection set. It runs
//!   an acceptor thread and, independently, a processing thread that drains
//!   every connection's queue in turn.
//! - [`Connection`]: owns one client socket and its framing thread.
//! - [`RequestHandler`]: decides which opcodes exist and how they are answered.
//!
//! # Binary Format
//!
//! Request frames look like:
//!
//! - one marker byte followed by the rest of the fixed-size GameMaker packet
//!   header, which is skipped;
//! - a u16 protocol tag, which must equal [`HANDSHAKE`] or the frame is dropped;
//! - a u8 opcode and whatever payload that opcode defines.
//!
//! Responses start with the tag and the opcode again. All integers are
//! little-endian; strings are a u16 length (counting the terminator), the
//! UTF-8 bytes and a NUL.
//!
//! # Extensibility
//!
//! Opcodes the handler does not recognise are ignored, so clients can be ahead
//! of the server. Applications add opcodes by implementing [`RequestHandler`]
//! and passing it to [`Server::with_handler`].
mod connection;
mod handler;
mod queue;
mod registry;
mod request;
mod server;
mod thread;
mod transport;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionId, State};
pub use handler::{IdentityHandler, RequestHandler, write_identity};
pub use queue::RequestQueue;
pub use request::{HANDSHAKE, Payload, Request, RequestCode, UnknownRequestCode};
pub use server::{Server, ServerError};
pub use transport::{FrameReader, FrameWriter, SocketReader, SocketWriter, TransportError};
