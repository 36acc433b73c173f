//! Opcode handling.
//!
//! A [`RequestHandler`] is the seam where applications add opcodes. The
//! framing thread asks it to [`decode`](RequestHandler::decode) every frame
//! that carries the [`HANDSHAKE`] tag, and the processing thread later hands
//! the queued [`Request`] back to [`fulfill`](RequestHandler::fulfill).
use std::io::Write;

use log::{debug, warn};

use super::{
    Connection, ConnectionId, FrameWriter, HANDSHAKE, Request, RequestCode, SocketReader,
    SocketWriter, TransportError,
};

pub trait RequestHandler: Send + Sync {
    /// Turns an opcode into a request, reading any bytes the opcode carries.
    ///
    /// Returning `Ok(None)` drops the frame; unknown opcodes must do this
    /// without consuming anything.
    fn decode(
        &self,
        code: u8,
        reader: &mut SocketReader,
    ) -> Result<Option<Request>, TransportError>;

    /// Writes the response for `request`. Runs on the processing thread while
    /// `connection`'s writer is locked.
    fn fulfill(
        &self,
        connection: &Connection,
        request: Request,
        writer: &mut SocketWriter,
    ) -> Result<(), TransportError>;
}

/// Answers [`RequestCode::UserId`] with the connection identifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHandler;

impl RequestHandler for IdentityHandler {
    fn decode(
        &self,
        code: u8,
        _reader: &mut SocketReader,
    ) -> Result<Option<Request>, TransportError> {
        Ok(RequestCode::try_from(code).ok().map(Request::new))
    }

    fn fulfill(
        &self,
        connection: &Connection,
        request: Request,
        writer: &mut SocketWriter,
    ) -> Result<(), TransportError> {
        match RequestCode::try_from(request.code()) {
            Ok(RequestCode::UserId) => {
                debug!("{}: USER_ID", connection.peer());
                write_identity(&connection.id(), writer)
            }
            Err(e) => {
                warn!("{}: {e}, request dropped", connection.peer());
                Ok(())
            }
        }
    }
}

/// `[u16 tag][u8 opcode][u16 length][identifier][NUL]`
pub fn write_identity<W: Write>(
    id: &ConnectionId,
    writer: &mut FrameWriter<W>,
) -> Result<(), TransportError> {
    writer.write_u16(HANDSHAKE)?;
    writer.write_u8(RequestCode::UserId.into())?;
    writer.write_string(&id.to_string())
}
