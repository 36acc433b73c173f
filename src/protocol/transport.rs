use std::io::{self, Read, Write};

use bincode::{
    config::{Configuration, Fixint, LittleEndian},
    decode_from_std_read, encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

/// Reader half handed to [`RequestHandler`](super::RequestHandler)s.
pub type SocketReader = FrameReader<Box<dyn Read + Send>>;
/// Writer half handed to [`RequestHandler`](super::RequestHandler)s.
pub type SocketWriter = FrameWriter<Box<dyn Write + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] DecodeError),
    #[error("invalid string: {0}")]
    InvalidString(String),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the peer went away, as opposed to a fault on a live socket.
    pub fn is_disconnect(&self) -> bool {
        use io::ErrorKind::*;

        matches!(
            self.io_kind(),
            Some(UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected)
        )
    }

    fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io(e) => Some(e.kind()),
            TransportError::Deserialize(DecodeError::Io { inner, .. }) => Some(inner.kind()),
            TransportError::Deserialize(DecodeError::UnexpectedEnd { .. }) => {
                Some(io::ErrorKind::UnexpectedEof)
            }
            TransportError::Serialize(EncodeError::Io { inner, .. }) => Some(inner.kind()),
            _ => None,
        }
    }
}

fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Decodes GameMaker buffer values from a byte stream.
pub struct FrameReader<R: Read> {
    stream: R,
    config: Configuration<LittleEndian, Fixint>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            config: wire_config(),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, TransportError> {
        Ok(decode_from_std_read(&mut self.stream, self.config)?)
    }

    pub fn read_u16(&mut self) -> Result<u16, TransportError> {
        Ok(decode_from_std_read(&mut self.stream, self.config)?)
    }

    /// Discards exactly `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), TransportError> {
        let len = len as u64;
        let skipped = io::copy(&mut self.stream.by_ref().take(len), &mut io::sink())?;
        if skipped < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    /// Reads a u16 length followed by that many bytes; a trailing NUL is dropped.
    pub fn read_string(&mut self) -> Result<String, TransportError> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0; len];
        self.stream.read_exact(&mut buf)?;

        if buf.last() == Some(&0) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|e| TransportError::InvalidString(e.to_string()))
    }
}

/// Encodes GameMaker buffer values onto a byte stream.
pub struct FrameWriter<W: Write> {
    stream: W,
    config: Configuration<LittleEndian, Fixint>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            config: wire_config(),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), TransportError> {
        encode_into_std_write(value, &mut self.stream, self.config)?;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), TransportError> {
        encode_into_std_write(value, &mut self.stream, self.config)?;
        Ok(())
    }

    /// Writes `value` as a u16 length (counting the terminator), its bytes and a NUL.
    pub fn write_string(&mut self, value: &str) -> Result<(), TransportError> {
        let len = u16::try_from(value.len() + 1).map_err(|_| {
            TransportError::InvalidString(format!("{} bytes do not fit a frame", value.len()))
        })?;

        self.write_u16(len)?;
        self.stream.write_all(value.as_bytes())?;
        self.write_u8(0)
    }

    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.stream
    }
}
