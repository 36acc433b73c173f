use std::{any::Any, fmt};

use thiserror::Error;

/// Protocol tag every request and response frame carries.
pub const HANDSHAKE: u16 = 420;

/// Extra data a request carries from the framing thread to its handler.
pub type Payload = Box<dyn Any + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown request code {0}")]
pub struct UnknownRequestCode(pub u8);

/// Opcodes understood by [`IdentityHandler`](super::IdentityHandler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    /// Asks for the connection's identifier.
    UserId = 1,
}

impl TryFrom<u8> for RequestCode {
    type Error = UnknownRequestCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RequestCode::UserId),
            code => Err(UnknownRequestCode(code)),
        }
    }
}

impl From<RequestCode> for u8 {
    fn from(value: RequestCode) -> Self {
        value as u8
    }
}

/// A queued opcode and whatever the handler needs beyond it.
pub struct Request {
    code: u8,
    payload: Option<Payload>,
}

impl Request {
    pub fn new(code: impl Into<u8>) -> Self {
        Self {
            code: code.into(),
            payload: None,
        }
    }

    pub fn with_payload<T: Any + Send>(code: impl Into<u8>, payload: T) -> Self {
        Self {
            code: code.into(),
            payload: Some(Box::new(payload)),
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    /// Borrows the payload if there is one and it is a `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref()
    }

    pub fn into_payload<T: Any>(self) -> Option<Box<T>> {
        self.payload?.downcast().ok()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("code", &self.code)
            .field("payload", &self.payload.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_code_from_byte() {
        assert_eq!(RequestCode::try_from(1), Ok(RequestCode::UserId));
        assert_eq!(RequestCode::try_from(7), Err(UnknownRequestCode(7)));
        assert_eq!(u8::from(RequestCode::UserId), 1);
    }

    #[test]
    fn request_without_payload() {
        let request = Request::new(RequestCode::UserId);

        assert_eq!(request.code(), 1);
        assert!(request.payload::<String>().is_none());
    }

    #[test]
    fn payload_downcasts_to_its_type() {
        let request = Request::with_payload(9u8, String::from("score"));

        assert_eq!(request.payload::<String>().map(String::as_str), Some("score"));
        assert!(request.payload::<u32>().is_none());
        assert_eq!(*request.into_payload::<String>().unwrap(), "score");
    }
}
