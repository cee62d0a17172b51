use crate::Frame;

use bytes::Bytes;
use std::{fmt, str, vec};

/// Utility for walking an array reply.
///
/// Push frames and subscription confirmations are array frames. Each entry in
/// the frame is a "token".
#[derive(Debug)]
pub(crate) struct Parse {
    parts: vec::IntoIter<Frame>,
}

/// Error encountered while decoding an array reply.
///
/// Only `EndOfStream` is handled at runtime. All other errors invalidate the
/// connection's framing and result in it being torn down.
#[derive(Debug)]
pub(crate) enum ParseError {
    /// Failed to extract a value due to the frame being fully consumed.
    EndOfStream,

    /// All other errors.
    Other(crate::Error),
}

impl Parse {
    pub(crate) fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(array) => array,
            frame => return Err(format!("expected array, got {:?}", frame).into()),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    /// Returns the next frame.
    pub(crate) fn next(&mut self) -> Result<Frame, ParseError> {
        self.parts.next().ok_or(ParseError::EndOfStream)
    }

    /// Returns the next frame as a string.
    ///
    /// Only `Simple` and `Bulk` frames can be represented as strings.
    pub(crate) fn next_string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|_| "invalid string".into()),
            other => Err(format!("expected simple frame or bulk frame, got {:?}", other).into()),
        }
    }

    /// Returns the next frame as raw bytes.
    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            other => Err(format!("expected simple frame or bulk frame, got {:?}", other).into()),
        }
    }

    /// Returns the next frame as an integer.
    ///
    /// This includes `Simple`, `Bulk` and `Integer` frames. `Simple` and
    /// `Bulk` frames are parsed.
    pub(crate) fn next_int(&mut self) -> Result<i64, ParseError> {
        use atoi::atoi;

        const MSG: &str = "invalid number";

        match self.next()? {
            Frame::Integer(v) => Ok(v),
            Frame::Simple(s) => atoi::<i64>(s.as_bytes()).ok_or_else(|| MSG.into()),
            Frame::Bulk(data) => atoi::<i64>(&data).ok_or_else(|| MSG.into()),
            other => Err(format!("expected integer frame but got {:?}", other).into()),
        }
    }

    /// Ensure there are no more entries in the array.
    pub(crate) fn finish(&mut self) -> Result<(), ParseError> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err("expected end of frame, but there was more".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(crate::Error::Protocol(src))
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        src.to_string().into()
    }
}

impl From<ParseError> for crate::Error {
    fn from(src: ParseError) -> crate::Error {
        match src {
            ParseError::EndOfStream => {
                crate::Error::Protocol("unexpected end of frame".to_string())
            }
            ParseError::Other(err) => err,
        }
    }
}

impl std::error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EndOfStream => "unexpected end of frame".fmt(f),
            ParseError::Other(err) => err.fmt(f),
        }
    }
}
