//! Request frame encoding.
//!
//! A request is one array-of-bulk-strings frame: `*<argc>\r\n` followed by
//! `$<len>\r\n<bytes>\r\n` per field. Commands start from a literal preamble
//! covering the argument count and the command keyword, then append their
//! arguments. Argument content passes through byte for byte; there is no
//! escaping or validation.

use bytes::{BufMut, BytesMut};
use std::fmt::Write;
use std::sync::Mutex;

/// Reusable write buffers. A buffer is checked out per request, handed to the
/// send path, and recycled once the write has completed either way. Contents
/// are not zeroed between uses; only the logical length resets.
static WRITE_BUFFERS: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

/// Soft cap on the number of buffers retained for reuse.
const POOL_LIMIT: usize = 64;

fn checkout() -> BytesMut {
    let mut buf = WRITE_BUFFERS
        .lock()
        .unwrap()
        .pop()
        .unwrap_or_else(|| BytesMut::with_capacity(256));
    buf.clear();
    buf
}

fn recycle(buf: BytesMut) {
    let mut pool = WRITE_BUFFERS.lock().unwrap();
    if pool.len() < POOL_LIMIT {
        pool.push(buf);
    }
}

/// A single encoded request frame, built once per call.
#[derive(Debug)]
pub(crate) struct Request {
    buf: BytesMut,
}

impl Request {
    /// Starts a request from a literal preamble, e.g. `"*2\r\n$3\r\nGET\r\n"`.
    pub(crate) fn new(preamble: &str) -> Request {
        let mut buf = checkout();
        buf.extend_from_slice(preamble.as_bytes());
        Request { buf }
    }

    /// Starts a request with `fields` array entries and the given command
    /// keyword. Used by commands whose arity is only known at runtime.
    pub(crate) fn multi(fields: usize, keyword: &str) -> Request {
        let mut buf = checkout();
        buf.put_u8(b'*');
        let _ = write!(buf, "{}", fields);
        buf.extend_from_slice(b"\r\n$");
        let _ = write!(buf, "{}", keyword.len());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(keyword.as_bytes());
        buf.extend_from_slice(b"\r\n");
        Request { buf }
    }

    /// Appends one bulk field holding raw bytes.
    pub(crate) fn add_bytes(&mut self, arg: &[u8]) {
        self.buf.put_u8(b'$');
        let _ = write!(self.buf, "{}", arg.len());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(arg);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends one bulk field holding a decimal integer.
    ///
    /// The length field is reserved at a fixed width (one digit for values
    /// whose decimal form is at most 9 bytes, two digits otherwise) and
    /// back-patched once the value has been formatted, avoiding a second
    /// pass over the buffer.
    pub(crate) fn add_int(&mut self, value: i64) {
        self.buf.put_u8(b'$');

        let size_at = self.buf.len();
        let one_digit = value > -100_000_000 && value < 1_000_000_000;
        if one_digit {
            self.buf.extend_from_slice(&[0, b'\r', b'\n']);
        } else {
            self.buf.extend_from_slice(&[0, 0, b'\r', b'\n']);
        }

        let int_at = self.buf.len();
        let _ = write!(self.buf, "{}", value);
        let size = self.buf.len() - int_at;
        if one_digit {
            self.buf[size_at] = size as u8 + b'0';
        } else {
            self.buf[size_at] = (size / 10) as u8 + b'0';
            self.buf[size_at + 1] = (size % 10) as u8 + b'0';
        }

        self.buf.extend_from_slice(b"\r\n");
    }

    /// The encoded frame.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        recycle(std::mem::take(&mut self.buf));
    }
}
