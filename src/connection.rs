//! Transport plumbing: dialing and buffered reply decoding.

use crate::frame::{self, Frame};

use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{self, Duration};

/// Read half of an established connection.
pub(crate) type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an established connection.
pub(crate) type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// An address starting with a slash names a unix domain socket.
fn is_unix_addr(addr: &str) -> bool {
    addr.starts_with('/')
}

/// Establish a connection to `addr` within `connect_timeout`.
pub(crate) async fn dial(
    addr: &str,
    connect_timeout: Duration,
) -> crate::Result<(ReadHalf, WriteHalf)> {
    if is_unix_addr(addr) {
        #[cfg(unix)]
        {
            let stream = time::timeout(connect_timeout, UnixStream::connect(addr))
                .await
                .map_err(|_| crate::Error::Timeout)??;
            let (read, write) = stream.into_split();
            return Ok((Box::new(read), Box::new(write)));
        }
        #[cfg(not(unix))]
        {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )
            .into());
        }
    }

    let stream = time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| crate::Error::Timeout)??;
    let (read, write) = stream.into_split();
    Ok((Box::new(read), Box::new(write)))
}

/// Decodes `Frame`s from a remote peer.
#[derive(Debug)]
pub(crate) struct ReplyReader<R = ReadHalf> {
    stream: R,
    /// The internal buffer for reading frames.
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    /// Create a new `ReplyReader` over `stream`.
    pub(crate) fn new(stream: R) -> ReplyReader<R> {
        ReplyReader {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Tries to parse a frame from the buffer.
    ///
    /// If the buffer contains enough data, the frame is returned and the data
    /// removed from the buffer. If not enough data has been buffered yet,
    /// `Ok(None)` is returned. If the buffered data does not represent a valid
    /// frame, `Err` is returned.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // check if enough data has been buffered to parse a single frame.
        match Frame::check(&mut buf) {
            Ok(_) => {
                // remember the length of the frame.
                let len = buf.position() as usize;

                // reset the position to zero.
                buf.set_position(0);

                // parse the frame from the buffer.
                let frame = Frame::parse(&mut buf)?;

                // remove the parsed data from the buffer.
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // There is not enough data present in the read buffer to parse a single frame.
            Err(Incomplete) => Ok(None),
            // An error was encountered while parsing the frame.
            Err(e) => Err(e.into()),
        }
    }

    /// Read a single `Frame` value from the underlying stream.
    ///
    /// On success, the received frame is returned. If the stream is closed in
    /// a way that doesn't break a frame in half, `None` is returned.
    /// Otherwise, an error is returned.
    pub(crate) async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            // Attempt to read a frame from the buffered data.
            // If enough data has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // There is not enough buffered data to read a frame. Attempt to
            // read more data from the socket.
            //
            // `0` indicates "end of stream".
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    // The stream is closed in a way that doesn't break a frame in half.
                    return Ok(None);
                } else {
                    // The stream is closed mid-frame.
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )
                    .into());
                }
            }
        }
    }
}
