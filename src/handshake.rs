//! Connection bootstrap: the credential and database-selection exchanges
//! performed before any application traffic.

use crate::connection::{ReplyReader, WriteHalf};
use crate::frame::Frame;
use crate::request::Request;

use tokio::io::AsyncWriteExt;
use tokio::time::{self, Duration};
use tracing::debug;

/// Performs the `AUTH` exchange.
pub(crate) async fn authenticate(
    password: &str,
    writer: &mut WriteHalf,
    reader: &mut ReplyReader,
    command_timeout: Option<Duration>,
) -> crate::Result<()> {
    let mut req = Request::new("*2\r\n$4\r\nAUTH\r\n");
    req.add_bytes(password.as_bytes());
    exchange_ok(req, writer, reader, command_timeout).await
}

/// Performs the `SELECT` exchange, switching the connection to database `db`.
pub(crate) async fn select_database(
    db: i64,
    writer: &mut WriteHalf,
    reader: &mut ReplyReader,
    command_timeout: Option<Duration>,
) -> crate::Result<()> {
    let mut req = Request::new("*2\r\n$6\r\nSELECT\r\n");
    req.add_int(db);
    exchange_ok(req, writer, reader, command_timeout).await
}

/// Sends `req` and expects a `+OK` reply, bounded by `command_timeout` when
/// one is configured.
async fn exchange_ok(
    req: Request,
    writer: &mut WriteHalf,
    reader: &mut ReplyReader,
    command_timeout: Option<Duration>,
) -> crate::Result<()> {
    let exchange = async {
        writer.write_all(req.bytes()).await?;
        writer.flush().await?;

        let response = reader.read_frame().await?;

        debug!(?response, "bootstrap reply");

        match response {
            Some(Frame::Simple(s)) if s == "OK" => Ok(()),
            Some(Frame::Error(msg)) => Err(crate::Error::Server(msg)),
            Some(frame) => Err(frame.to_error()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by server",
            )
            .into()),
        }
    };

    match command_timeout {
        Some(limit) => time::timeout(limit, exchange)
            .await
            .map_err(|_| crate::Error::Timeout)?,
        None => exchange.await,
    }
}
