//! Pipelined client implementation.
//!
//! A [`Client`] owns one connection. Concurrent callers serialize on a write
//! slot, a pending-response slot is queued per sent frame, and a dedicated
//! reader task resolves the queue head with each decoded reply. Because the
//! pending slot is enqueued before the write slot is released, queue order
//! always matches wire send order.

use crate::connection::{dial, ReplyReader, WriteHalf};
use crate::frame::Frame;
use crate::handshake;
use crate::request::Request;

use bytes::Bytes;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::debug;

/// Client settings.
///
/// Only the address is required. `db` 0 is the server default; a `None`
/// command timeout means writes and bootstrap exchanges are unbounded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server address: `host:port`, or a `/`-prefixed unix socket path.
    pub addr: String,
    /// Password for the `AUTH` exchange, if the server requires one.
    pub password: Option<String>,
    /// Database index selected before any application traffic.
    pub db: i64,
    /// Bound on connection establishment.
    pub connect_timeout: Duration,
    /// Bound on each frame write and bootstrap exchange.
    pub command_timeout: Option<Duration>,
}

impl Config {
    pub fn new(addr: impl Into<String>) -> Config {
        Config {
            addr: addr.into(),
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
            command_timeout: None,
        }
    }
}

/// A pending-response slot: resolved exactly once by the reader task,
/// consumed exactly once by the caller that sent the frame.
type Pending = oneshot::Sender<crate::Result<Frame>>;

/// Holder of the live connection's write half.
///
/// `Down` is terminal: it is installed in place of `Live` on the first write
/// or read failure and every later acquirer observes the stored error.
enum WriteSlot {
    Live(WriteHalf),
    Down(crate::Error),
}

struct Shared {
    /// Exclusive right to write the next frame.
    writer: Mutex<WriteSlot>,
    /// FIFO of pending-response slots, consumed by the reader task.
    queue: mpsc::UnboundedSender<Pending>,
    command_timeout: Option<Duration>,
}

/// Established connection with the server.
///
/// Commands take `&self`: any number of tasks may issue commands on one
/// `Client` concurrently and each caller receives the response to its own
/// frame. A transport or protocol failure is terminal for the `Client`;
/// recovery means connecting a new one.
pub struct Client {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    config: Config,
}

impl Client {
    /// Establish a connection using `config`, performing the bootstrap
    /// exchanges before any application traffic.
    pub async fn connect(config: Config) -> crate::Result<Client> {
        let (read, mut write) = dial(&config.addr, config.connect_timeout).await?;
        let mut reader = ReplyReader::new(read);

        if let Some(password) = &config.password {
            handshake::authenticate(password, &mut write, &mut reader, config.command_timeout)
                .await?;
        }
        handshake::select_database(config.db, &mut write, &mut reader, config.command_timeout)
            .await?;

        Ok(Client::start(reader, write, config))
    }

    /// Assembles a client around an established, bootstrapped connection and
    /// spawns its reader task.
    pub(crate) fn start(reader: ReplyReader, writer: WriteHalf, config: Config) -> Client {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            writer: Mutex::new(WriteSlot::Live(writer)),
            queue: queue_tx,
            command_timeout: config.command_timeout,
        });

        let reader = tokio::spawn(run_reader(reader, queue_rx, shared.clone()));

        Client {
            shared,
            reader,
            config,
        }
    }

    /// Launch a managed pub/sub connection with this client's settings.
    ///
    /// The listener dials its own connection; it shares nothing with `self`
    /// and outlives it if not closed.
    pub fn new_listener(&self) -> (crate::Listener, mpsc::Receiver<crate::Error>) {
        crate::Listener::new(self.config.clone())
    }

    /// Get the value of `key`.
    ///
    /// The return is `None` if the key does not exist.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new("*2\r\n$3\r\nGET\r\n");
        req.add_bytes(key.as_ref());
        self.command_bulk(req).await
    }

    /// Set `key` to hold `value`.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> crate::Result<()> {
        let mut req = Request::new("*3\r\n$3\r\nSET\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(value.as_ref());
        self.command_ok(req).await
    }

    /// Remove `key`. The return tells whether the key existed.
    pub async fn del(&self, key: impl AsRef<[u8]>) -> crate::Result<bool> {
        let mut req = Request::new("*2\r\n$3\r\nDEL\r\n");
        req.add_bytes(key.as_ref());
        Ok(self.command_int(req).await? != 0)
    }

    /// Increment the integer stored at `key` by one and return the new value.
    pub async fn incr(&self, key: impl AsRef<[u8]>) -> crate::Result<i64> {
        let mut req = Request::new("*2\r\n$4\r\nINCR\r\n");
        req.add_bytes(key.as_ref());
        self.command_int(req).await
    }

    /// Increment the integer stored at `key` by `delta` and return the new value.
    pub async fn incrby(&self, key: impl AsRef<[u8]>, delta: i64) -> crate::Result<i64> {
        let mut req = Request::new("*3\r\n$6\r\nINCRBY\r\n");
        req.add_bytes(key.as_ref());
        req.add_int(delta);
        self.command_int(req).await
    }

    /// Append `value` to the string stored at `key` and return the new length.
    pub async fn append(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> crate::Result<i64> {
        let mut req = Request::new("*3\r\n$6\r\nAPPEND\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(value.as_ref());
        self.command_int(req).await
    }

    /// The length of the list stored at `key`, 0 if the key does not exist.
    pub async fn llen(&self, key: impl AsRef<[u8]>) -> crate::Result<i64> {
        let mut req = Request::new("*2\r\n$4\r\nLLEN\r\n");
        req.add_bytes(key.as_ref());
        self.command_int(req).await
    }

    /// The list element at `index`.
    ///
    /// The return is `None` if the key does not exist or the index is out of
    /// range.
    pub async fn lindex(&self, key: impl AsRef<[u8]>, index: i64) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new("*3\r\n$6\r\nLINDEX\r\n");
        req.add_bytes(key.as_ref());
        req.add_int(index);
        self.command_bulk(req).await
    }

    /// The list elements between `start` and `stop` inclusive.
    ///
    /// The return is empty if the key does not exist.
    pub async fn lrange(
        &self,
        key: impl AsRef<[u8]>,
        start: i64,
        stop: i64,
    ) -> crate::Result<Vec<Option<Bytes>>> {
        let mut req = Request::new("*4\r\n$6\r\nLRANGE\r\n");
        req.add_bytes(key.as_ref());
        req.add_int(start);
        req.add_int(stop);
        self.command_array(req).await
    }

    /// Remove and return the first list element, `None` if the key does not exist.
    pub async fn lpop(&self, key: impl AsRef<[u8]>) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new("*2\r\n$4\r\nLPOP\r\n");
        req.add_bytes(key.as_ref());
        self.command_bulk(req).await
    }

    /// Remove and return the last list element, `None` if the key does not exist.
    pub async fn rpop(&self, key: impl AsRef<[u8]>) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new("*2\r\n$4\r\nRPOP\r\n");
        req.add_bytes(key.as_ref());
        self.command_bulk(req).await
    }

    /// Trim the list stored at `key` to the elements between `start` and
    /// `stop` inclusive.
    pub async fn ltrim(&self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> crate::Result<()> {
        let mut req = Request::new("*4\r\n$5\r\nLTRIM\r\n");
        req.add_bytes(key.as_ref());
        req.add_int(start);
        req.add_int(stop);
        self.command_ok(req).await
    }

    /// Set the list element at `index` to `value`.
    pub async fn lset(
        &self,
        key: impl AsRef<[u8]>,
        index: i64,
        value: impl AsRef<[u8]>,
    ) -> crate::Result<()> {
        let mut req = Request::new("*4\r\n$4\r\nLSET\r\n");
        req.add_bytes(key.as_ref());
        req.add_int(index);
        req.add_bytes(value.as_ref());
        self.command_ok(req).await
    }

    /// Prepend `value` to the list stored at `key` and return the new length.
    pub async fn lpush(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> crate::Result<i64> {
        let mut req = Request::new("*3\r\n$5\r\nLPUSH\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(value.as_ref());
        self.command_int(req).await
    }

    /// Append `value` to the list stored at `key` and return the new length.
    pub async fn rpush(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> crate::Result<i64> {
        let mut req = Request::new("*3\r\n$5\r\nRPUSH\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(value.as_ref());
        self.command_int(req).await
    }

    /// Get the value of `field` in the hash stored at `key`.
    ///
    /// The return is `None` if the key or field does not exist.
    pub async fn hget(
        &self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
    ) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new("*3\r\n$4\r\nHGET\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(field.as_ref());
        self.command_bulk(req).await
    }

    /// Set `field` in the hash stored at `key` to `value`. The return tells
    /// whether the field was newly created.
    pub async fn hset(
        &self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> crate::Result<bool> {
        let mut req = Request::new("*4\r\n$4\r\nHSET\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(field.as_ref());
        req.add_bytes(value.as_ref());
        Ok(self.command_int(req).await? != 0)
    }

    /// Remove `field` from the hash stored at `key`. The return tells whether
    /// the field existed.
    pub async fn hdel(
        &self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
    ) -> crate::Result<bool> {
        let mut req = Request::new("*3\r\n$4\r\nHDEL\r\n");
        req.add_bytes(key.as_ref());
        req.add_bytes(field.as_ref());
        Ok(self.command_int(req).await? != 0)
    }

    /// Post `message` to `channel` and return the number of subscribers that
    /// received it.
    pub async fn publish(
        &self,
        channel: impl AsRef<[u8]>,
        message: impl AsRef<[u8]>,
    ) -> crate::Result<i64> {
        let mut req = Request::new("*3\r\n$7\r\nPUBLISH\r\n");
        req.add_bytes(channel.as_ref());
        req.add_bytes(message.as_ref());
        self.command_int(req).await
    }

    /// Expects a `+OK` status reply.
    async fn command_ok(&self, req: Request) -> crate::Result<()> {
        match self.command(req).await? {
            Frame::Simple(s) if s == "OK" => Ok(()),
            frame => Err(frame.to_error()),
        }
    }

    /// Expects an integer reply.
    async fn command_int(&self, req: Request) -> crate::Result<i64> {
        match self.command(req).await? {
            Frame::Integer(v) => Ok(v),
            frame => Err(frame.to_error()),
        }
    }

    /// Expects a bulk reply; the absent marker decodes as `None`.
    async fn command_bulk(&self, req: Request) -> crate::Result<Option<Bytes>> {
        match self.command(req).await? {
            Frame::Bulk(data) => Ok(Some(data)),
            Frame::Null => Ok(None),
            frame => Err(frame.to_error()),
        }
    }

    /// Expects an array of bulk replies; the absent marker decodes as an
    /// empty list, absent elements as `None`.
    async fn command_array(&self, req: Request) -> crate::Result<Vec<Option<Bytes>>> {
        match self.command(req).await? {
            Frame::Array(parts) => parts
                .into_iter()
                .map(|part| match part {
                    Frame::Bulk(data) => Ok(Some(data)),
                    Frame::Null => Ok(None),
                    frame => Err(frame.to_error()),
                })
                .collect(),
            Frame::Null => Ok(Vec::new()),
            frame => Err(frame.to_error()),
        }
    }

    /// Sends one frame and awaits its in-order response.
    async fn command(&self, req: Request) -> crate::Result<Frame> {
        let response = self.send(req).await?;

        // Await resolution by the reader task. A dropped sender means the
        // client was torn down with the response still pending.
        response.await.map_err(|_| crate::Error::Closed)?
    }

    /// Writes `req` under the write slot and enqueues a pending-response
    /// slot, returning the receiving half.
    async fn send(&self, req: Request) -> crate::Result<oneshot::Receiver<crate::Result<Frame>>> {
        // Acquire the write slot, or observe the terminal offline state.
        let mut slot = self.shared.writer.lock().await;
        let writer = match &mut *slot {
            WriteSlot::Live(writer) => writer,
            WriteSlot::Down(err) => return Err(err.clone()),
        };

        let write = async {
            writer.write_all(req.bytes()).await?;
            writer.flush().await
        };
        let result: crate::Result<()> = match self.shared.command_timeout {
            Some(limit) => match time::timeout(limit, write).await {
                Ok(res) => res.map_err(crate::Error::from),
                Err(_) => Err(crate::Error::Timeout),
            },
            None => write.await.map_err(crate::Error::from),
        };

        if let Err(err) = result {
            // Fail-stop: the socket may hold a partial frame, so no frame may
            // ever be written again. The error returns to this caller only;
            // responses to frames already flushed still arrive.
            *slot = WriteSlot::Down(err.clone());
            return Err(err);
        }

        debug!(frame_len = req.bytes().len(), "frame sent");

        // Enqueue while still holding the write slot so that queue order
        // matches wire send order.
        let (resolve, response) = oneshot::channel();
        if self.shared.queue.send(resolve).is_err() {
            // The reader task is gone.
            let err = crate::Error::Closed;
            *slot = WriteSlot::Down(err.clone());
            return Err(err);
        }

        Ok(response)

        // The write slot releases here; `req` recycles its buffer, the write
        // having completed either way.
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Tears down the reader task. Any pending slot resolves with
        // `Error::Closed` through its dropped sender; nobody is left hanging.
        self.reader.abort();
    }
}

/// Decodes the reply stream and resolves pending-response slots positionally.
async fn run_reader(
    mut reader: ReplyReader,
    mut queue: mpsc::UnboundedReceiver<Pending>,
    shared: Arc<Shared>,
) {
    let err = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                debug!(?frame, "reply received");

                // An error reply resolves the one caller it belongs to; the
                // connection stays healthy.
                let resolved = match frame {
                    Frame::Error(msg) => Err(crate::Error::Server(msg)),
                    frame => Ok(frame),
                };

                // The matching slot is enqueued before the write slot is
                // released, so it either is queued already or arrives while
                // this recv waits.
                match queue.recv().await {
                    Some(pending) => {
                        // The caller may have abandoned its slot; that is its
                        // own business.
                        let _ = pending.send(resolved);
                    }
                    None => return,
                }
            }
            Ok(None) => {
                break crate::Error::from(IoError::new(
                    ErrorKind::ConnectionReset,
                    "connection reset by server",
                ))
            }
            Err(err) => break err,
        }
    };

    // The positional framing is unrecoverable. Take the connection offline,
    // then resolve every queued slot with the error.
    {
        let mut slot = shared.writer.lock().await;
        if matches!(&*slot, WriteSlot::Live(_)) {
            *slot = WriteSlot::Down(err.clone());
        }
    }

    queue.close();
    while let Some(pending) = queue.recv().await {
        let _ = pending.send(Err(err.clone()));
    }
}
