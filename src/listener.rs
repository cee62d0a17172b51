//! Managed pub/sub connection.
//!
//! A [`Listener`] supervises one connection dedicated to subscriptions. The
//! connection reconnects automatically with exponential backoff, and the
//! declared subscription intent is reconciled with the server after every
//! reconnect: pending unsubscribes are applied first, then one batched
//! subscribe covers everything still wanted. The authoritative routing table
//! is owned by the read loop alone, so message dispatch takes no lock.

use crate::client::Config;
use crate::connection::{dial, ReplyReader, WriteHalf};
use crate::handshake;
use crate::parse::Parse;
use crate::request::Request;
use crate::shutdown::Shutdown;

use async_stream::stream;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_stream::Stream;
use tracing::{debug, instrument, warn};

/// Growth guard for the reconnect backoff; delays stop doubling past this.
const BACKOFF_CEILING: Duration = Duration::from_millis(512);

/// One channel's delivery queue: the sending half is used by the read loop,
/// the shared receiving half by every `Subscription` handle for the name.
#[derive(Debug, Clone)]
struct Channel {
    deliver: mpsc::Sender<Bytes>,
    messages: Arc<Mutex<mpsc::Receiver<Bytes>>>,
}

fn channel() -> Channel {
    // Near-rendezvous handoff: a slow consumer stalls the read loop rather
    // than queueing without bound.
    let (deliver, messages) = mpsc::channel(1);
    Channel {
        deliver,
        messages: Arc::new(Mutex::new(messages)),
    }
}

/// Requested subscription state, as declared by callers. The actual
/// server-acknowledged state lives in the read loop.
#[derive(Debug, Default)]
struct Intent {
    /// Tracked channels by name. An entry lives from the first `subscribe`
    /// call until an unsubscribe confirmation, or shutdown, closes it.
    subs: HashMap<String, Channel>,
    /// Names with an unsubscribe requested but not yet confirmed.
    unsubs: HashSet<String>,
}

struct Shared {
    config: Config,
    /// The live connection's write half, if any. Callers take it for
    /// immediate subscribe/unsubscribe sends.
    conn: Mutex<Option<WriteHalf>>,
    intent: StdMutex<Intent>,
    /// Error-report path for caller-side sends. Weak so that the stream
    /// closes when the supervisor, which holds the strong half, exits.
    errs: mpsc::WeakSender<crate::Error>,
}

/// A supervised connection for publish/subscribe.
///
/// The error stream returned by [`Listener::new`] MUST be read continuously
/// until closed: connection failures are reported there, and the listener
/// stalls rather than drop reports when nobody is draining. Broken
/// connections cause automated reconnects. Any number of tasks may use a
/// `Listener` simultaneously.
pub struct Listener {
    shared: Arc<Shared>,
    notify_shutdown: broadcast::Sender<()>,
    supervisor: Option<JoinHandle<()>>,
}

/// A handle on one channel's subscription.
///
/// Handles for the same channel name share one delivery queue; subscribing
/// twice is idempotent, not additive.
#[derive(Clone)]
pub struct Subscription {
    name: String,
    // Only the receiving half: the queue must close once the read loop and
    // the intent map drop their senders, however many handles remain.
    messages: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    shared: Arc<Shared>,
}

impl Listener {
    /// Launches a managed connection.
    ///
    /// No dial has happened yet when this returns; subscription calls made
    /// before the first successful connect are picked up by it.
    pub fn new(config: Config) -> (Listener, mpsc::Receiver<crate::Error>) {
        let (errs, errs_rx) = mpsc::channel(1);
        let (notify_shutdown, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            config,
            conn: Mutex::new(None),
            intent: StdMutex::new(Intent::default()),
            errs: errs.downgrade(),
        });

        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let supervisor = tokio::spawn(supervise(shared.clone(), errs, shutdown));

        let listener = Listener {
            shared,
            notify_shutdown,
            supervisor: Some(supervisor),
        };
        (listener, errs_rx)
    }

    /// Subscribe to `channel`. The listener resubscribes automatically after
    /// connection loss, until [`Subscription::unsubscribe`].
    ///
    /// Subscribing to an already-tracked name returns a handle on the
    /// existing delivery queue rather than a new one.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let queue = {
            let mut intent = self.shared.intent.lock().unwrap();
            match intent.subs.get(channel) {
                Some(existing) => existing.clone(),
                None => {
                    let entry = self::channel();
                    intent.subs.insert(channel.to_string(), entry.clone());
                    entry
                }
            }
        };

        // Immediate wire send when connected; otherwise the name is picked
        // up by the batched subscribe on the next successful connect.
        let mut req = Request::new("*2\r\n$9\r\nSUBSCRIBE\r\n");
        req.add_bytes(channel.as_bytes());
        submit(&self.shared, req).await;

        Subscription {
            name: channel.to_string(),
            messages: queue.messages,
            shared: self.shared.clone(),
        }
    }

    /// Terminates connection management.
    ///
    /// Every remaining delivery queue and the error stream are closed before
    /// this returns. Repeated calls are no-ops.
    #[instrument(skip(self))]
    pub async fn close(&mut self) {
        // No audience for the signal just means the supervisor already left.
        let _ = self.notify_shutdown.send(());

        // Close the live connection, if any.
        *self.shared.conn.lock().await = None;

        // await shutdown
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }
}

impl Subscription {
    /// The channel name this subscription is for.
    pub fn channel(&self) -> &str {
        &self.name
    }

    /// Receive the next message published on the channel, waiting if
    /// necessary.
    ///
    /// Messages for one channel arrive in server emission order; nothing is
    /// guaranteed across channel names or across a reconnect. `None` means
    /// the unsubscribe was confirmed or the listener shut down; messages
    /// already queued are still delivered first.
    pub async fn recv(&self) -> Option<Bytes> {
        self.messages.lock().await.recv().await
    }

    /// Convert the subscription into a `Stream` yielding published messages.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> {
        stream! {
            while let Some(message) = self.recv().await {
                yield message;
            }
        }
    }

    /// Request unsubscription.
    ///
    /// The delivery queue closes only on server confirmation or listener
    /// shutdown, never eagerly. An unsubscribe requested while disconnected
    /// wins over the automatic resubscribe: the name is not resubscribed on
    /// the next connect and its queue closes then.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub async fn unsubscribe(&self) {
        self.shared
            .intent
            .lock()
            .unwrap()
            .unsubs
            .insert(self.name.clone());

        let mut req = Request::new("*2\r\n$11\r\nUNSUBSCRIBE\r\n");
        req.add_bytes(self.name.as_bytes());
        submit(&self.shared, req).await;
    }
}

/// Either sends a request on the live connection, or causes a reconnect.
///
/// A no-op while disconnected: reconciliation replays intent on connect.
async fn submit(shared: &Shared, req: Request) {
    let mut conn = shared.conn.lock().await;
    let writer = match conn.as_mut() {
        Some(writer) => writer,
        None => return,
    };

    let write = async {
        writer.write_all(req.bytes()).await?;
        writer.flush().await
    };
    let result: crate::Result<()> = match shared.config.command_timeout {
        Some(limit) => match time::timeout(limit, write).await {
            Ok(res) => res.map_err(crate::Error::from),
            Err(_) => Err(crate::Error::Timeout),
        },
        None => write.await.map_err(crate::Error::from),
    };

    if let Err(err) = result {
        // Dropping the write half closes the connection; the read loop
        // notices and drives the reconnect.
        *conn = None;
        drop(conn);

        if let Some(errs) = shared.errs.upgrade() {
            let _ = errs.send(err).await;
        }
    }
}

/// `next = 2×prev + 1ms`, with growth stopped past the ceiling.
fn next_backoff(prev: Duration) -> Duration {
    if prev < BACKOFF_CEILING {
        prev * 2 + Duration::from_millis(1)
    } else {
        prev
    }
}

/// Reports `err` on the error stream, giving up if shutdown arrives while
/// nobody is draining.
async fn report(
    errs: &mpsc::Sender<crate::Error>,
    shutdown: &mut Shutdown,
    err: crate::Error,
) {
    tokio::select! {
        _ = errs.send(err) => {}
        _ = shutdown.recv() => {}
    }
}

/// The connect loop: dial, bootstrap, reconcile, deliver, repeat.
async fn supervise(shared: Arc<Shared>, errs: mpsc::Sender<crate::Error>, mut shutdown: Shutdown) {
    let mut backoff = Duration::ZERO;

    while !shutdown.is_shutdown() {
        let dialed = tokio::select! {
            res = dial(&shared.config.addr, shared.config.connect_timeout) => res,
            _ = shutdown.recv() => break,
        };

        // Dial and bootstrap failures share one path: report, hold off for
        // the backoff interval, retry.
        let established = match dialed {
            Ok((read, mut write)) => {
                let mut reader = ReplyReader::new(read);
                match bootstrap(&shared.config, &mut write, &mut reader).await {
                    Ok(()) => Some((reader, write)),
                    Err(err) => {
                        warn!(%err, "connection bootstrap failed");
                        report(&errs, &mut shutdown, err).await;
                        None
                    }
                }
            }
            Err(err) => {
                warn!(%err, "connect failed");
                report(&errs, &mut shutdown, err).await;
                None
            }
        };

        let (mut reader, write) = match established {
            Some(halves) => halves,
            None => {
                if shutdown.is_shutdown() {
                    break;
                }
                // closed loop protection
                tokio::select! {
                    _ = time::sleep(backoff) => {}
                    _ = shutdown.recv() => break,
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::ZERO; // reset

        // Install the connection, unless a close raced the dial.
        {
            let mut conn = shared.conn.lock().await;
            if shutdown.check() {
                break; // discard the connection
            }
            *conn = Some(write);
        }

        // Reconciliation. Pending unsubscribes win: a name unsubscribed
        // while disconnected is never resubscribed, and its queue closes
        // here (dropping the sender closes it once drained).
        let resubscribe: Vec<String> = {
            let mut intent = shared.intent.lock().unwrap();
            let Intent { subs, unsubs } = &mut *intent;
            for name in unsubs.drain() {
                subs.remove(&name);
            }
            subs.keys().cloned().collect()
        };
        if !resubscribe.is_empty() {
            debug!(channels = resubscribe.len(), "resubscribing");
            let mut req = Request::multi(1 + resubscribe.len(), "SUBSCRIBE");
            for name in &resubscribe {
                req.add_bytes(name.as_bytes());
            }
            submit(&shared, req).await;
        }

        let err = receive(&shared, &mut reader, &mut shutdown).await;

        *shared.conn.lock().await = None;

        if !shutdown.check() {
            warn!(%err, "connection lost");
            report(&errs, &mut shutdown, err).await;
        }
    }

    // Shutdown sequence: close the live connection, every remaining delivery
    // queue, and, by letting `errs` drop on return, the error stream.
    *shared.conn.lock().await = None;
    let mut intent = shared.intent.lock().unwrap();
    intent.subs.clear();
    intent.unsubs.clear();
}

/// The bootstrap handshakes performed after every successful dial.
async fn bootstrap(
    config: &Config,
    write: &mut WriteHalf,
    reader: &mut ReplyReader,
) -> crate::Result<()> {
    if let Some(password) = &config.password {
        handshake::authenticate(password, write, reader, config.command_timeout).await?;
    }
    handshake::select_database(config.db, write, reader, config.command_timeout).await
}

/// Decodes push frames and dispatches until the connection fails.
///
/// The confirmed routing table is owned here, by the one task that decodes
/// incoming frames: the message hot path is lock free, and the table is
/// rebuilt empty on every reconnect. Until the server echoes a `subscribe`
/// confirmation for a name, its messages are dropped — mirroring the
/// server's own lack of sequencing guarantees across a reconnect.
async fn receive(
    shared: &Shared,
    reader: &mut ReplyReader,
    shutdown: &mut Shutdown,
) -> crate::Error {
    let mut confirmed: HashMap<String, mpsc::Sender<Bytes>> = HashMap::new();

    loop {
        let frame = tokio::select! {
            res = reader.read_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return IoError::new(ErrorKind::ConnectionReset, "connection reset by server")
                        .into()
                }
                Err(err) => return err,
            },
            _ = shutdown.recv() => return crate::Error::Closed,
        };

        let (kind, name, payload) = match decode_push(frame) {
            Ok(push) => push,
            Err(err) => return err,
        };

        match kind.as_str() {
            "message" => match confirmed.get(&name) {
                Some(deliver) => {
                    // Blocking handoff. A slow consumer stalls this entire
                    // read loop; only shutdown interrupts the wait.
                    tokio::select! {
                        res = deliver.send(payload) => drop(res),
                        _ = shutdown.recv() => return crate::Error::Closed,
                    }
                }
                None => {
                    debug!(channel = %name, "message without confirmed subscription dropped");
                }
            },
            "subscribe" => {
                if !confirmed.contains_key(&name) {
                    let intent = shared.intent.lock().unwrap();
                    if let Some(entry) = intent.subs.get(&name) {
                        confirmed.insert(name, entry.deliver.clone());
                    }
                }
            }
            "unsubscribe" => {
                confirmed.remove(&name);

                let mut intent = shared.intent.lock().unwrap();
                intent.unsubs.remove(&name);
                // Dropping the sender closes the delivery queue once any
                // queued messages have been drained.
                intent.subs.remove(&name);
            }
            other => {
                return crate::Error::Protocol(format!("unknown push frame kind `{}`", other))
            }
        }
    }
}

/// Decodes a 3-element push array `{kind, name, payload}`. Subscription
/// confirmations carry the server's subscription count as payload; only the
/// message payload itself is of interest.
fn decode_push(frame: crate::Frame) -> crate::Result<(String, String, Bytes)> {
    let mut parse = Parse::new(frame)?;
    let kind = parse.next_string()?;
    let name = parse.next_string()?;
    let payload = match kind.as_str() {
        "message" => parse.next_bytes()?,
        _ => {
            parse.next_int()?;
            Bytes::new()
        }
    };
    parse.finish()?;
    Ok((kind, name, payload))
}
