//! A scripted in-process server for integration tests.
//!
//! Speaks just enough of the wire protocol to exercise the client and the
//! listener: it decodes array-of-bulk-strings requests, answers the bootstrap
//! and a handful of commands, confirms subscriptions, and lets tests inject
//! push frames or sever the connection.

#![allow(dead_code)] // each test binary uses its own subset

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};

pub struct FakeServer {
    pub addr: String,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

/// Handle on one accepted connection.
pub struct ServerConn {
    log: Arc<Mutex<Vec<Vec<String>>>>,
    push: mpsc::UnboundedSender<Vec<u8>>,
    kill: Option<oneshot::Sender<()>>,
}

impl FakeServer {
    pub async fn spawn() -> FakeServer {
        FakeServer::spawn_with(true).await
    }

    /// With `confirm_unsubscribe` false the server stays silent on
    /// UNSUBSCRIBE, leaving the request pending on the client side.
    pub async fn spawn_with(confirm_unsubscribe: bool) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };

                let log = Arc::new(Mutex::new(Vec::new()));
                let (push_tx, push_rx) = mpsc::unbounded_channel();
                let (kill_tx, kill_rx) = oneshot::channel();

                tokio::spawn(run_conn(
                    stream,
                    log.clone(),
                    push_rx,
                    kill_rx,
                    confirm_unsubscribe,
                ));

                let conn = ServerConn {
                    log,
                    push: push_tx,
                    kill: Some(kill_tx),
                };
                if conns_tx.send(conn).is_err() {
                    return;
                }
            }
        });

        FakeServer {
            addr,
            conns: conns_rx,
        }
    }

    /// The next accepted connection.
    pub async fn next_conn(&mut self) -> ServerConn {
        self.conns.recv().await.expect("server task gone")
    }
}

impl ServerConn {
    /// Every request decoded on this connection so far.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    /// Waits until a request with the given keyword has been decoded.
    pub async fn wait_for(&self, keyword: &str) -> Vec<String> {
        for _ in 0..250 {
            let hit = self
                .commands()
                .into_iter()
                .find(|cmd| cmd[0].eq_ignore_ascii_case(keyword));
            if let Some(cmd) = hit {
                return cmd;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no `{}` request arrived", keyword);
    }

    /// Injects a `message` push frame.
    pub fn publish(&self, channel: &str, payload: &[u8]) {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"*3\r\n$7\r\nmessage\r\n");
        frame.extend_from_slice(format!("${}\r\n{}\r\n", channel.len(), channel).as_bytes());
        frame.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        let _ = self.push.send(frame);
    }

    /// Severs the connection.
    pub fn disconnect(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn run_conn(
    stream: TcpStream,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    mut push: mpsc::UnboundedReceiver<Vec<u8>>,
    kill: oneshot::Receiver<()>,
    confirm_unsubscribe: bool,
) {
    let (read, write) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write));

    let reply_writer = writer.clone();
    let requests = tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut store: HashMap<String, String> = HashMap::new();

        loop {
            let cmd = match read_command(&mut reader).await {
                Ok(cmd) => cmd,
                Err(_) => return,
            };

            let reply = respond(&cmd, &mut store, confirm_unsubscribe);
            if !reply.is_empty()
                && reply_writer.lock().await.write_all(&reply).await.is_err()
            {
                return;
            }

            // Logged only once the reply is on the wire, so tests polling the
            // log can rely on reply-before-push ordering.
            log.lock().unwrap().push(cmd);
        }
    });

    let pusher = async {
        while let Some(frame) = push.recv().await {
            if writer.lock().await.write_all(&frame).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = kill => {}
        _ = pusher => {}
    }

    // Dropping both halves closes the socket.
    requests.abort();
}

fn respond(cmd: &[String], store: &mut HashMap<String, String>, confirm_unsubscribe: bool) -> Vec<u8> {
    match cmd[0].to_uppercase().as_str() {
        "AUTH" | "SELECT" => b"+OK\r\n".to_vec(),
        "SET" => {
            store.insert(cmd[1].clone(), cmd[2].clone());
            b"+OK\r\n".to_vec()
        }
        "GET" => match store.get(&cmd[1]) {
            Some(value) => format!("${}\r\n{}\r\n", value.len(), value).into_bytes(),
            None => b"$-1\r\n".to_vec(),
        },
        "DEL" => {
            let removed = store.remove(&cmd[1]).is_some();
            format!(":{}\r\n", removed as i32).into_bytes()
        }
        "INCR" => {
            let value = store.entry(cmd[1].clone()).or_insert_with(|| "0".to_string());
            let next = value.parse::<i64>().unwrap() + 1;
            *value = next.to_string();
            format!(":{}\r\n", next).into_bytes()
        }
        "PUBLISH" => b":0\r\n".to_vec(),
        "SUBSCRIBE" => cmd[1..]
            .iter()
            .map(|name| format!("*3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:1\r\n", name.len(), name))
            .collect::<String>()
            .into_bytes(),
        "UNSUBSCRIBE" if confirm_unsubscribe => cmd[1..]
            .iter()
            .map(|name| {
                format!(
                    "*3\r\n$11\r\nunsubscribe\r\n${}\r\n{}\r\n:0\r\n",
                    name.len(),
                    name
                )
            })
            .collect::<String>()
            .into_bytes(),
        "UNSUBSCRIBE" => Vec::new(),
        _ => b"-ERR unknown command\r\n".to_vec(),
    }
}

/// Decodes one array-of-bulk-strings request.
async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Vec<String>> {
    let header = read_line(reader).await?;
    let argc: usize = header
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, header.clone()))?;

    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let len_line = read_line(reader).await?;
        let len: usize = len_line
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, len_line.clone()))?;

        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8(data).expect("test payloads are utf-8"));
    }

    Ok(args)
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<String> {
    let mut line = Vec::new();
    if 0 == reader.read_until(b'\n', &mut line).await? {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| io::ErrorKind::InvalidData.into())
}
