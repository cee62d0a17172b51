mod support;

use support::FakeServer;

use redlink::{Config, Error, Listener};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn setup() {
    // Errors if a subscriber is already installed; only the first test wins.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// The error stream must be drained continuously or the listener stalls.
fn drain(mut errs: mpsc::Receiver<Error>) {
    tokio::spawn(async move { while errs.recv().await.is_some() {} });
}

#[tokio::test]
async fn subscribe_delivers_published_messages() {
    setup();
    let mut server = FakeServer::spawn().await;
    let (mut listener, errs) = Listener::new(Config::new(server.addr.as_str()));
    drain(errs);

    let sub = listener.subscribe("news").await;

    let conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;

    conn.publish("news", b"hello");
    let message = sub.recv().await.unwrap();
    assert_eq!(&message[..], b"hello");

    listener.close().await;
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn subscribe_twice_shares_one_delivery_queue() {
    setup();
    let mut server = FakeServer::spawn().await;
    let (mut listener, errs) = Listener::new(Config::new(server.addr.as_str()));
    drain(errs);

    let first = listener.subscribe("x").await;
    let second = listener.subscribe("x").await;

    let conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;

    // Both handles drain the same queue: each message arrives exactly once.
    conn.publish("x", b"one");
    assert_eq!(&first.recv().await.unwrap()[..], b"one");
    conn.publish("x", b"two");
    assert_eq!(&second.recv().await.unwrap()[..], b"two");

    listener.close().await;
}

#[tokio::test]
async fn resubscribes_after_reconnect() {
    setup();
    let mut server = FakeServer::spawn().await;
    let (mut listener, errs) = Listener::new(Config::new(server.addr.as_str()));
    drain(errs);

    let sub = listener.subscribe("news").await;

    let mut conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;
    conn.publish("news", b"before");
    assert_eq!(&sub.recv().await.unwrap()[..], b"before");

    conn.disconnect();

    // The supervisor redials and replays the subscription on its own.
    let conn = server.next_conn().await;
    let resubscribe = conn.wait_for("SUBSCRIBE").await;
    assert!(resubscribe[1..].contains(&"news".to_string()));

    conn.publish("news", b"after");
    assert_eq!(&sub.recv().await.unwrap()[..], b"after");

    listener.close().await;
}

#[tokio::test]
async fn pending_unsubscribe_wins_over_resubscribe() {
    setup();
    // The server never confirms unsubscribes, so the request is still
    // pending when the connection drops.
    let mut server = FakeServer::spawn_with(false).await;
    let (mut listener, errs) = Listener::new(Config::new(server.addr.as_str()));
    drain(errs);

    let sub = listener.subscribe("news").await;

    let mut conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;

    sub.unsubscribe().await;
    conn.wait_for("UNSUBSCRIBE").await;
    conn.disconnect();

    // Reconciliation applies the pending unsubscribe before resubscribing:
    // the delivery queue closes and the name is not resubscribed.
    let conn = server.next_conn().await;
    conn.wait_for("SELECT").await;

    assert!(sub.recv().await.is_none());
    assert!(!conn
        .commands()
        .iter()
        .any(|cmd| cmd[0].eq_ignore_ascii_case("subscribe")));

    listener.close().await;
}

#[tokio::test]
async fn confirmed_unsubscribe_closes_the_queue() {
    setup();
    let mut server = FakeServer::spawn().await;
    let (mut listener, errs) = Listener::new(Config::new(server.addr.as_str()));
    drain(errs);

    let sub = listener.subscribe("news").await;
    let conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;

    conn.publish("news", b"last");
    assert_eq!(&sub.recv().await.unwrap()[..], b"last");

    sub.unsubscribe().await;
    assert!(sub.recv().await.is_none());

    listener.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_closes_streams() {
    setup();
    let mut server = FakeServer::spawn().await;
    let (mut listener, mut errs) = Listener::new(Config::new(server.addr.as_str()));

    let sub = listener.subscribe("news").await;
    let conn = server.next_conn().await;
    conn.wait_for("SUBSCRIBE").await;

    listener.close().await;
    listener.close().await;

    // Both the error stream and every delivery queue are closed by now.
    assert!(errs.recv().await.is_none());
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn dial_failures_are_reported_and_retried() {
    setup();
    // An address nobody listens on.
    let addr = {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        unused.local_addr().unwrap().to_string()
    };

    let (mut listener, mut errs) = Listener::new(Config::new(addr));

    // One report per attempt; more than one proves the retry loop runs.
    assert!(errs.recv().await.is_some());
    assert!(errs.recv().await.is_some());

    listener.close().await;
    assert!(errs.recv().await.is_none());
}
