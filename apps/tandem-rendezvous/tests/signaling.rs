use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_rendezvous::telemetry::detached_metrics_handle;
use tandem_rendezvous::{router, serve, AppState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(AppState::new(detached_metrics_handle()), None);
    tokio::spawn(async move {
        serve(listener, app, async {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();
    });
    Server {
        addr,
        _shutdown: shutdown_tx,
    }
}

async fn connect(server: &Server) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, text: &str) {
    socket.send(Message::Text(text.to_string())).await.unwrap();
}

async fn recv(socket: &mut Socket) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket ended")
            .unwrap();
        match message {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(100), socket.next()).await
    {
        panic!("unexpected frame {text}");
    }
}

/// Joins and round-trips a ping so the join is known to be processed.
async fn join(socket: &mut Socket) {
    send(socket, r#"{"msgType":"join"}"#).await;
    send(socket, r#""ping""#).await;
}

async fn expect_pong(socket: &mut Socket) {
    assert_eq!(recv(socket).await, r#""pong""#);
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn ping_gets_pong_before_join() {
    let server = start_server().await;
    let mut socket = connect(&server).await;
    send(&mut socket, r#""ping""#).await;
    expect_pong(&mut socket).await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn second_peer_is_introduced_with_roles() {
    let server = start_server().await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;

    join(&mut a).await;
    expect_pong(&mut a).await;
    assert_silent(&mut a).await;

    join(&mut b).await;
    assert_eq!(
        recv(&mut b).await,
        r#"{"msgType":"greet","remotePeerId":0,"polite":false}"#
    );
    expect_pong(&mut b).await;
    assert_eq!(
        recv(&mut a).await,
        r#"{"msgType":"greet","remotePeerId":1,"polite":true}"#
    );
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn relay_is_transparent_and_origin_is_verified() {
    let server = start_server().await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    let mut c = connect(&server).await;
    for socket in [&mut a, &mut b, &mut c] {
        join(socket).await;
        loop {
            if recv(socket).await == r#""pong""# {
                break;
            }
        }
    }
    // Drain greets for later joiners.
    assert!(recv(&mut a).await.contains("greet"));
    assert!(recv(&mut a).await.contains("greet"));
    assert!(recv(&mut b).await.contains("greet"));

    // C (id 2) addresses B (id 1). The payload keeps its bytes and key order.
    send(
        &mut c,
        r#"{"msgType":"sessionDescription","remotePeerId":1,"data":{"sdp":"v=0\r\n","type":"offer","zeta":null}}"#,
    )
    .await;
    assert_eq!(
        recv(&mut b).await,
        r#"{"msgType":"sessionDescription","remotePeerId":2,"data":{"sdp":"v=0\r\n","type":"offer","zeta":null}}"#
    );

    send(
        &mut c,
        r#"{"msgType":"iceCandidate","remotePeerId":0,"data":null}"#,
    )
    .await;
    assert_eq!(
        recv(&mut a).await,
        r#"{"msgType":"iceCandidate","remotePeerId":2,"data":null}"#
    );

    // Relays to self or to unknown ids go nowhere.
    send(
        &mut c,
        r#"{"msgType":"iceCandidate","remotePeerId":2,"data":null}"#,
    )
    .await;
    send(
        &mut c,
        r#"{"msgType":"iceCandidate","remotePeerId":77,"data":null}"#,
    )
    .await;
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
    assert_silent(&mut c).await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn dropped_transport_is_announced_as_left() {
    let server = start_server().await;
    let mut d = connect(&server).await;
    let mut c = connect(&server).await;
    join(&mut d).await;
    expect_pong(&mut d).await;
    join(&mut c).await;
    assert!(recv(&mut c).await.contains("greet"));
    expect_pong(&mut c).await;
    assert!(recv(&mut d).await.contains("greet"));

    // C is mid-offer when its transport goes away.
    send(
        &mut c,
        r#"{"msgType":"sessionDescription","remotePeerId":0,"data":{"type":"offer","sdp":""}}"#,
    )
    .await;
    drop(c);

    assert!(recv(&mut d).await.contains("sessionDescription"));
    assert_eq!(
        recv(&mut d).await,
        r#"{"msgType":"left","remotePeerId":1}"#
    );
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn explicit_leave_and_rejoin_gets_fresh_id() {
    let server = start_server().await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    join(&mut a).await;
    expect_pong(&mut a).await;
    join(&mut b).await;
    recv(&mut b).await;
    expect_pong(&mut b).await;
    recv(&mut a).await;

    send(&mut b, r#"{"msgType":"leave"}"#).await;
    assert_eq!(recv(&mut a).await, r#"{"msgType":"left","remotePeerId":1}"#);

    join(&mut b).await;
    assert_eq!(
        recv(&mut b).await,
        r#"{"msgType":"greet","remotePeerId":0,"polite":false}"#
    );
    assert_eq!(
        recv(&mut a).await,
        r#"{"msgType":"greet","remotePeerId":2,"polite":true}"#
    );
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn malformed_frames_do_not_break_the_connection() {
    let server = start_server().await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    join(&mut a).await;
    expect_pong(&mut a).await;

    send(&mut b, "not json").await;
    send(&mut b, r#"{"msgType":"teleport"}"#).await;
    send(&mut b, r#""hello""#).await;
    b.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
    join(&mut b).await;
    // A second join on the same transport is rejected.
    send(&mut b, r#"{"msgType":"join"}"#).await;

    assert!(recv(&mut b).await.contains("greet"));
    expect_pong(&mut b).await;
    assert_eq!(
        recv(&mut a).await,
        r#"{"msgType":"greet","remotePeerId":1,"polite":true}"#
    );
    assert_silent(&mut a).await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn healthz_reports_peer_count() {
    let server = start_server().await;
    let mut a = connect(&server).await;
    join(&mut a).await;
    expect_pong(&mut a).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""peers":1"#));
    assert!(response.contains(r#""status":"ok""#));
}
