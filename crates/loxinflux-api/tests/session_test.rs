#![allow(clippy::unwrap_used)]
// Integration tests for the Miniserver session against an in-process fake.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loxinflux_api::protocol::{LoxUuid, MessageHeader, MessageKind};
use loxinflux_api::{
    Credentials, Error, PollTarget, Provenance, ReconnectConfig, RecordValue, SessionConfig,
    SessionHandle, SessionRequest, SessionState,
};

// ── Helpers ─────────────────────────────────────────────────────────

const DEVICE: &str = "0f1e2d3c-0123-4567-ffff8899aabbccdd";

fn public_key_pem() -> String {
    let mut rng = StdRng::seed_from_u64(42);
    let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let body: String = pem.lines().filter(|l| !l.starts_with("-----")).collect();
    format!("-----BEGIN CERTIFICATE-----{body}-----END CERTIFICATE-----")
}

fn credentials() -> Credentials {
    Credentials {
        user: "admin".into(),
        password: "secret".into(),
        visu_password: None,
    }
}

fn ll(control: &str, value: serde_json::Value, code: u16) -> String {
    json!({ "LL": { "control": control, "value": value, "Code": code.to_string() } }).to_string()
}

#[derive(Clone, Copy)]
enum Script {
    Accept,
    RejectToken,
}

/// Serves `getPublicKey` over HTTP and the event stream over WebSocket on
/// the same port, the way a Miniserver does.
async fn fake_miniserver(script: Script) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pem = public_key_pem();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let pem = pem.clone();
            tokio::spawn(async move {
                if is_public_key_request(&stream).await {
                    serve_public_key(stream, &pem).await;
                } else {
                    serve_websocket(stream, script).await;
                }
            });
        }
    });

    Url::parse(&format!("http://{addr}/")).unwrap()
}

async fn is_public_key_request(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        let n = stream.peek(&mut buf).await.unwrap();
        if n == 0 {
            return false;
        }
        let head = String::from_utf8_lossy(&buf[..n]);
        if head.contains("\r\n") || n == buf.len() {
            return head.contains("getPublicKey");
        }
        tokio::task::yield_now().await;
    }
}

async fn serve_public_key(mut stream: TcpStream, pem: &str) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
    }
    let body = ll("dev/sys/getPublicKey", json!(pem), 200);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
}

async fn serve_websocket(stream: TcpStream, script: Script) {
    let callback = |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        resp.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("remotecontrol"),
        );
        Ok(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let mut encrypted_seen = 0;
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(command) = message else {
            continue;
        };
        let command = command.as_str().to_owned();

        let reply = if command.starts_with("jdev/sys/keyexchange/") {
            Some(ll("dev/sys/keyexchange", json!("ok"), 200))
        } else if command.starts_with("jdev/sys/enc/") {
            encrypted_seen += 1;
            match (encrypted_seen, script) {
                (1, _) => Some(ll(
                    "dev/sys/getkey2/admin",
                    json!({ "key": hex::encode("one-time-key"), "salt": "abcd", "hashAlg": "SHA256" }),
                    200,
                )),
                (2, Script::Accept) => Some(ll(
                    "dev/sys/getjwt",
                    json!({ "token": "tok", "key": "00", "validUntil": 1_000_000_000, "tokenRights": 4, "unsecurePass": false }),
                    200,
                )),
                (2, Script::RejectToken) => Some(ll("dev/sys/getjwt", json!(""), 401)),
                _ => None,
            }
        } else if command == "jdev/sps/enablebinstatusupdate" {
            send_text(&mut ws, &ll("dev/sps/enablebinstatusupdate", json!("1"), 200)).await;
            let uuid: LoxUuid = DEVICE.parse().unwrap();
            let mut table = uuid.to_wire().to_vec();
            table.extend_from_slice(&21.5f64.to_le_bytes());
            send_frame(&mut ws, MessageKind::ValueStates, table).await;
            None
        } else if let Some(rest) = command.strip_prefix("jdev/sps/io/") {
            let uuid = rest.trim_end_matches("/all");
            Some(
                json!({ "LL": {
                    "control": format!("dev/sps/io/{uuid}/all"),
                    "value": "42",
                    "Code": "200",
                    "output0": { "name": "AQ1", "nr": 1, "value": "3.5" },
                    "output1": { "nr": 2, "value": "on" },
                } })
                .to_string(),
            )
        } else if command == "keepalive" {
            send_frame(&mut ws, MessageKind::Keepalive, Vec::new()).await;
            None
        } else {
            None
        };

        if let Some(reply) = reply {
            send_text(&mut ws, &reply).await;
        }
    }
}

type ServerWs = tokio_tungstenite::WebSocketStream<TcpStream>;

async fn send_frame(ws: &mut ServerWs, kind: MessageKind, payload: Vec<u8>) {
    let len = u32::try_from(payload.len()).unwrap();
    ws.send(Message::binary(MessageHeader::encode(kind, len, false).to_vec()))
        .await
        .unwrap();
    if !payload.is_empty() {
        ws.send(Message::binary(payload)).await.unwrap();
    }
}

async fn send_text(ws: &mut ServerWs, text: &str) {
    let len = u32::try_from(text.len()).unwrap();
    ws.send(Message::binary(
        MessageHeader::encode(MessageKind::Text, len, false).to_vec(),
    ))
    .await
    .unwrap();
    ws.send(Message::text(text.to_owned())).await.unwrap();
}

fn session_config(base: Url) -> SessionConfig {
    let mut config = SessionConfig::new(base, credentials());
    config.command_timeout = Duration::from_secs(5);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts: 2,
    };
    config
}

// ── Public key bootstrap ────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_public_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jdev/sys/getPublicKey"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(ll("dev/sys/getPublicKey", json!(public_key_pem()), 200)),
        )
        .mount(&server)
        .await;

    let base = Url::parse(&server.uri()).unwrap();
    let key = loxinflux_api::auth::fetch_public_key(&reqwest::Client::new(), &base).await;
    assert!(key.is_ok(), "expected a public key, got: {key:?}");
}

#[tokio::test]
async fn test_fetch_public_key_garbage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jdev/sys/getPublicKey"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let base = Url::parse(&server.uri()).unwrap();
    let result = loxinflux_api::auth::fetch_public_key(&reqwest::Client::new(), &base).await;
    assert!(
        matches!(result, Err(Error::PublicKey(_))),
        "expected PublicKey error, got: {result:?}"
    );

    // The session keeps retrying instead of giving up on the first answer.
    let (records_tx, _records_rx) = mpsc::channel(16);
    let handle = SessionHandle::spawn(session_config(base), records_tx, CancellationToken::new());
    let result = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .unwrap();
    assert!(
        matches!(result, Err(Error::RetriesExhausted { attempts: 2 })),
        "expected RetriesExhausted, got: {result:?}"
    );
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn test_fetch_public_key_while_rebooting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jdev/sys/getPublicKey"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let base = Url::parse(&server.uri()).unwrap();
    let err = loxinflux_api::auth::fetch_public_key(&reqwest::Client::new(), &base)
        .await
        .unwrap_err();
    assert!(!err.is_fatal(), "{err}");
    assert!(err.is_transient(), "{err}");
}

// ── Session lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_session_streams_push_and_poll_records() {
    let base = fake_miniserver(Script::Accept).await;
    let (records_tx, mut records_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = SessionHandle::spawn(session_config(base), records_tx, cancel.clone());

    let push = tokio::time::timeout(Duration::from_secs(10), records_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(push.uuid, DEVICE);
    assert_eq!(push.value, RecordValue::Number(21.5));
    assert_eq!(push.provenance, Provenance::Push);
    assert_eq!(*handle.state().borrow(), SessionState::Active);

    let requester = handle.requester();
    assert!(
        requester
            .submit(SessionRequest::Poll(vec![PollTarget {
                uuid: DEVICE.into(),
                secured: false,
            }]))
            .await
    );
    let poll = tokio::time::timeout(Duration::from_secs(10), records_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(poll.uuid, DEVICE);
    assert_eq!(poll.value, RecordValue::Number(42.0));
    assert_eq!(poll.provenance, Provenance::Poll);
    assert_eq!(
        poll.outputs,
        vec![
            ("AQ1".to_owned(), RecordValue::Number(3.5)),
            ("2".to_owned(), RecordValue::Text("on".into())),
        ]
    );

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let base = fake_miniserver(Script::RejectToken).await;
    let (records_tx, _records_rx) = mpsc::channel(16);
    let handle = SessionHandle::spawn(session_config(base), records_tx, CancellationToken::new());
    let state = handle.state();

    let result = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .unwrap();
    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
    assert_eq!(*state.borrow(), SessionState::Failed);
}

#[tokio::test]
async fn test_unreachable_miniserver_exhausts_budget() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let base = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
    let (records_tx, _records_rx) = mpsc::channel(16);
    let handle = SessionHandle::spawn(session_config(base), records_tx, CancellationToken::new());

    let result = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .unwrap();
    assert!(
        matches!(result, Err(Error::RetriesExhausted { attempts: 2 })),
        "expected RetriesExhausted, got: {result:?}"
    );
}
