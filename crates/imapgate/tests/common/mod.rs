/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use imapgate::{
    auth::AuthClient,
    core::GateSessionManager,
    listener::Server,
    master::{Handoff, Master},
    registry::Clients,
    ImapGate,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::watch,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_SOCKET: AtomicUsize = AtomicUsize::new(0);

pub struct Options {
    pub disable_plaintext_auth: bool,
    pub max_logging_users: usize,
    pub idle_timeout: Duration,
    pub tls: bool,
    pub start_auth: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            disable_plaintext_auth: true,
            max_logging_users: 0,
            idle_timeout: Duration::from_secs(60),
            tls: false,
            start_auth: true,
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub auth: AuthClient,
    pub auth_path: PathBuf,
    pub clients: Arc<Clients>,
    pub handoffs: Arc<Mutex<Vec<(String, String)>>>,
    _shutdown_tx: watch::Sender<bool>,
}

pub async fn spawn_gateway(opts: Options) -> TestServer {
    let auth_path = std::env::temp_dir().join(format!(
        "imapgate-test-{}-{}.sock",
        std::process::id(),
        NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
    ));
    if opts.start_auth {
        spawn_mock_auth(auth_path.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gate = Arc::new(ImapGate {
        capability_base: "IMAP4rev1".to_string(),
        greeting: "imapgate ready.".to_string(),
        greeting_capability: true,
        verbose_proctitle: false,
        disable_plaintext_auth: opts.disable_plaintext_auth,
    });
    let clients = Clients::new(opts.max_logging_users, opts.idle_timeout);
    clients.clone().spawn_idle_sweep(shutdown_rx.clone());

    let auth = AuthClient::spawn(
        auth_path.clone(),
        Duration::from_secs(150),
        shutdown_rx.clone(),
    );

    let handoffs = Arc::new(Mutex::new(Vec::new()));
    let master: Arc<dyn Master> = Arc::new(RecordingMaster {
        handoffs: handoffs.clone(),
    });

    let acceptor = if opts.tls { Some(self_signed_acceptor()) } else { None };

    let manager = GateSessionManager::new(gate, clients.clone(), auth.clone(), master);
    let addr = Server {
        id: "imap-test".to_string(),
        addr: "127.0.0.1:0".parse().unwrap(),
        is_tls_implicit: false,
    }
    .spawn(acceptor, manager, shutdown_rx.clone())
    .await
    .unwrap();

    let server = TestServer {
        addr,
        auth,
        auth_path,
        clients,
        handoffs,
        _shutdown_tx: shutdown_tx,
    };
    if opts.start_auth {
        server.wait_auth_connected().await;
    }
    server
}

impl TestServer {
    pub async fn wait_auth_connected(&self) {
        let mut connected = self.auth.connected_watch();
        timeout(READ_TIMEOUT, async {
            while !*connected.borrow_and_update() {
                connected.changed().await.unwrap();
            }
        })
        .await
        .expect("auth service did not connect");
    }
}

struct RecordingMaster {
    handoffs: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait::async_trait]
impl Master for RecordingMaster {
    async fn handoff(&self, handoff: Handoff) -> std::io::Result<()> {
        self.handoffs
            .lock()
            .unwrap()
            .push((handoff.user, handoff.mechanism));
        // Dropping the stream closes the client connection, which the tests
        // observe as EOF after the tagged OK.
        Ok(())
    }
}

/// Server side of the auth service protocol, accepting `alice` / `secret`
/// over PLAIN and LOGIN.
pub fn spawn_mock_auth(path: PathBuf) {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_auth(stream));
        }
    });
}

enum SaslState {
    Plain,
    LoginUser,
    LoginPass { user: String },
}

async fn serve_auth(stream: UnixStream) {
    let (rx, mut tx) = stream.into_split();
    tx.write_all(b"VERSION\t1\t2\nMECH\tPLAIN\tplaintext\nMECH\tLOGIN\tplaintext\nDONE\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(rx).lines();
    let mut pending: HashMap<u32, SaslState> = HashMap::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields[0] {
            "AUTH" => {
                let id: u32 = fields[1].parse().unwrap();
                let mechanism = fields[2];
                let resp = fields.iter().find_map(|field| field.strip_prefix("resp="));
                match (mechanism, resp) {
                    ("PLAIN", Some(resp)) => {
                        let reply = plain_verdict(id, resp);
                        tx.write_all(reply.as_bytes()).await.unwrap();
                    }
                    ("PLAIN", None) => {
                        pending.insert(id, SaslState::Plain);
                        tx.write_all(format!("CONT\t{}\t\n", id).as_bytes())
                            .await
                            .unwrap();
                    }
                    ("LOGIN", _) => {
                        pending.insert(id, SaslState::LoginUser);
                        tx.write_all(format!("CONT\t{}\tVXNlcm5hbWU6\n", id).as_bytes())
                            .await
                            .unwrap();
                    }
                    _ => {
                        tx.write_all(
                            format!("FAIL\t{}\treason=Unsupported mechanism\n", id).as_bytes(),
                        )
                        .await
                        .unwrap();
                    }
                }
            }
            "CONT" => {
                let id: u32 = fields[1].parse().unwrap();
                let data = fields.get(2).copied().unwrap_or_default();
                match pending.remove(&id) {
                    Some(SaslState::Plain) => {
                        let reply = plain_verdict(id, data);
                        tx.write_all(reply.as_bytes()).await.unwrap();
                    }
                    Some(SaslState::LoginUser) => {
                        let user =
                            String::from_utf8(STANDARD.decode(data).unwrap_or_default())
                                .unwrap_or_default();
                        pending.insert(id, SaslState::LoginPass { user });
                        tx.write_all(format!("CONT\t{}\tUGFzc3dvcmQ6\n", id).as_bytes())
                            .await
                            .unwrap();
                    }
                    Some(SaslState::LoginPass { user }) => {
                        let pass =
                            String::from_utf8(STANDARD.decode(data).unwrap_or_default())
                                .unwrap_or_default();
                        let reply = if user == "alice" && pass == "secret" {
                            format!("OK\t{}\tuser={}\n", id, user)
                        } else {
                            format!("FAIL\t{}\treason=Authentication failed.\n", id)
                        };
                        tx.write_all(reply.as_bytes()).await.unwrap();
                    }
                    None => {}
                }
            }
            _ => {}
        }
    }
}

fn plain_verdict(id: u32, resp: &str) -> String {
    let decoded = STANDARD.decode(resp).unwrap_or_default();
    let mut parts = decoded.split(|byte| *byte == 0);
    let _authz = parts.next();
    let user = parts
        .next()
        .map(|user| String::from_utf8_lossy(user).into_owned())
        .unwrap_or_default();
    let pass = parts
        .next()
        .map(|pass| String::from_utf8_lossy(pass).into_owned())
        .unwrap_or_default();
    if user == "alice" && pass == "secret" {
        format!("OK\t{}\tuser={}\n", id, user)
    } else {
        format!("FAIL\t{}\treason=Authentication failed.\n", id)
    }
}

/// Minimal scripted IMAP client: tags are generated, reads are bounded.
pub struct ImapConnection<T: AsyncRead + AsyncWrite + Unpin> {
    reader: BufReader<tokio::io::ReadHalf<T>>,
    writer: tokio::io::WriteHalf<T>,
    tag: usize,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ImapConnection<T> {
    pub fn new(stream: T) -> Self {
        let (rx, tx) = tokio::io::split(stream);
        ImapConnection {
            reader: BufReader::new(rx),
            writer: tx,
            tag: 0,
        }
    }

    pub async fn send(&mut self, command: &str) {
        self.tag += 1;
        self.send_raw(&format!("t{} {}", self.tag, command)).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// One line, CRLF stripped; None on EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
        {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(_) => None,
        }
    }

    pub async fn expect_line(&mut self) -> String {
        self.read_line().await.expect("connection closed")
    }

    pub async fn expect_eof(&mut self) {
        assert_eq!(self.read_line().await, None, "expected EOF");
    }

    /// True when the peer closes the connection within the given window;
    /// false when it stays silent or sends more data.
    pub async fn eof_within(&mut self, window: Duration) -> bool {
        let mut line = String::new();
        match timeout(window, self.reader.read_line(&mut line)).await {
            Err(_) => false,
            Ok(Ok(0)) => true,
            Ok(Ok(_)) => false,
            Ok(Err(_)) => true,
        }
    }

    /// Reads until the reply tagged with the last sent tag, asserting its
    /// response type. Returns every line read, tagged reply last.
    pub async fn assert_tagged(&mut self, rtype: &str) -> Vec<String> {
        let prefix = format!("t{} ", self.tag);
        let mut lines = Vec::new();
        loop {
            let line = self.expect_line().await;
            let tagged = line.strip_prefix(&prefix).map(|rest| rest.to_string());
            lines.push(line);
            if let Some(rest) = tagged {
                assert!(
                    rest.starts_with(rtype),
                    "expected {} reply, got {:?}",
                    rtype,
                    lines.last().unwrap()
                );
                return lines;
            }
        }
    }

    pub fn into_stream(self) -> T {
        self.reader.into_inner().unsplit(self.writer)
    }
}

pub fn assert_contains(lines: &[String], needle: &str) {
    assert!(
        lines.iter().any(|line| line.contains(needle)),
        "expected {:?} in {:#?}",
        needle,
        lines
    );
}

pub fn assert_not_contains(lines: &[String], needle: &str) {
    assert!(
        !lines.iter().any(|line| line.contains(needle)),
        "did not expect {:?} in {:#?}",
        needle,
        lines
    );
}

pub fn b64(value: &str) -> String {
    STANDARD.encode(value)
}

pub fn self_signed_acceptor() -> TlsAcceptor {
    let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![key.cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key.key_pair.serialize_der().into()),
        )
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}
