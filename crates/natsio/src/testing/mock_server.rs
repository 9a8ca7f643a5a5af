//! In-process NATS server speaking the client protocol over loopback TCP.
//!
//! Implements just enough routing to exercise the client end to end:
//! wildcard and queue-group fan-out, auto-unsubscribe limits, echo
//! suppression, user/password, token, nkey and JWT authentication, publish
//! and subscribe permissions, and payload limits. Each test should start
//! its own server.

use crate::auth_handlers::nkey;
use crate::error::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use natsio_protocol::{
    decode_client_op, matches, ClientOp, ConnectInfo, Message, Nuid, ServerInfo, ServerOp,
    SubscriptionId, SubscriptionRegistry, Unsubscribe,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub proto: i32,
    pub user: Option<(String, String)>,
    pub token: Option<String>,
    /// Public keys (`U...`) allowed to authenticate with a signed nonce.
    pub authorized_nkeys: Vec<String>,
    /// `(jwt, public key)` pairs accepted for JWT authentication.
    pub authorized_jwts: Vec<(String, String)>,
    pub tls_required: bool,
    pub tls_available: bool,
    pub connect_urls: Vec<String>,
    pub max_payload: usize,
    pub deny_publish: Vec<String>,
    pub deny_subscribe: Vec<String>,
    /// Keep routing past an `UNSUB <sid> <max>` limit.
    pub ignore_unsubscribe_max: bool,
    /// Answer keepalive `PING`s. The handshake `PING` is always answered.
    pub answer_pings: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            proto: 1,
            user: None,
            token: None,
            authorized_nkeys: Vec::new(),
            authorized_jwts: Vec::new(),
            tls_required: false,
            tls_available: false,
            connect_urls: Vec::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            deny_publish: Vec::new(),
            deny_subscribe: Vec::new(),
            ignore_unsubscribe_max: false,
            answer_pings: true,
        }
    }
}

impl MockServerConfig {
    #[must_use]
    pub fn with_proto(mut self, proto: i32) -> Self {
        self.proto = proto;
        self
    }

    #[must_use]
    pub fn with_user_password(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some((user.into(), pass.into()));
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_authorized_nkey(mut self, public_key: impl Into<String>) -> Self {
        self.authorized_nkeys.push(public_key.into());
        self
    }

    #[must_use]
    pub fn with_authorized_jwt(mut self, jwt: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.authorized_jwts.push((jwt.into(), public_key.into()));
        self
    }

    #[must_use]
    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    #[must_use]
    pub fn with_tls_available(mut self, available: bool) -> Self {
        self.tls_available = available;
        self
    }

    #[must_use]
    pub fn with_connect_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connect_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    #[must_use]
    pub fn with_deny_publish(mut self, pattern: impl Into<String>) -> Self {
        self.deny_publish.push(pattern.into());
        self
    }

    #[must_use]
    pub fn with_deny_subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.deny_subscribe.push(pattern.into());
        self
    }

    #[must_use]
    pub fn with_ignore_unsubscribe_max(mut self, ignore: bool) -> Self {
        self.ignore_unsubscribe_max = ignore;
        self
    }

    #[must_use]
    pub fn with_answer_pings(mut self, answer: bool) -> Self {
        self.answer_pings = answer;
        self
    }

    fn uses_nonce(&self) -> bool {
        !self.authorized_nkeys.is_empty() || !self.authorized_jwts.is_empty()
    }

    fn auth_required(&self) -> bool {
        self.user.is_some() || self.token.is_some() || self.uses_nonce()
    }

    fn authorize(&self, connect: &ConnectInfo, nonce: Option<&str>) -> bool {
        if let Some((user, pass)) = &self.user {
            if connect.user.as_ref() == Some(user) && connect.pass.as_ref() == Some(pass) {
                return true;
            }
        }
        if let Some(token) = &self.token {
            if connect.auth_token.as_ref() == Some(token) {
                return true;
            }
        }
        if let (Some(nonce), Some(sig)) = (nonce, connect.sig.as_deref()) {
            let Ok(sig) = URL_SAFE_NO_PAD.decode(sig) else {
                return false;
            };
            let public_key = match (&connect.jwt, &connect.nkey) {
                (Some(jwt), _) => self
                    .authorized_jwts
                    .iter()
                    .find(|(known, _)| known == jwt)
                    .map(|(_, pk)| pk.as_str()),
                (None, Some(nkey)) => self
                    .authorized_nkeys
                    .iter()
                    .find(|pk| *pk == nkey)
                    .map(String::as_str),
                (None, None) => None,
            };
            if let Some(pk) = public_key {
                return nkey::verify(pk, nonce.as_bytes(), &sig).is_ok();
            }
        }
        !self.auth_required()
    }
}

/// Where a routed message goes: a connection and the sid it chose.
#[derive(Debug, Clone, Copy)]
struct Route {
    conn: u64,
    sid: u64,
}

struct Peer {
    tx: mpsc::UnboundedSender<Bytes>,
    echo: bool,
    verbose: bool,
    kill: Arc<Notify>,
}

#[derive(Default)]
struct Router {
    subs: SubscriptionRegistry<Route>,
    routes: HashMap<(u64, u64), SubscriptionId>,
    peers: HashMap<u64, Peer>,
    next_conn: u64,
    received: Vec<ClientOp>,
    connects: Vec<ConnectInfo>,
}

impl Router {
    fn send(&self, conn: u64, frame: Bytes) {
        if let Some(peer) = self.peers.get(&conn) {
            let _ = peer.tx.send(frame);
        }
    }

    fn ack(&self, conn: u64) {
        if self.peers.get(&conn).is_some_and(|p| p.verbose) {
            self.send(conn, ServerOp::Ok.to_bytes());
        }
    }

    fn remove_peer(&mut self, conn: u64) {
        self.peers.remove(&conn);
        let owned: Vec<(u64, u64)> = self
            .routes
            .keys()
            .filter(|(c, _)| *c == conn)
            .copied()
            .collect();
        for key in owned {
            if let Some(id) = self.routes.remove(&key) {
                self.subs.remove(id);
            }
        }
    }

    fn route(&mut self, from: u64, subject: &str, reply: Option<&String>, payload: &Bytes) {
        let echo = self.peers.get(&from).is_none_or(|p| p.echo);
        let deliveries = self.subs.dispatch_filtered(
            subject,
            |sub| echo || sub.callback.conn != from,
            &mut rand::thread_rng(),
        );
        for delivery in deliveries {
            let route = delivery.callback;
            if delivery.removed {
                self.routes.remove(&(route.conn, route.sid));
            }
            let msg = Message {
                subject: subject.to_string(),
                sid: route.sid,
                reply: reply.cloned(),
                payload: payload.clone(),
            };
            self.send(route.conn, ServerOp::Msg(msg).to_bytes());
        }
    }
}

/// How a connection should end after handling one frame.
enum Verdict {
    Continue,
    Close,
}

/// An in-process NATS server on a random loopback port.
pub struct MockServer {
    addr: SocketAddr,
    config: Arc<MockServerConfig>,
    router: Arc<Mutex<Router>>,
    accept: Option<JoinHandle<()>>,
}

impl MockServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(MockServerConfig::default()).await
    }

    pub async fn start_with(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut server = Self {
            addr,
            config: Arc::new(config),
            router: Arc::new(Mutex::new(Router::default())),
            accept: None,
        };
        server.accept = Some(server.spawn_accept(listener));
        tracing::debug!(addr = %addr, "mock server listening");
        Ok(server)
    }

    fn spawn_accept(&self, listener: TcpListener) -> JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let router = Arc::clone(&self.router);
        let port = self.addr.port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve(stream, port, Arc::clone(&config), Arc::clone(&router)));
            }
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `nats://127.0.0.1:<port>`
    #[must_use]
    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Drops every client connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        for peer in self.router.lock().peers.values() {
            peer.kill.notify_one();
        }
    }

    /// Stops accepting and drops every connection.
    pub fn stop(&self) {
        if let Some(accept) = &self.accept {
            accept.abort();
        }
        self.drop_connections();
    }

    /// Listens again on the same port after [`stop`](Self::stop).
    pub async fn restart(&mut self) -> Result<()> {
        self.stop();
        if let Some(accept) = self.accept.take() {
            // the aborted task owns the old listener
            let _ = accept.await;
        }
        let listener = TcpListener::bind(self.addr).await?;
        self.accept = Some(self.spawn_accept(listener));
        Ok(())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.router.lock().peers.len()
    }

    /// Server-side subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.router.lock().subs.len()
    }

    /// Every frame received from any client, in arrival order.
    #[must_use]
    pub fn received_ops(&self) -> Vec<ClientOp> {
        self.router.lock().received.clone()
    }

    #[must_use]
    pub fn connects(&self) -> Vec<ConnectInfo> {
        self.router.lock().connects.clone()
    }

    /// Writes raw bytes to every connected client.
    pub fn broadcast_raw(&self, frame: impl Into<Bytes>) {
        let frame = frame.into();
        for peer in self.router.lock().peers.values() {
            let _ = peer.tx.send(frame.clone());
        }
    }

    /// Sends an asynchronous `INFO` advertising `urls` to every client.
    pub fn announce_servers(&self, urls: &[String]) {
        let mut info = self.info(None);
        info.connect_urls = urls.to_vec();
        self.broadcast_raw(ServerOp::Info(Box::new(info)).to_bytes());
    }

    /// Polls until `condition` holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    fn info(&self, nonce: Option<String>) -> ServerInfo {
        build_info(&self.config, self.addr.port(), nonce, None)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_info(config: &MockServerConfig, port: u16, nonce: Option<String>, client_id: Option<u64>) -> ServerInfo {
    ServerInfo {
        server_id: format!("MOCK{port}"),
        server_name: Some("mock".into()),
        version: "2.10.0".into(),
        proto: config.proto,
        host: "127.0.0.1".into(),
        port,
        max_payload: Some(config.max_payload),
        auth_required: config.auth_required(),
        tls_required: config.tls_required,
        tls_verify: false,
        tls_available: config.tls_available,
        connect_urls: config.connect_urls.clone(),
        nonce,
        client_id,
    }
}

async fn serve(stream: TcpStream, port: u16, config: Arc<MockServerConfig>, router: Arc<Mutex<Router>>) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let kill = Arc::new(Notify::new());

    let conn = {
        let mut router = router.lock();
        router.next_conn += 1;
        let conn = router.next_conn;
        router.peers.insert(
            conn,
            Peer {
                tx: tx.clone(),
                echo: true,
                verbose: false,
                kill: Arc::clone(&kill),
            },
        );
        conn
    };

    let nonce = config.uses_nonce().then(|| Nuid::new().next_id());
    let info = build_info(&config, port, nonce.clone(), Some(conn));
    let _ = tx.send(ServerOp::Info(Box::new(info)).to_bytes());

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut session = Session {
        conn,
        config: &config,
        router: &router,
        nonce,
        handshake_pending: true,
    };
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let killed = 'conn: loop {
        loop {
            match decode_client_op(&mut buf) {
                Ok(Some(op)) => {
                    if matches!(session.handle(op), Verdict::Close) {
                        break 'conn false;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(conn, error = %e, "mock server rejected frame");
                    let _ = tx.send(ServerOp::Err("'Unknown Protocol Operation'".into()).to_bytes());
                    break 'conn false;
                }
            }
        }
        tokio::select! {
            () = kill.notified() => break true,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break false,
                Ok(_) => {}
            },
        }
    };

    router.lock().remove_peer(conn);
    drop(tx);
    if killed {
        write_task.abort();
    } else {
        let _ = write_task.await;
    }
    tracing::debug!(conn, killed, "mock connection closed");
}

struct Session<'a> {
    conn: u64,
    config: &'a MockServerConfig,
    router: &'a Mutex<Router>,
    nonce: Option<String>,
    handshake_pending: bool,
}

impl Session<'_> {
    fn handle(&mut self, op: ClientOp) -> Verdict {
        let mut router = self.router.lock();
        router.received.push(op.clone());
        let conn = self.conn;

        match op {
            ClientOp::Connect(connect) => {
                if !self.config.authorize(&connect, self.nonce.as_deref()) {
                    router.send(conn, ServerOp::Err("'Authorization Violation'".into()).to_bytes());
                    return Verdict::Close;
                }
                if let Some(peer) = router.peers.get_mut(&conn) {
                    peer.echo = connect.echo != Some(false);
                    peer.verbose = connect.verbose;
                }
                router.connects.push(*connect);
                router.ack(conn);
            }
            ClientOp::Ping => {
                if self.handshake_pending || self.config.answer_pings {
                    router.send(conn, ServerOp::Pong.to_bytes());
                }
                self.handshake_pending = false;
            }
            ClientOp::Pong => {}
            ClientOp::Sub {
                subject,
                queue,
                sid,
            } => {
                if self.config.deny_subscribe.iter().any(|p| matches(p, &subject)) {
                    let text = format!("'Permissions Violation for Subscription to \"{subject}\"'");
                    router.send(conn, ServerOp::Err(text).to_bytes());
                    return Verdict::Continue;
                }
                match router.subs.subscribe(&subject, queue.as_deref(), Route { conn, sid }) {
                    Ok(id) => {
                        router.routes.insert((conn, sid), id);
                        router.ack(conn);
                    }
                    Err(_) => {
                        router.send(conn, ServerOp::Err("'Invalid Subject'".into()).to_bytes());
                    }
                }
            }
            ClientOp::Unsub { sid, max } => {
                let max = max.filter(|_| !self.config.ignore_unsubscribe_max);
                if let Some(id) = router.routes.get(&(conn, sid)).copied() {
                    if let Unsubscribe::Removed(_) = router.subs.unsubscribe(id, max) {
                        router.routes.remove(&(conn, sid));
                    }
                }
                router.ack(conn);
            }
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                if payload.len() > self.config.max_payload {
                    router.send(conn, ServerOp::Err("'Maximum Payload Violation'".into()).to_bytes());
                    return Verdict::Close;
                }
                if self.config.deny_publish.iter().any(|p| matches(p, &subject)) {
                    let text = format!("'Permissions Violation for Publish to \"{subject}\"'");
                    router.send(conn, ServerOp::Err(text).to_bytes());
                    return Verdict::Continue;
                }
                router.route(conn, &subject, reply.as_ref(), &payload);
                router.ack(conn);
            }
        }
        Verdict::Continue
    }
}
