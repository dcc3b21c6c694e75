//! Connection manager (§4.E): dial/accept, solicit via server, dedupe by
//! identity, cache, evict.
//!
//! Owns two populations of connections — long-lived peer (and distributed)
//! message connections keyed by username, and short-lived transfer
//! connections keyed by the token the two sides agreed on — plus the
//! listener that accepts both kinds. Mirrors the teacher's
//! `Disk::start`-style shape: a background task owns a map behind a lock
//! and a channel hands work and results across the boundary, rather than
//! an actor owning everything (the maps here are touched from many call
//! sites with short critical sections, so a plain `Mutex` fits better, per
//! the Design Notes' "pick per component based on contention").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::codec::init::InitCode;
use crate::codec::server::PeerConnectionType;
use crate::codec::{InitMessageBuilder, InitMessageReader};
use crate::connection::{Connection, ConnectionOptions, ConnectionReader, ConnectionWriter};
use crate::error::ManagerError;
use crate::token::TokenFactory;
use crate::types::Username;

type Result<T> = std::result::Result<T, ManagerError>;

/// A connection handed across a solicitation channel, already split into
/// its read and write halves.
type SplitConnection = (ConnectionReader, ConnectionWriter);

/// A frame read off an established peer or distributed connection, handed
/// to whichever subsystem (transfer engine, distributed overlay) consumes
/// that dialect. Tagging by username rather than a connection handle keeps
/// the receiver decoupled from the manager's internal connection map.
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub username: Username,
    pub frame: Bytes,
}

/// A long-lived connection to a peer, used for control messages (one per
/// username, per §3 "A message connection pool maps each username to at
/// most one MessageConnection at any instant").
#[derive(Clone)]
pub struct PeerConnection {
    pub username: Username,
    pub writer: ConnectionWriter,
}

/// Thin handle the manager uses to make server requests without holding a
/// concrete reference to [`crate::session::ServerSession`] (would create an
/// ownership cycle; see Design Notes on arena-style ownership).
pub trait ServerRequests: Send + Sync {
    /// Resolves `username`'s endpoint via `GetPeerAddress`, failing with
    /// [`ManagerError::PeerOffline`] if the server reports `0.0.0.0`.
    fn get_peer_address<'a>(&'a self, username: &'a str) -> BoxFuture<'a, Result<SocketAddr>>;
    /// Sends `ConnectToPeer(token, username, type)`, asking the server to
    /// solicit an inbound connection from `username`. Fire-and-forget: the
    /// solicited connection arrives through the manager's listener.
    fn connect_to_peer(&self, token: u32, username: &str, conn_type: PeerConnectionType);

    /// Reports this client's branch level/root once the distributed
    /// overlay validates a parent (§4.G). No-op by default: only the real
    /// server session needs to act on it.
    fn report_branch(&self, _level: i32, _root: &str) {}

    /// Reports the parent's IP address once validated (§4.G).
    fn report_parent_ip(&self, _ip: std::net::Ipv4Addr) {}
}

/// Tuning knobs the manager needs beyond a plain [`ConnectionOptions`].
#[derive(Clone)]
pub struct ManagerOptions {
    pub connection: ConnectionOptions,
    pub max_peer_connections: usize,
    pub eviction_interval: Duration,
}

struct PeerEntry {
    connection: PeerConnection,
    last_active: Instant,
}

/// Manages peer message connections, distributed connections, and transfer
/// connections, including the firewall-piercing three-way connect race.
pub struct ConnectionManager {
    local_username: Mutex<String>,
    options: ManagerOptions,
    tokens: Arc<TokenFactory>,
    peer_connections: Mutex<HashMap<Username, PeerEntry>>,
    /// Connections the manager is expecting: either solicited via
    /// `ConnectToPeer` (keyed by the token we asked the server to use) or
    /// pre-registered for an unsolicited inbound transfer (keyed by the
    /// remote token the peer is expected to present).
    pending_connects: Mutex<HashMap<u32, oneshot::Sender<SplitConnection>>>,
    peer_frame_tx: mpsc::UnboundedSender<IncomingFrame>,
    distributed_frame_tx: mpsc::UnboundedSender<IncomingFrame>,
    /// Distributed child admission is gated by the overlay; the manager
    /// just forwards newly accepted "D" connections here.
    distributed_accept_tx: mpsc::UnboundedSender<PeerConnection>,
    /// Notifies the overlay when a distributed connection's reader task
    /// terminates, so it can drop a lost parent into `Orphaned` or forget
    /// a lost child (§4.G).
    distributed_disconnect_tx: mpsc::UnboundedSender<Username>,
}

impl ConnectionManager {
    pub fn new(
        local_username: impl Into<String>,
        options: ManagerOptions,
        tokens: Arc<TokenFactory>,
        peer_frame_tx: mpsc::UnboundedSender<IncomingFrame>,
        distributed_frame_tx: mpsc::UnboundedSender<IncomingFrame>,
        distributed_accept_tx: mpsc::UnboundedSender<PeerConnection>,
        distributed_disconnect_tx: mpsc::UnboundedSender<Username>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_username: Mutex::new(local_username.into()),
            options,
            tokens,
            peer_connections: Mutex::new(HashMap::new()),
            pending_connects: Mutex::new(HashMap::new()),
            peer_frame_tx,
            distributed_frame_tx,
            distributed_accept_tx,
            distributed_disconnect_tx,
        })
    }

    pub fn set_local_username(&self, username: impl Into<String>) {
        *self.local_username.lock().unwrap() = username.into();
    }

    fn local_username(&self) -> String {
        self.local_username.lock().unwrap().clone()
    }

    /// Binds a listener on `port` and spawns the accept loop. Each accepted
    /// socket is read for exactly one initialization frame, which
    /// disambiguates `PeerInit` from `PierceFirewall` (§4.E "Listener").
    pub async fn start_listener(self: &Arc<Self>, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.handle_accepted(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("listener accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(addr)
    }

    async fn handle_accepted(self: Arc<Self>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let conn = Connection::from_accepted(stream, peer_addr, self.options.connection.clone());
        let (mut reader, writer) = conn.split();
        let init = match reader.read_message().await {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("accepted socket from {} closed before init frame: {}", peer_addr, e);
                return;
            }
        };
        let mut msg = match InitMessageReader::from_frame(init) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("malformed init frame from {}: {}", peer_addr, e);
                return;
            }
        };
        match InitCode::from_code(msg.read_code()) {
            InitCode::PierceFirewall => {
                let token = match msg.read_u32() {
                    Ok(t) => t,
                    Err(_) => return,
                };
                if let Some(tx) = self.pending_connects.lock().unwrap().remove(&token) {
                    let _ = tx.send((reader, writer));
                } else {
                    log::debug!("unsolicited PierceFirewall({}) from {}", token, peer_addr);
                }
            }
            InitCode::PeerInit => {
                let (username, ty, token) = match (msg.read_string(), msg.read_string()) {
                    (Ok(u), Ok(t)) => match msg.read_u32() {
                        Ok(tok) => (u, t, tok),
                        Err(_) => return,
                    },
                    _ => return,
                };
                match PeerConnectionType::parse(&ty) {
                    Some(PeerConnectionType::Peer) => {
                        self.admit_peer_connection(username, reader, writer);
                    }
                    Some(PeerConnectionType::Distributed) => {
                        let handle = PeerConnection {
                            username: username.clone(),
                            writer: writer.clone(),
                        };
                        let _ = self.distributed_accept_tx.send(handle);
                        self.spawn_reader(username, reader, self.distributed_frame_tx.clone(), Some(self.distributed_disconnect_tx.clone()));
                    }
                    Some(PeerConnectionType::Transfer) => {
                        reader.disable_inactivity_timeout();
                        if let Some(tx) = self.pending_connects.lock().unwrap().remove(&token) {
                            let _ = tx.send((reader, writer));
                        } else {
                            log::debug!("unsolicited transfer connection (token {}) from {}", token, peer_addr);
                        }
                    }
                    None => log::warn!("unknown connection type {:?} from {}", ty, peer_addr),
                }
            }
            InitCode::Other(code) => {
                log::warn!("unexpected init code {} from {}", code, peer_addr);
            }
        }
    }

    fn admit_peer_connection(self: &Arc<Self>, username: String, reader: ConnectionReader, writer: ConnectionWriter) {
        let handle = PeerConnection {
            username: username.clone(),
            writer,
        };
        let mut peers = self.peer_connections.lock().unwrap();
        if peers.contains_key(&username) {
            // keep the earliest accepted connection, close this one
            handle.writer.disconnect("duplicate peer connection");
            return;
        }
        peers.insert(
            username.clone(),
            PeerEntry {
                connection: handle,
                last_active: Instant::now(),
            },
        );
        drop(peers);
        self.spawn_reader(username, reader, self.peer_frame_tx.clone(), None);
    }

    fn spawn_reader(
        self: &Arc<Self>,
        username: String,
        mut reader: ConnectionReader,
        tx: mpsc::UnboundedSender<IncomingFrame>,
        disconnect_tx: Option<mpsc::UnboundedSender<Username>>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match reader.read_message().await {
                    Ok(frame) => {
                        manager.touch(&username);
                        if tx.send(IncomingFrame {
                            username: username.clone(),
                            frame,
                        }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("connection to {} closed: {}", username, e);
                        manager.peer_connections.lock().unwrap().remove(&username);
                        if let Some(disconnect_tx) = &disconnect_tx {
                            let _ = disconnect_tx.send(username.clone());
                        }
                        break;
                    }
                }
            }
        });
    }

    fn touch(&self, username: &str) {
        if let Some(entry) = self.peer_connections.lock().unwrap().get_mut(username) {
            entry.last_active = Instant::now();
        }
    }

    /// The three-way connect race of §4.E: dial directly and send
    /// `PeerInit`, while concurrently asking the server to solicit an
    /// inbound connection. Whichever arrives first is adopted; the other
    /// is abandoned.
    async fn race_connect(
        self: &Arc<Self>,
        username: &str,
        conn_type: PeerConnectionType,
        addr: SocketAddr,
        server: &Arc<dyn ServerRequests>,
    ) -> Result<SplitConnection> {
        let token = self.tokens.next_token();
        let (tx, rx) = oneshot::channel();
        self.pending_connects.lock().unwrap().insert(token, tx);
        server.connect_to_peer(token, username, conn_type);

        let local_username = self.local_username();
        let connect_options = self.options.connection.clone();
        let direct = {
            let username = username.to_string();
            async move {
                let conn = Connection::connect(addr, connect_options).await?;
                let (reader, writer) = conn.split();
                let frame = InitMessageBuilder::new(InitCode::PeerInit.code())
                    .write_string(&local_username)
                    .write_string(conn_type.as_str())
                    .write_u32(token)
                    .finish();
                writer.write(frame).await?;
                let _ = username;
                Ok::<SplitConnection, ManagerError>((reader, writer))
            }
        };
        let indirect = async { rx.await.map_err(|_| ManagerError::ConnectionTimeout) };

        tokio::pin!(direct);
        tokio::pin!(indirect);
        let timeout = tokio::time::sleep(self.options.connection.connect_timeout);
        tokio::pin!(timeout);

        let mut direct_done = false;
        let mut indirect_done = false;
        let result = loop {
            if direct_done && indirect_done {
                break Err(ManagerError::ConnectionTimeout);
            }
            tokio::select! {
                res = &mut direct, if !direct_done => {
                    direct_done = true;
                    if let Ok(conn) = res {
                        break Ok(conn);
                    }
                }
                res = &mut indirect, if !indirect_done => {
                    indirect_done = true;
                    if let Ok(conn) = res {
                        break Ok(conn);
                    }
                }
                _ = &mut timeout => {
                    break Err(ManagerError::ConnectionTimeout);
                }
            }
        };
        self.pending_connects.lock().unwrap().remove(&token);
        result
    }

    /// Obtains a message connection to `username`, reusing an existing one
    /// if present (§3: at most one `MessageConnection` per username).
    pub async fn get_or_add_peer_connection(
        self: &Arc<Self>,
        username: &str,
        server: Arc<dyn ServerRequests>,
    ) -> Result<PeerConnection> {
        if let Some(entry) = self.peer_connections.lock().unwrap().get(username) {
            return Ok(entry.connection.clone());
        }

        self.enforce_connection_cap();

        let addr = server.get_peer_address(username).await?;
        let (reader, writer) = self.race_connect(username, PeerConnectionType::Peer, addr, &server).await?;

        let mut peers = self.peer_connections.lock().unwrap();
        if let Some(existing) = peers.get(username) {
            // another path (e.g. a concurrent unsolicited PeerInit) won
            // the race while we were dialing; keep the earliest.
            writer.disconnect("duplicate peer connection");
            return Ok(existing.connection.clone());
        }
        let handle = PeerConnection {
            username: username.to_string(),
            writer,
        };
        peers.insert(
            username.to_string(),
            PeerEntry {
                connection: handle.clone(),
                last_active: Instant::now(),
            },
        );
        drop(peers);
        self.spawn_reader(username.to_string(), reader, self.peer_frame_tx.clone(), None);
        Ok(handle)
    }

    /// Obtains a distributed ("D") connection to `username` (used by the
    /// overlay to dial a candidate parent). Unlike peer connections, these
    /// are not deduped against a persistent map here — the overlay decides
    /// which of several races to keep.
    pub async fn connect_distributed(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        server: Arc<dyn ServerRequests>,
    ) -> Result<PeerConnection> {
        let (reader, writer) = self.race_connect(username, PeerConnectionType::Distributed, addr, &server).await?;
        self.spawn_reader(username.to_string(), reader, self.distributed_frame_tx.clone(), Some(self.distributed_disconnect_tx.clone()));
        Ok(PeerConnection {
            username: username.to_string(),
            writer,
        })
    }

    /// Fulfills a server-relayed `ConnectToPeer` event (§4.F): the
    /// indirect half of *someone else's* three-way connect race, where we
    /// are the side being solicited. Dials `addr` and announces ourselves
    /// with `PierceFirewall(token)`, then routes the resulting connection
    /// the same way an accepted socket would be (§4.E).
    pub async fn fulfill_connect_to_peer(
        self: &Arc<Self>,
        token: u32,
        username: &str,
        addr: SocketAddr,
        conn_type: PeerConnectionType,
    ) {
        let conn = match Connection::connect(addr, self.options.connection.clone()).await {
            Ok(c) => c,
            Err(e) => {
                log::debug!("failed to fulfil ConnectToPeer to {}: {}", username, e);
                return;
            }
        };
        let (mut reader, writer) = conn.split();
        let frame = InitMessageBuilder::new(InitCode::PierceFirewall.code())
            .write_u32(token)
            .finish();
        if writer.write(frame).await.is_err() {
            return;
        }
        match conn_type {
            PeerConnectionType::Peer => {
                self.admit_peer_connection(username.to_string(), reader, writer);
            }
            PeerConnectionType::Distributed => {
                let handle = PeerConnection {
                    username: username.to_string(),
                    writer: writer.clone(),
                };
                let _ = self.distributed_accept_tx.send(handle);
                self.spawn_reader(username.to_string(), reader, self.distributed_frame_tx.clone(), Some(self.distributed_disconnect_tx.clone()));
            }
            PeerConnectionType::Transfer => {
                reader.disable_inactivity_timeout();
                if let Some(tx) = self.pending_connects.lock().unwrap().remove(&token) {
                    let _ = tx.send((reader, writer));
                } else {
                    log::debug!("fulfilled transfer connection (token {}) has no pending waiter", token);
                }
            }
        }
    }

    /// Registers interest in an inbound transfer connection carrying
    /// `remote_token`, for the indirect path of §4.H.2 step 6 ("if the
    /// transfer connection arrives indirectly ... match the initial 4-byte
    /// token to a pending transfer").
    pub fn await_transfer_connection(&self, remote_token: u32) -> oneshot::Receiver<SplitConnection> {
        let (tx, rx) = oneshot::channel();
        self.pending_connects.lock().unwrap().insert(remote_token, tx);
        rx
    }

    pub fn cancel_pending_transfer(&self, remote_token: u32) {
        self.pending_connects.lock().unwrap().remove(&remote_token);
    }

    /// Dials (or waits for the solicited inbound) transfer connection for
    /// `remote_token`, type `"F"` (§4.E "Transfer connections").
    pub async fn get_transfer_connection(
        self: &Arc<Self>,
        username: &str,
        remote_token: u32,
        addr: SocketAddr,
        server: Arc<dyn ServerRequests>,
    ) -> Result<SplitConnection> {
        // the token used on the wire for the three-way race must match
        // remote_token so the peer can correlate it to the pending
        // transfer it is holding open on its side.
        let (tx, rx) = oneshot::channel();
        self.pending_connects.lock().unwrap().insert(remote_token, tx);
        server.connect_to_peer(remote_token, username, PeerConnectionType::Transfer);

        let local_username = self.local_username();
        let connect_options = ConnectionOptions {
            without_inactivity_timeout: true,
            ..self.options.connection.clone()
        };
        let direct = async move {
            let conn = Connection::connect(addr, connect_options).await?;
            let (reader, writer) = conn.split();
            let frame = InitMessageBuilder::new(InitCode::PeerInit.code())
                .write_string(&local_username)
                .write_string(PeerConnectionType::Transfer.as_str())
                .write_u32(remote_token)
                .finish();
            writer.write(frame).await?;
            Ok::<SplitConnection, ManagerError>((reader, writer))
        };
        let indirect = async { rx.await.map_err(|_| ManagerError::ConnectionTimeout) };

        tokio::pin!(direct);
        tokio::pin!(indirect);
        let timeout = tokio::time::sleep(self.options.connection.connect_timeout);
        tokio::pin!(timeout);
        let mut direct_done = false;
        let mut indirect_done = false;
        let result = loop {
            if direct_done && indirect_done {
                break Err(ManagerError::ConnectionTimeout);
            }
            tokio::select! {
                res = &mut direct, if !direct_done => {
                    direct_done = true;
                    if let Ok(conn) = res { break Ok(conn); }
                }
                res = &mut indirect, if !indirect_done => {
                    indirect_done = true;
                    if let Ok(conn) = res { break Ok(conn); }
                }
                _ = &mut timeout => break Err(ManagerError::ConnectionTimeout),
            }
        };
        self.pending_connects.lock().unwrap().remove(&remote_token);
        result
    }

    fn enforce_connection_cap(&self) {
        let mut peers = self.peer_connections.lock().unwrap();
        if peers.len() < self.options.max_peer_connections {
            return;
        }
        if let Some((oldest, _)) = peers
            .iter()
            .min_by_key(|(_, entry)| entry.last_active)
            .map(|(u, e)| (u.clone(), e.last_active))
        {
            if let Some(entry) = peers.remove(&oldest) {
                log::debug!("evicting peer connection to {} to admit a new one", oldest);
                entry.connection.writer.disconnect("evicted to admit a new connection");
            }
        }
    }

    /// Background sweep disconnecting idle connections (§4.E "Eviction").
    pub fn spawn_eviction_sweep(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.options.connection.inactivity_timeout.max(Duration::from_secs(1));
        let sweep_every = self.options.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut peers = manager.peer_connections.lock().unwrap();
                peers.retain(|username, entry| {
                    let idle = now.duration_since(entry.last_active);
                    if idle >= interval {
                        log::debug!("evicting idle peer connection to {}", username);
                        entry.connection.writer.disconnect("inactivity timeout");
                        false
                    } else {
                        true
                    }
                });
            }
        });
    }

    pub fn peer_connection_count(&self) -> usize {
        self.peer_connections.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener as TestListener;

    struct NullServer;
    impl ServerRequests for NullServer {
        fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, Result<SocketAddr>> {
            Box::pin(async { Err(ManagerError::PeerOffline) })
        }
        fn connect_to_peer(&self, _token: u32, _username: &str, _conn_type: PeerConnectionType) {}
    }

    fn new_manager() -> (
        Arc<ConnectionManager>,
        mpsc::UnboundedReceiver<IncomingFrame>,
        mpsc::UnboundedReceiver<IncomingFrame>,
        mpsc::UnboundedReceiver<PeerConnection>,
    ) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (dist_tx, dist_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, _disconnect_rx) = mpsc::unbounded_channel();
        let options = ManagerOptions {
            connection: ConnectionOptions {
                connect_timeout: Duration::from_millis(200),
                ..ConnectionOptions::default()
            },
            max_peer_connections: 10,
            eviction_interval: Duration::from_secs(30),
        };
        let manager = ConnectionManager::new(
            "me",
            options,
            Arc::new(TokenFactory::default()),
            peer_tx,
            dist_tx,
            accept_tx,
            disconnect_tx,
        );
        (manager, peer_rx, dist_rx, accept_rx)
    }

    #[tokio::test]
    async fn peer_offline_is_reported() {
        let (manager, _prx, _drx, _arx) = new_manager();
        let server: Arc<dyn ServerRequests> = Arc::new(NullServer);
        let result = manager.get_or_add_peer_connection("bob", server).await;
        assert!(matches!(result, Err(ManagerError::PeerOffline)));
    }

    #[tokio::test]
    async fn direct_dial_is_adopted_when_it_wins_the_race() {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicBool::new(false));
        let accepted2 = Arc::clone(&accepted);
        tokio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                accepted2.store(true, Ordering::SeqCst);
                let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
                let (mut reader, _writer) = conn.split();
                let _ = reader.read_message().await;
            }
        });

        struct DirectServer(SocketAddr);
        impl ServerRequests for DirectServer {
            fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, Result<SocketAddr>> {
                let addr = self.0;
                Box::pin(async move { Ok(addr) })
            }
            fn connect_to_peer(&self, _token: u32, _username: &str, _conn_type: PeerConnectionType) {}
        }

        let (manager, _prx, _drx, _arx) = new_manager();
        let server: Arc<dyn ServerRequests> = Arc::new(DirectServer(addr));
        let conn = manager.get_or_add_peer_connection("bob", server).await.unwrap();
        assert_eq!(conn.username, "bob");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(accepted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeat_calls_reuse_the_same_connection() {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
                let (mut reader, _writer) = conn.split();
                tokio::spawn(async move {
                    let _ = reader.read_message().await;
                });
            }
        });

        struct DirectServer(SocketAddr);
        impl ServerRequests for DirectServer {
            fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, Result<SocketAddr>> {
                let addr = self.0;
                Box::pin(async move { Ok(addr) })
            }
            fn connect_to_peer(&self, _token: u32, _username: &str, _conn_type: PeerConnectionType) {}
        }

        let (manager, _prx, _drx, _arx) = new_manager();
        let server: Arc<dyn ServerRequests> = Arc::new(DirectServer(addr));
        let first = manager.get_or_add_peer_connection("bob", Arc::clone(&server)).await.unwrap();
        let second = manager.get_or_add_peer_connection("bob", server).await.unwrap();
        assert_eq!(manager.peer_connection_count(), 1);
        assert_eq!(first.username, second.username);
    }
}
