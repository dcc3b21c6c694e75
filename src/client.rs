//! The public client facade (§6.2): wires the connection manager, server
//! session, distributed overlay, transfer engine and peer-request layer
//! together and exposes the stable operation + event surface an embedder
//! depends on.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::conf::Conf;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{ClientError, ManagerError};
use crate::manager::{ConnectionManager, ManagerOptions};
use crate::overlay::{DistributedOverlay, OverlayOptions};
use crate::peer_requests::PeerRequests;
use crate::resolvers::{NoopResolvers, Resolvers};
use crate::session::{ServerEvent, ServerSession, SessionOptions, SessionServerRequests};
use crate::token::TokenFactory;
use crate::transfer::search::SearchOptions;
use crate::transfer::{TransferEngine, TransferEvent};
use crate::types::{BrowseResponse, SearchResponse, UserInfoResponse, UserStats, UserStatus, Username};

type Result<T> = std::result::Result<T, ClientError>;

/// Events fanned out to the embedder, merging the server session's and
/// the transfer engine's event streams into one surface (§6.2 "Events").
#[derive(Debug, Clone)]
pub enum ClientEvent {
    LoggedIn { greeting: String },
    LoginFailed { reason: String },
    Disconnected { reason: String },
    PrivateMessage { id: u32, username: Username, message: String },
    RoomJoined { name: String },
    RoomMessage { room: String, username: Username, message: String },
    KickedFromServer,
    PrivilegedUsers(Vec<Username>),
    TransferStateChanged {
        username: Username,
        filename: String,
        state: crate::types::TransferState,
    },
    TransferProgress {
        username: Username,
        filename: String,
        bytes_transferred: u64,
        total: u64,
        bytes_per_sec: f64,
    },
}

/// Everything that exists only while connected; torn down and rebuilt by
/// each `connect()` call, since a server disconnection is fatal to the
/// session and the embedder must reconnect and re-login (§7).
struct Session {
    manager: Arc<ConnectionManager>,
    server_session: Arc<ServerSession>,
    overlay: Arc<DistributedOverlay>,
    transfer: Arc<TransferEngine>,
    peer_requests: Arc<PeerRequests>,
}

/// The assembled network core. `connect` + `login` bring it to a usable
/// state; every other operation may be called concurrently from many
/// tasks once logged in.
pub struct Client {
    conf: Conf,
    resolvers: Arc<dyn Resolvers>,
    session: Mutex<Option<Session>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    pub fn new(conf: Conf) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::with_resolvers(conf, Arc::new(NoopResolvers))
    }

    pub fn with_resolvers(conf: Conf, resolvers: Arc<dyn Resolvers>) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                conf,
                resolvers,
                session: Mutex::new(None),
                events,
            }),
            events_rx,
        )
    }

    fn session(&self) -> Result<MappedSession> {
        let guard = self.session.lock().unwrap();
        match guard.as_ref() {
            Some(s) => Ok(MappedSession {
                manager: Arc::clone(&s.manager),
                server_session: Arc::clone(&s.server_session),
                transfer: Arc::clone(&s.transfer),
                peer_requests: Arc::clone(&s.peer_requests),
            }),
            None => Err(ClientError::Manager(ManagerError::Disconnected)),
        }
    }

    /// Opens the connection to the central server and starts every
    /// background task the rest of the client depends on (§4.E/§4.F/§4.G).
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        // the server link is long-lived and legitimately quiet between
        // keepalives; it must not be force-closed by the inactivity timer
        // that exists to reclaim idle peer connections.
        let server_connection_options = ConnectionOptions {
            without_inactivity_timeout: true,
            ..self.conf.connection.clone()
        };
        let conn = Connection::connect(addr, server_connection_options)
            .await
            .map_err(ClientError::Connection)?;
        let (mut reader, writer) = conn.split();

        let (server_session, mut server_events) = ServerSession::new(
            writer.clone(),
            SessionOptions {
                auto_ack_private_messages: self.conf.client.auto_ack_private_messages,
                auto_ack_privilege_notifications: self.conf.client.auto_ack_privilege_notifications,
                reply_timeout: self.conf.connection.connect_timeout,
            },
        );
        let server_session = Arc::new(server_session);

        let server_requests: Arc<dyn crate::manager::ServerRequests> = Arc::new(SessionServerRequests {
            writer: writer.clone(),
            waiters: server_session.waiters(),
            reply_timeout: self.conf.connection.connect_timeout,
            resolvers: Arc::clone(&self.resolvers),
        });

        let tokens = Arc::new(TokenFactory::default());
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (dist_tx, mut dist_rx) = mpsc::unbounded_channel();
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            String::new(),
            ManagerOptions {
                connection: self.conf.connection.clone(),
                max_peer_connections: self.conf.client.max_peer_connections,
                eviction_interval: self.conf.client.eviction_interval,
            },
            Arc::clone(&tokens),
            peer_tx,
            dist_tx,
            accept_tx,
            disconnect_tx,
        );
        manager.spawn_eviction_sweep();

        if self.conf.client.enable_listener {
            manager
                .start_listener(self.conf.client.listen_port)
                .await
                .map_err(|e| ClientError::Connection(crate::error::ConnectionError::Io(e)))?;
        }

        let overlay = DistributedOverlay::new(
            OverlayOptions {
                accept_children: self.conf.client.accept_distributed_children,
                child_limit: self.conf.client.distributed_child_limit,
                broadcast_queue_depth: self.conf.client.distributed_broadcast_queue_depth,
                deduplicate_search_requests: self.conf.client.deduplicate_search_requests,
                dedup_capacity: self.conf.client.search_request_dedup_capacity,
            },
            Arc::clone(&tokens),
        );

        // a distributed connection's reader task exiting tells the
        // overlay to drop an orphaned parent or forget a lost child
        // (§4.G).
        {
            let overlay = Arc::clone(&overlay);
            tokio::spawn(async move {
                while let Some(username) = disconnect_rx.recv().await {
                    overlay.handle_disconnect(&username);
                }
            });
        }

        let (transfer_events_tx, mut transfer_events_rx) = mpsc::unbounded_channel();
        let transfer = TransferEngine::new(
            Arc::clone(&manager),
            Arc::clone(&server_requests),
            Arc::clone(&tokens),
            Arc::clone(&self.resolvers),
            self.conf.transfer.clone(),
            transfer_events_tx,
        );
        transfer.recover_pending_responses().await;

        let peer_requests = PeerRequests::new(
            Arc::clone(&manager),
            Arc::clone(&server_requests),
            Arc::clone(&self.resolvers),
            self.conf.connection.connect_timeout,
        );

        // server frame reader: feeds the session, emits Disconnected and
        // tears down every pending waiter once the stream closes (§7).
        {
            let server_session = Arc::clone(&server_session);
            let events = self.events.clone();
            tokio::spawn(async move {
                loop {
                    match reader.read_message().await {
                        Ok(frame) => server_session.handle_frame(frame),
                        Err(e) => {
                            server_session.waiters().cancel_all();
                            let _ = events.send(ClientEvent::Disconnected { reason: e.to_string() });
                            break;
                        }
                    }
                }
            });
        }

        // server events: forwarded to the embedder, plus the
        // connection-manager/overlay side effects each one drives.
        {
            let events = self.events.clone();
            let manager = Arc::clone(&manager);
            let server_requests = Arc::clone(&server_requests);
            let overlay = Arc::clone(&overlay);
            let client = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = server_events.recv().await {
                    match event {
                        ServerEvent::LoggedIn { greeting } => {
                            let _ = events.send(ClientEvent::LoggedIn { greeting });
                        }
                        ServerEvent::LoginFailed { reason } => {
                            let _ = events.send(ClientEvent::LoginFailed { reason: reason.clone() });
                            client.disconnect(Some(&format!("login failed: {}", reason)));
                        }
                        ServerEvent::Disconnected { reason } => {
                            let _ = events.send(ClientEvent::Disconnected { reason });
                        }
                        ServerEvent::PrivateMessage { id, username, message } => {
                            let _ = events.send(ClientEvent::PrivateMessage { id, username, message });
                        }
                        ServerEvent::RoomJoined { name } => {
                            let _ = events.send(ClientEvent::RoomJoined { name });
                        }
                        ServerEvent::RoomMessage { room, username, message } => {
                            let _ = events.send(ClientEvent::RoomMessage { room, username, message });
                        }
                        ServerEvent::KickedFromServer => {
                            let _ = events.send(ClientEvent::KickedFromServer);
                            client.disconnect(Some("kicked from server"));
                        }
                        ServerEvent::PrivilegedUsers(users) => {
                            let _ = events.send(ClientEvent::PrivilegedUsers(users));
                        }
                        ServerEvent::ConnectToPeer { token, username, addr, conn_type } => {
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                manager.fulfill_connect_to_peer(token, &username, addr, conn_type).await;
                            });
                        }
                        ServerEvent::NetInfo(candidates) => {
                            let overlay = Arc::clone(&overlay);
                            let manager = Arc::clone(&manager);
                            let server_requests = Arc::clone(&server_requests);
                            tokio::spawn(async move {
                                overlay.handle_net_info(candidates, manager, server_requests).await;
                            });
                        }
                    }
                }
            });
        }

        // inbound peer ("P") frames: split between the transfer engine
        // and the browse/user-info request layer.
        {
            let transfer = Arc::clone(&transfer);
            let peer_requests = Arc::clone(&peer_requests);
            tokio::spawn(async move {
                while let Some(frame) = peer_rx.recv().await {
                    peer_requests.handle_peer_frame(&frame.username, frame.frame.clone()).await;
                    transfer.handle_peer_frame(&frame.username, frame.frame).await;
                }
            });
        }

        // inbound distributed ("D") frames, relayed through the overlay;
        // a relayed search match is handed to the transfer engine's
        // delayed-delivery path (§4.H.5).
        {
            let overlay = Arc::clone(&overlay);
            let resolvers = Arc::clone(&self.resolvers);
            let transfer = Arc::clone(&transfer);
            tokio::spawn(async move {
                while let Some(frame) = dist_rx.recv().await {
                    let transfer = Arc::clone(&transfer);
                    overlay
                        .handle_frame(&frame.username, frame.frame, &resolvers, move |username, token, response| {
                            let transfer = Arc::clone(&transfer);
                            tokio::spawn(async move {
                                transfer.deliver_search_response(username, token, response).await;
                            });
                        })
                        .await;
                }
            });
        }

        // newly admitted distributed ("D") connections: handed to the
        // overlay for child admission (§4.G).
        {
            let overlay = Arc::clone(&overlay);
            tokio::spawn(async move {
                while let Some(conn) = accept_rx.recv().await {
                    overlay.admit_child(conn).await;
                }
            });
        }

        // periodically retries any search response we couldn't deliver
        // the first time, until it expires (§4.H.5).
        {
            let transfer = Arc::clone(&transfer);
            let retention = self.conf.client.delayed_response_retention;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    transfer.sweep_delayed_responses(retention).await;
                }
            });
        }

        {
            let events = self.events.clone();
            tokio::spawn(async move {
                while let Some(event) = transfer_events_rx.recv().await {
                    let mapped = match event {
                        TransferEvent::StateChanged { username, filename, state } => {
                            ClientEvent::TransferStateChanged { username, filename, state }
                        }
                        TransferEvent::Progress {
                            username,
                            filename,
                            bytes_transferred,
                            total,
                            bytes_per_sec,
                        } => ClientEvent::TransferProgress {
                            username,
                            filename,
                            bytes_transferred,
                            total,
                            bytes_per_sec,
                        },
                    };
                    let _ = events.send(mapped);
                }
            });
        }

        *self.session.lock().unwrap() = Some(Session {
            manager,
            server_session,
            overlay,
            transfer,
            peer_requests,
        });
        Ok(())
    }

    /// Gracefully tears down the server connection; every pending waiter
    /// fails and the embedder must `connect` + `login` again to resume
    /// (§7).
    pub fn disconnect(&self, reason: Option<&str>) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.server_session.writer().disconnect(reason.unwrap_or("client disconnect"));
            session.server_session.waiters().cancel_all();
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let session = self.session()?;
        let greeting = session.server_session.login(username, password).await?;
        session.manager.set_local_username(username);
        if self.conf.client.enable_listener {
            let _ = session.server_session.set_listen_port(self.conf.client.listen_port).await;
        }
        Ok(greeting)
    }

    pub async fn search(
        self: &Arc<Self>,
        query: &str,
        options: Option<SearchOptions>,
    ) -> Result<(u32, mpsc::UnboundedReceiver<SearchResponse>)> {
        let session = self.session()?;
        let options = options.unwrap_or_else(|| SearchOptions {
            search_timeout: self.conf.search.search_timeout,
            minimum_response_file_count: self.conf.search.minimum_response_file_count,
            response_limit: self.conf.search.response_limit,
        });
        session
            .transfer
            .search
            .search(query, options, &session.server_session.writer())
            .await
            .map_err(ClientError::Connection)
    }

    pub async fn download(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        cancel: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<Vec<u8>, crate::error::TransferError> {
        let session = self.session().map_err(|_| crate::error::TransferError::Manager(ManagerError::Disconnected))?;
        session.transfer.download(username, filename, cancel).await
    }

    pub async fn browse(&self, username: &str) -> Result<BrowseResponse> {
        let session = self.session()?;
        session.peer_requests.browse(username).await.map_err(ClientError::Manager)
    }

    pub async fn get_user_info(&self, username: &str) -> Result<UserInfoResponse> {
        let session = self.session()?;
        session.peer_requests.user_info(username).await.map_err(ClientError::Manager)
    }

    pub async fn add_user(&self, username: &str) -> Result<bool> {
        let session = self.session()?;
        session.server_session.add_user(username).await
    }

    pub async fn get_user_status(&self, username: &str) -> Result<UserStatus> {
        let session = self.session()?;
        session.server_session.get_user_status(username).await
    }

    pub async fn get_user_stats(&self, username: &str) -> Result<UserStats> {
        let session = self.session()?;
        session.server_session.get_user_stats(username).await
    }

    pub async fn join_room(&self, name: &str) -> Result<()> {
        let session = self.session()?;
        session.server_session.join_room(name).await
    }

    pub async fn leave_room(&self, name: &str) -> Result<()> {
        let session = self.session()?;
        session.server_session.leave_room(name).await.map_err(ClientError::Connection)
    }

    pub async fn get_room_list(&self) -> Result<Vec<String>> {
        let session = self.session()?;
        session.server_session.get_room_list().await
    }

    pub async fn send_room_message(&self, name: &str, message: &str) -> Result<()> {
        let session = self.session()?;
        session.server_session.send_room_message(name, message).await.map_err(ClientError::Connection)
    }

    /// Serves a previously queued download (§4.H.3 step 2-3).
    pub async fn upload(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        data: &[u8],
    ) -> std::result::Result<(), crate::error::TransferError> {
        let session = self.session().map_err(|_| crate::error::TransferError::Manager(ManagerError::Disconnected))?;
        session.transfer.begin_upload(username, filename, data).await
    }

    pub fn peer_connection_count(&self) -> usize {
        self.session.lock().unwrap().as_ref().map(|s| s.manager.peer_connection_count()).unwrap_or(0)
    }

    pub fn overlay_child_count(&self) -> usize {
        self.session.lock().unwrap().as_ref().map(|s| s.overlay.child_count()).unwrap_or(0)
    }
}

/// A cheap, `Clone`-able snapshot of the handles `Client`'s operations
/// need, taken once under the lock instead of holding it across an
/// `.await`.
struct MappedSession {
    manager: Arc<ConnectionManager>,
    server_session: Arc<ServerSession>,
    transfer: Arc<TransferEngine>,
    peer_requests: Arc<PeerRequests>,
}
