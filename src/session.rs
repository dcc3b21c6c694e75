//! Server session (§4.F): the single persistent connection to the central
//! server — login, message dispatch, event fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::codec::server::{PeerConnectionType, ServerCode};
use crate::codec::{MessageBuilder, MessageReader};
use crate::connection::ConnectionWriter;
use crate::error::{ClientError, WaiterError};
use crate::manager::ServerRequests;
use crate::resolvers::Resolvers;
use crate::types::{UserStats, UserStatus, Username};
use crate::waiter::{WaitKey, WaiterRegistry};

type Result<T> = std::result::Result<T, ClientError>;

/// The protocol version advertised in `Login`, matching the last version
/// the legacy network actually negotiated.
const PROTOCOL_VERSION: u32 = 181;
const MINOR_VERSION: u32 = 1;

/// The value each server reply is boxed as before being delivered through
/// the waiter registry. One shared, generically-typed registry (component
/// C) serves every server code rather than one registry per reply shape.
#[derive(Debug, Clone)]
pub enum ServerValue {
    LoginSucceeded { greeting: String, ip: std::net::Ipv4Addr },
    PeerAddress(SocketAddr),
    UserExists(bool),
    UserStatus(UserStatus),
    UserStats(UserStats),
    RoomList(Vec<String>),
    Joined,
    ParentMinSpeed(u32),
    ParentSpeedRatio(u32),
    WishlistInterval(u32),
}

/// Events fanned out to the embedder (§6.2 "Events"). The client exposes
/// these via a broadcast-style channel rather than a process-wide event
/// bus (Design Notes: "prefer explicit channels ... never hidden
/// process-wide state").
#[derive(Debug, Clone)]
pub enum ServerEvent {
    LoggedIn { greeting: String },
    LoginFailed { reason: String },
    Disconnected { reason: String },
    PrivateMessage { id: u32, username: Username, message: String },
    RoomJoined { name: String },
    RoomMessage { room: String, username: Username, message: String },
    KickedFromServer,
    PrivilegedUsers(Vec<Username>),
    ConnectToPeer { token: u32, username: Username, addr: SocketAddr, conn_type: PeerConnectionType },
    NetInfo(Vec<(Username, SocketAddr)>),
}

/// Options gating the session's automatic behaviors (§4.F).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub auto_ack_private_messages: bool,
    pub auto_ack_privilege_notifications: bool,
    pub reply_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_ack_private_messages: true,
            auto_ack_privilege_notifications: true,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// The server session. Holds the write half of the server connection plus
/// the shared waiter registry; the read loop (owned by whoever split the
/// connection) feeds frames into [`ServerSession::handle_frame`].
pub struct ServerSession {
    writer: ConnectionWriter,
    waiters: Arc<WaiterRegistry<ServerValue>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    options: SessionOptions,
}

impl ServerSession {
    pub fn new(writer: ConnectionWriter, options: SessionOptions) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                writer,
                waiters: Arc::new(WaiterRegistry::new()),
                events: tx,
                options,
            },
            rx,
        )
    }

    /// Builds `Login(username, password, version, md5(username+password),
    /// minor_version)` and awaits `LoginResponse` (§4.F).
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(username.as_bytes());
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let frame = MessageBuilder::new(ServerCode::Login.code())
            .write_string(username)
            .write_string(password)
            .write_u32(PROTOCOL_VERSION)
            .write_string(&hex::encode(digest))
            .write_u32(MINOR_VERSION)
            .finish();
        self.writer.write(frame).await.map_err(ClientError::Connection)?;

        let key = WaitKey::code(ServerCode::Login.code());
        match self.waiters.wait(key, Some(self.options.reply_timeout)).await {
            Ok(ServerValue::LoginSucceeded { greeting, .. }) => Ok(greeting),
            Ok(_) => Err(ClientError::LoginFailed("unexpected login reply".into())),
            Err(WaiterError::Thrown(reason)) => Err(ClientError::LoginFailed(reason)),
            Err(e) => Err(ClientError::Waiter(e)),
        }
    }

    pub async fn set_listen_port(&self, port: u16) -> std::result::Result<(), crate::error::ConnectionError> {
        let frame = MessageBuilder::new(ServerCode::SetListenPort.code())
            .write_u32(port as u32)
            .finish();
        self.writer.write(frame).await
    }

    pub async fn set_shared_counts(&self, directories: u32, files: u32) -> std::result::Result<(), crate::error::ConnectionError> {
        let frame = MessageBuilder::new(ServerCode::SharedCounts.code())
            .write_u32(directories)
            .write_u32(files)
            .finish();
        self.writer.write(frame).await
    }

    pub async fn join_room(&self, name: &str) -> Result<()> {
        let frame = MessageBuilder::new(ServerCode::JoinRoom.code())
            .write_string(name)
            .finish();
        self.writer.write(frame).await.map_err(ClientError::Connection)?;
        let key = WaitKey::qualified(ServerCode::JoinRoom.code(), [name]);
        self.waiters
            .wait(key, Some(self.options.reply_timeout))
            .await
            .map_err(ClientError::Waiter)?;
        Ok(())
    }

    pub async fn leave_room(&self, name: &str) -> std::result::Result<(), crate::error::ConnectionError> {
        let frame = MessageBuilder::new(ServerCode::LeaveRoom.code())
            .write_string(name)
            .finish();
        self.writer.write(frame).await
    }

    pub async fn send_room_message(&self, name: &str, message: &str) -> std::result::Result<(), crate::error::ConnectionError> {
        let frame = MessageBuilder::new(ServerCode::SayInRoom.code())
            .write_string(name)
            .write_string(message)
            .finish();
        self.writer.write(frame).await
    }

    pub async fn get_room_list(&self) -> Result<Vec<String>> {
        let frame = MessageBuilder::new(ServerCode::RoomList.code()).finish();
        self.writer.write(frame).await.map_err(ClientError::Connection)?;
        match self
            .waiters
            .wait(WaitKey::code(ServerCode::RoomList.code()), Some(self.options.reply_timeout))
            .await
            .map_err(ClientError::Waiter)?
        {
            ServerValue::RoomList(rooms) => Ok(rooms),
            _ => Ok(Vec::new()),
        }
    }

    /// Sends `AddUser(username)` and reports whether the server knows the
    /// account, subscribing us to its status updates as a side effect
    /// (§4.F "AddUser").
    pub async fn add_user(&self, username: &str) -> Result<bool> {
        self.request_user(username, ServerCode::AddUser).await.map(|v| match v {
            ServerValue::UserExists(exists) => exists,
            _ => false,
        })
    }

    pub async fn get_user_status(&self, username: &str) -> Result<UserStatus> {
        self.request_user(username, ServerCode::GetUserStatus).await.map(|v| match v {
            ServerValue::UserStatus(s) => s,
            _ => UserStatus::Offline,
        })
    }

    pub async fn get_user_stats(&self, username: &str) -> Result<UserStats> {
        self.request_user(username, ServerCode::GetUserStats).await.map(|v| match v {
            ServerValue::UserStats(s) => s,
            _ => UserStats {
                average_speed: 0,
                upload_count: 0,
                file_count: 0,
                directory_count: 0,
            },
        })
    }

    async fn request_user(&self, username: &str, code: ServerCode) -> Result<ServerValue> {
        let frame = MessageBuilder::new(code.code()).write_string(username).finish();
        self.writer.write(frame).await.map_err(ClientError::Connection)?;
        let key = WaitKey::qualified(code.code(), [username]);
        self.waiters
            .wait(key, Some(self.options.reply_timeout))
            .await
            .map_err(ClientError::Waiter)
    }

    /// Dispatches one decoded server-dialect frame per the table in §4.F.
    pub fn handle_frame(&self, frame: Bytes) {
        let mut msg = match MessageReader::from_frame(frame) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("malformed server frame: {}", e);
                return;
            }
        };
        match ServerCode::from_code(msg.read_code()) {
            ServerCode::Login => {
                let success = msg.read_bool().unwrap_or(false);
                if success {
                    let greeting = msg.read_string().unwrap_or_default();
                    let ip = msg.read_ipv4().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                    self.waiters.complete(
                        &WaitKey::code(ServerCode::Login.code()),
                        ServerValue::LoginSucceeded {
                            greeting: greeting.clone(),
                            ip,
                        },
                    );
                    let _ = self.events.send(ServerEvent::LoggedIn { greeting });
                } else {
                    let reason = msg.read_string().unwrap_or_default();
                    self.waiters.throw(
                        &WaitKey::code(ServerCode::Login.code()),
                        WaiterError::Thrown(reason.clone()),
                    );
                    self.writer.disconnect(format!("login failed: {}", reason));
                    let _ = self.events.send(ServerEvent::LoginFailed { reason });
                }
            }
            ServerCode::GetPeerAddress => {
                if let Ok(username) = msg.read_string() {
                    if let (Ok(ip), Ok(port)) = (msg.read_ipv4(), msg.read_u32()) {
                        let key = WaitKey::qualified(ServerCode::GetPeerAddress.code(), [username]);
                        self.waiters.complete(&key, ServerValue::PeerAddress(SocketAddr::new(ip.into(), port as u16)));
                    }
                }
            }
            ServerCode::AddUser => {
                if let Ok(username) = msg.read_string() {
                    let exists = msg.read_bool().unwrap_or(false);
                    let key = WaitKey::qualified(ServerCode::AddUser.code(), [username]);
                    self.waiters.complete(&key, ServerValue::UserExists(exists));
                }
            }
            ServerCode::GetUserStatus => {
                if let Ok(username) = msg.read_string() {
                    let status = UserStatus::from_code(msg.read_u32().unwrap_or(0));
                    let key = WaitKey::qualified(ServerCode::GetUserStatus.code(), [username]);
                    self.waiters.complete(&key, ServerValue::UserStatus(status));
                }
            }
            ServerCode::GetUserStats => {
                if let Ok(username) = msg.read_string() {
                    let average_speed = msg.read_u32().unwrap_or(0);
                    let upload_count = msg.read_i64().unwrap_or(0) as u64;
                    let file_count = msg.read_u32().unwrap_or(0);
                    let directory_count = msg.read_u32().unwrap_or(0);
                    let key = WaitKey::qualified(ServerCode::GetUserStats.code(), [username]);
                    self.waiters.complete(
                        &key,
                        ServerValue::UserStats(UserStats {
                            average_speed,
                            upload_count,
                            file_count,
                            directory_count,
                        }),
                    );
                }
            }
            ServerCode::PrivateMessage => {
                let id = msg.read_u32().unwrap_or(0);
                let _timestamp = msg.read_u32();
                let username = msg.read_string().unwrap_or_default();
                let message = msg.read_string().unwrap_or_default();
                if self.options.auto_ack_private_messages {
                    let ack = MessageBuilder::new(ServerCode::AckPrivateMessage.code())
                        .write_u32(id)
                        .finish();
                    let writer = self.writer.clone();
                    tokio::spawn(async move {
                        let _ = writer.write(ack).await;
                    });
                }
                let _ = self.events.send(ServerEvent::PrivateMessage { id, username, message });
            }
            ServerCode::RoomList => {
                let count = msg.read_u32().unwrap_or(0) as usize;
                let mut rooms = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if let Ok(name) = msg.read_string() {
                        rooms.push(name);
                    }
                }
                self.waiters.complete(&WaitKey::code(ServerCode::RoomList.code()), ServerValue::RoomList(rooms));
            }
            ServerCode::JoinRoom => {
                if let Ok(name) = msg.read_string() {
                    let key = WaitKey::qualified(ServerCode::JoinRoom.code(), [name.clone()]);
                    self.waiters.complete(&key, ServerValue::Joined);
                    let _ = self.events.send(ServerEvent::RoomJoined { name });
                }
            }
            ServerCode::SayInRoom => {
                if let (Ok(room), Ok(username), Ok(message)) = (msg.read_string(), msg.read_string(), msg.read_string()) {
                    let _ = self.events.send(ServerEvent::RoomMessage { room, username, message });
                }
            }
            ServerCode::ConnectToPeer => {
                if let (Ok(username), Ok(conn_type_str)) = (msg.read_string(), msg.read_string()) {
                    if let (Ok(ip), Ok(port), Ok(token)) = (msg.read_ipv4(), msg.read_u32(), msg.read_u32()) {
                        if let Some(conn_type) = PeerConnectionType::parse(&conn_type_str) {
                            let _ = self.events.send(ServerEvent::ConnectToPeer {
                                token,
                                username,
                                addr: SocketAddr::new(ip.into(), port as u16),
                                conn_type,
                            });
                        }
                    }
                }
            }
            ServerCode::NetInfo => {
                let count = msg.read_u32().unwrap_or(0) as usize;
                let mut candidates = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if let (Ok(username), Ok(ip), Ok(port)) = (msg.read_string(), msg.read_ipv4(), msg.read_u32()) {
                        candidates.push((username, SocketAddr::new(ip.into(), port as u16)));
                    }
                }
                let _ = self.events.send(ServerEvent::NetInfo(candidates));
            }
            ServerCode::KickedFromServer => {
                self.writer.disconnect("kicked from server");
                let _ = self.events.send(ServerEvent::KickedFromServer);
            }
            ServerCode::PrivilegedUsers => {
                let count = msg.read_u32().unwrap_or(0) as usize;
                let mut users = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if let Ok(name) = msg.read_string() {
                        users.push(name);
                    }
                }
                let _ = self.events.send(ServerEvent::PrivilegedUsers(users));
            }
            ServerCode::ParentMinSpeed => {
                let v = msg.read_u32().unwrap_or(0);
                self.waiters.complete(&WaitKey::code(ServerCode::ParentMinSpeed.code()), ServerValue::ParentMinSpeed(v));
            }
            ServerCode::ParentSpeedRatio => {
                let v = msg.read_u32().unwrap_or(0);
                self.waiters.complete(&WaitKey::code(ServerCode::ParentSpeedRatio.code()), ServerValue::ParentSpeedRatio(v));
            }
            ServerCode::WishlistInterval => {
                let v = msg.read_u32().unwrap_or(0);
                self.waiters.complete(&WaitKey::code(ServerCode::WishlistInterval.code()), ServerValue::WishlistInterval(v));
            }
            other => {
                log::trace!("unhandled server code {:?}", other);
            }
        }
    }

    pub fn writer(&self) -> ConnectionWriter {
        self.writer.clone()
    }

    pub fn waiters(&self) -> Arc<WaiterRegistry<ServerValue>> {
        Arc::clone(&self.waiters)
    }
}

/// Adapts [`ServerSession`] to the [`ServerRequests`] interface the
/// connection manager depends on, without the manager holding a concrete
/// reference back to the session (Design Notes: arena-style ownership).
pub struct SessionServerRequests {
    pub writer: ConnectionWriter,
    pub waiters: Arc<WaiterRegistry<ServerValue>>,
    pub reply_timeout: Duration,
    pub resolvers: Arc<dyn Resolvers>,
}

impl ServerRequests for SessionServerRequests {
    fn get_peer_address<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, std::result::Result<SocketAddr, crate::error::ManagerError>> {
        Box::pin(async move {
            if let Some(addr) = self.resolvers.cached_endpoint(username) {
                return Ok(addr);
            }
            let frame = MessageBuilder::new(ServerCode::GetPeerAddress.code())
                .write_string(username)
                .finish();
            self.writer.write(frame).await?;
            let key = WaitKey::qualified(ServerCode::GetPeerAddress.code(), [username]);
            match self.waiters.wait(key, Some(self.reply_timeout)).await? {
                ServerValue::PeerAddress(addr) if addr.ip() == std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED) => {
                    self.resolvers.invalidate_endpoint(username);
                    Err(crate::error::ManagerError::PeerOffline)
                }
                ServerValue::PeerAddress(addr) => {
                    self.resolvers.cache_endpoint(username, addr);
                    Ok(addr)
                }
                _ => Err(crate::error::ManagerError::ConnectionTimeout),
            }
        })
    }

    fn connect_to_peer(&self, token: u32, username: &str, conn_type: PeerConnectionType) {
        let frame = MessageBuilder::new(ServerCode::ConnectToPeer.code())
            .write_u32(token)
            .write_string(username)
            .write_string(conn_type.as_str())
            .finish();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write(frame).await {
                log::debug!("failed to send ConnectToPeer: {}", e);
            }
        });
    }

    /// Reflects the distributed overlay's branch level/root upstream once
    /// a parent is validated (§4.G).
    fn report_branch(&self, level: i32, root: &str) {
        let level_frame = MessageBuilder::new(ServerCode::BranchLevel.code()).write_u32(level as u32).finish();
        let root_frame = MessageBuilder::new(ServerCode::BranchRoot.code()).write_string(root).finish();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write(level_frame).await {
                log::debug!("failed to send BranchLevel: {}", e);
                return;
            }
            if let Err(e) = writer.write(root_frame).await {
                log::debug!("failed to send BranchRoot: {}", e);
            }
        });
    }

    fn report_parent_ip(&self, ip: std::net::Ipv4Addr) {
        let frame = MessageBuilder::new(ServerCode::ParentsIp.code()).write_ipv4(ip).finish();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write(frame).await {
                log::debug!("failed to send ParentsIp: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn login_success_completes_with_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
            let (mut reader, writer) = conn.split();
            let request = reader.read_message().await.unwrap();
            let mut req = MessageReader::from_frame(request).unwrap();
            assert_eq!(req.read_code(), ServerCode::Login.code());
            let _username = req.read_string().unwrap();

            let reply = MessageBuilder::new(ServerCode::Login.code())
                .write_bool(true)
                .write_string("welcome")
                .write_ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1))
                .finish();
            writer.write(reply).await.unwrap();
        });

        let client = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let (mut reader, writer) = client.split();
        let (session, _events) = ServerSession::new(writer, SessionOptions::default());

        let session = Arc::new(session);
        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Ok(frame) = reader.read_message().await {
                reader_session.handle_frame(frame);
            }
        });

        let greeting = session.login("alice", "secret").await.unwrap();
        assert_eq!(greeting, "welcome");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn login_failure_reports_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
            let (mut reader, writer) = conn.split();
            let _request = reader.read_message().await.unwrap();
            let reply = MessageBuilder::new(ServerCode::Login.code())
                .write_bool(false)
                .write_string("INVALIDPASS")
                .finish();
            writer.write(reply).await.unwrap();
        });

        let client = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let (mut reader, writer) = client.split();
        let (session, _events) = ServerSession::new(writer, SessionOptions::default());
        let session = Arc::new(session);
        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Ok(frame) = reader.read_message().await {
                reader_session.handle_frame(frame);
            }
        });

        let result = session.login("alice", "wrong").await;
        assert!(matches!(result, Err(ClientError::LoginFailed(_))));

        let write_result = session.writer().write(Bytes::new()).await;
        assert!(matches!(write_result, Err(crate::error::ConnectionError::Disconnected)));
    }

    #[tokio::test]
    async fn kicked_from_server_tears_down_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
            let (_reader, writer) = conn.split();
            let frame = MessageBuilder::new(ServerCode::KickedFromServer.code()).finish();
            writer.write(frame).await.unwrap();
        });

        let client = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let (mut reader, writer) = client.split();
        let (session, mut events) = ServerSession::new(writer, SessionOptions::default());
        let session = Arc::new(session);

        let frame = reader.read_message().await.unwrap();
        session.handle_frame(frame);

        assert!(matches!(events.recv().await, Some(ServerEvent::KickedFromServer)));
        let write_result = session.writer().write(Bytes::new()).await;
        assert!(matches!(write_result, Err(crate::error::ConnectionError::Disconnected)));
    }
}
