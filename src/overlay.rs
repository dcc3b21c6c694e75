//! Distributed search overlay (§4.G): maintains the parent link, accepts
//! children, propagates branch metadata, and relays searches down the
//! broadcast tree.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Notify;

use crate::codec::distributed::DistributedCode;
use crate::codec::{MessageBuilder, MessageReader};
use crate::connection::ConnectionWriter;
use crate::manager::{ConnectionManager, PeerConnection, ServerRequests};
use crate::resolvers::Resolvers;
use crate::session::ServerEvent;
use crate::token::TokenFactory;
use crate::types::Username;

/// A child's outbound broadcast queue: bounded to `depth` frames, dropping
/// the oldest on overflow (§5 "the distributed broadcast queue is bounded
/// ... overflow drops oldest"), drained by a single forwarder task so
/// writes to that child stay in enqueue order.
struct ChildQueue {
    writer: ConnectionWriter,
    queue: Mutex<VecDeque<Bytes>>,
    depth: usize,
    notify: Notify,
}

impl ChildQueue {
    fn spawn(writer: ConnectionWriter, depth: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            writer,
            queue: Mutex::new(VecDeque::new()),
            depth,
            notify: Notify::new(),
        });
        let worker = Arc::clone(&queue);
        tokio::spawn(async move {
            loop {
                let next = worker.queue.lock().unwrap().pop_front();
                match next {
                    Some(frame) => {
                        if worker.writer.write(frame).await.is_err() {
                            break;
                        }
                    }
                    None => worker.notify.notified().await,
                }
            }
        });
        queue
    }

    fn enqueue(&self, frame: Bytes) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.depth {
            queue.pop_front();
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }
}

/// The distributed overlay's connection state (§4.G "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Disconnected,
    Connecting,
    Connected,
    Orphaned,
}

struct Parent {
    username: Username,
    writer: ConnectionWriter,
    addr: SocketAddr,
    server: Arc<dyn ServerRequests>,
    branch_level: i32,
    branch_root: String,
    got_level: bool,
    got_root: bool,
    /// Set once both `BranchLevel` and `BranchRoot` have arrived from this
    /// parent; only then is the link reported upstream and the overlay
    /// considered `Connected` (§4.G "parent is valid once branch metadata
    /// is known").
    validated: bool,
}

/// Tuning knobs for the overlay (§6.4 "Client").
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub accept_children: bool,
    pub child_limit: usize,
    pub broadcast_queue_depth: usize,
    pub deduplicate_search_requests: bool,
    pub dedup_capacity: usize,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            accept_children: true,
            child_limit: 50,
            broadcast_queue_depth: 100,
            deduplicate_search_requests: true,
            dedup_capacity: 1000,
        }
    }
}

/// The distributed overlay. Owns the parent link and the admitted child
/// set; relays search requests per §4.G.
pub struct DistributedOverlay {
    options: OverlayOptions,
    state: Mutex<OverlayState>,
    parent: Mutex<Option<Parent>>,
    children: Mutex<HashMap<Username, Arc<ChildQueue>>>,
    seen_requests: Mutex<LruCache<(Username, u32), ()>>,
    tokens: Arc<TokenFactory>,
}

impl DistributedOverlay {
    pub fn new(options: OverlayOptions, tokens: Arc<TokenFactory>) -> Arc<Self> {
        let capacity = std::num::NonZeroUsize::new(options.dedup_capacity.max(1)).unwrap();
        Arc::new(Self {
            state: Mutex::new(OverlayState::Disconnected),
            seen_requests: Mutex::new(LruCache::new(capacity)),
            children: Mutex::new(HashMap::new()),
            parent: Mutex::new(None),
            options,
            tokens,
        })
    }

    pub fn state(&self) -> OverlayState {
        *self.state.lock().unwrap()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.lock().unwrap().is_some()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Handles a `NetInfo` candidate list: if currently parentless,
    /// races a distributed connection to every candidate and adopts the
    /// first to present a valid branch level/root (§4.G "Parent
    /// selection").
    pub async fn handle_net_info(
        self: &Arc<Self>,
        candidates: Vec<(Username, SocketAddr)>,
        manager: Arc<ConnectionManager>,
        server: Arc<dyn ServerRequests>,
    ) {
        if self.has_parent() || candidates.is_empty() {
            return;
        }
        *self.state.lock().unwrap() = OverlayState::Connecting;

        let mut attempts = Vec::new();
        for (username, addr) in candidates {
            let manager = Arc::clone(&manager);
            let server = Arc::clone(&server);
            attempts.push(async move {
                manager.connect_distributed(&username, addr, server).await.map(|conn| (conn, addr))
            });
        }
        let results = futures::future::join_all(attempts).await;

        for (conn, addr) in results.into_iter().flatten() {
            self.adopt_parent(conn, addr, Arc::clone(&server)).await;
            if self.has_parent() {
                break;
            }
        }
        if !self.has_parent() {
            *self.state.lock().unwrap() = OverlayState::Disconnected;
        }
    }

    /// Installs `conn` as the parent link. The overlay stays `Connecting`
    /// (not `Connected`) until `BranchLevel`/`BranchRoot` frames arrive and
    /// the link is validated in [`Self::maybe_validate_parent`].
    async fn adopt_parent(self: &Arc<Self>, conn: PeerConnection, addr: SocketAddr, server: Arc<dyn ServerRequests>) {
        let mut parent = self.parent.lock().unwrap();
        if parent.is_some() {
            conn.writer.disconnect("already adopted a parent");
            return;
        }
        *parent = Some(Parent {
            username: conn.username,
            writer: conn.writer,
            addr,
            server,
            branch_level: -1,
            branch_root: String::new(),
            got_level: false,
            got_root: false,
            validated: false,
        });
    }

    /// Once both branch fields have arrived for the current parent,
    /// reports the branch level/root and parent IP upstream and marks the
    /// overlay `Connected`. No-op if already validated or still missing a
    /// field.
    fn maybe_validate_parent(&self, parent: &mut Option<Parent>) -> bool {
        let Some(p) = parent.as_mut() else { return false };
        if p.validated || !p.got_level || !p.got_root {
            return false;
        }
        p.validated = true;
        p.server.report_branch(p.branch_level, &p.branch_root);
        if let SocketAddr::V4(v4) = p.addr {
            p.server.report_parent_ip(*v4.ip());
        }
        true
    }

    /// Admits an inbound distributed ("D") connection as a child, subject
    /// to `child_limit` (§4.G "Child admission").
    pub async fn admit_child(&self, conn: PeerConnection) {
        if !self.options.accept_children {
            conn.writer.disconnect("distributed children disabled");
            return;
        }
        {
            let children = self.children.lock().unwrap();
            if children.len() >= self.options.child_limit {
                conn.writer.disconnect("child limit reached");
                return;
            }
        }
        let (level, root) = {
            let parent = self.parent.lock().unwrap();
            parent
                .as_ref()
                .map(|p| (p.branch_level, p.branch_root.clone()))
                .unwrap_or((-1, String::new()))
        };
        let writer = conn.writer.clone();
        let queue = ChildQueue::spawn(writer.clone(), self.options.broadcast_queue_depth);
        self.children.lock().unwrap().insert(conn.username, queue);

        let level_frame = MessageBuilder::new(DistributedCode::BranchLevel.code())
            .write_u32(level as u32)
            .finish();
        let root_frame = MessageBuilder::new(DistributedCode::BranchRoot.code())
            .write_string(&root)
            .finish();
        let _ = writer.write(level_frame).await;
        let _ = writer.write(root_frame).await;
    }

    pub fn remove_child(&self, username: &str) {
        self.children.lock().unwrap().remove(username);
    }

    /// Dispatches one decoded distributed-dialect frame (§4.G).
    pub async fn handle_frame(
        self: &Arc<Self>,
        from: &str,
        frame: Bytes,
        resolvers: &Arc<dyn Resolvers>,
        dial_and_deliver: impl Fn(Username, u32, crate::types::SearchResponse) + Send + 'static,
    ) {
        let mut msg = match MessageReader::from_frame(frame.clone()) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("malformed distributed frame from {}: {}", from, e);
                return;
            }
        };
        match DistributedCode::from_code(msg.read_code()) {
            DistributedCode::Ping => {
                let token = self.tokens.next_token();
                let reply = MessageBuilder::new(DistributedCode::Ping.code())
                    .write_u32(token)
                    .finish();
                if let Some(parent) = self.parent.lock().unwrap().as_ref() {
                    let writer = parent.writer.clone();
                    tokio::spawn(async move {
                        let _ = writer.write(reply).await;
                    });
                }
            }
            DistributedCode::BranchLevel => {
                if let Ok(level) = msg.read_u32() {
                    let mut parent = self.parent.lock().unwrap();
                    if let Some(p) = parent.as_mut() {
                        if p.username == from {
                            p.branch_level = level as i32;
                            p.got_level = true;
                        }
                    }
                    if self.maybe_validate_parent(&mut parent) {
                        *self.state.lock().unwrap() = OverlayState::Connected;
                    }
                }
            }
            DistributedCode::BranchRoot => {
                if let Ok(root) = msg.read_string() {
                    let mut parent = self.parent.lock().unwrap();
                    if let Some(p) = parent.as_mut() {
                        if p.username == from {
                            p.branch_root = root;
                            p.got_root = true;
                        }
                    }
                    if self.maybe_validate_parent(&mut parent) {
                        *self.state.lock().unwrap() = OverlayState::Connected;
                    }
                }
            }
            DistributedCode::SearchRequest => {
                let username = match msg.read_string() {
                    Ok(u) => u,
                    Err(_) => return,
                };
                let token = match msg.read_u32() {
                    Ok(t) => t,
                    Err(_) => return,
                };
                let query = match msg.read_string() {
                    Ok(q) => q,
                    Err(_) => return,
                };

                if self.options.deduplicate_search_requests {
                    let mut seen = self.seen_requests.lock().unwrap();
                    let key = (username.clone(), token);
                    if seen.get(&key).is_some() {
                        return;
                    }
                    seen.put(key, ());
                }

                self.broadcast_to_children(frame);

                let response = resolvers.search_response(&username, token, &query).await;
                if let Some(response) = response {
                    if !response.files.is_empty() {
                        dial_and_deliver(username, token, response);
                    }
                }
            }
            other => log::trace!("unhandled distributed code {:?} from {}", other, from),
        }
    }

    /// Enqueues `frame` to every admitted child's bounded broadcast queue
    /// (§4.G "Search relay", §5 "overflow drops oldest").
    fn broadcast_to_children(&self, frame: Bytes) {
        for queue in self.children.lock().unwrap().values() {
            queue.enqueue(frame.clone());
        }
    }

    pub fn orphan(&self) {
        *self.parent.lock().unwrap() = None;
        *self.state.lock().unwrap() = OverlayState::Orphaned;
    }

    /// Reacts to a distributed-dialect connection closing: drops the
    /// parent link into `Orphaned` if it was the parent, else just forgets
    /// the child (§4.G "a parent disconnect... re-solicit"; the next
    /// server-pushed `NetInfo` re-solicits, same as a fresh join).
    pub fn handle_disconnect(&self, username: &str) {
        let was_parent = self.parent.lock().unwrap().as_ref().is_some_and(|p| p.username == username);
        if was_parent {
            self.orphan();
        } else {
            self.remove_child(username);
        }
    }
}

/// Converts a `ServerEvent::NetInfo` payload into a call to
/// [`DistributedOverlay::handle_net_info`]; kept as a free function so the
/// client's event loop can pattern-match once and delegate.
pub fn is_net_info(event: &ServerEvent) -> Option<&[(Username, SocketAddr)]> {
    match event {
        ServerEvent::NetInfo(candidates) => Some(candidates),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use crate::error::ManagerError;
    use futures::future::BoxFuture;
    use tokio::net::TcpListener;

    struct RecordingServer {
        branch: Mutex<Option<(i32, String)>>,
        parent_ip: Mutex<Option<std::net::Ipv4Addr>>,
    }

    impl RecordingServer {
        fn new() -> Self {
            Self {
                branch: Mutex::new(None),
                parent_ip: Mutex::new(None),
            }
        }
    }

    impl ServerRequests for RecordingServer {
        fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, std::result::Result<SocketAddr, ManagerError>> {
            Box::pin(async { Err(ManagerError::PeerOffline) })
        }
        fn connect_to_peer(&self, _token: u32, _username: &str, _conn_type: crate::codec::server::PeerConnectionType) {}
        fn report_branch(&self, level: i32, root: &str) {
            *self.branch.lock().unwrap() = Some((level, root.to_string()));
        }
        fn report_parent_ip(&self, ip: std::net::Ipv4Addr) {
            *self.parent_ip.lock().unwrap() = Some(ip);
        }
    }

    async fn loopback_peer_connection(username: &str) -> PeerConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let (_reader, writer) = conn.split();
        PeerConnection {
            username: username.to_string(),
            writer,
        }
    }

    #[tokio::test]
    async fn parent_is_not_connected_until_branch_metadata_arrives() {
        let overlay = DistributedOverlay::new(OverlayOptions::default(), Arc::new(TokenFactory::default()));
        let recording = Arc::new(RecordingServer::new());
        let server: Arc<dyn ServerRequests> = Arc::clone(&recording) as Arc<dyn ServerRequests>;
        let conn = loopback_peer_connection("parent").await;
        let addr: SocketAddr = "127.0.0.1:2234".parse().unwrap();

        overlay.adopt_parent(conn, addr, Arc::clone(&server)).await;
        assert!(overlay.has_parent());
        assert_eq!(overlay.state(), OverlayState::Disconnected);

        let resolvers: Arc<dyn Resolvers> = Arc::new(crate::resolvers::NoopResolvers);
        let level_frame = MessageBuilder::new(DistributedCode::BranchLevel.code()).write_u32(3).finish();
        overlay.handle_frame("parent", level_frame.slice(4..), &resolvers, |_, _, _| {}).await;
        assert_eq!(overlay.state(), OverlayState::Disconnected);
        assert!(recording.branch.lock().unwrap().is_none());

        let root_frame = MessageBuilder::new(DistributedCode::BranchRoot.code()).write_string("root-user").finish();
        overlay.handle_frame("parent", root_frame.slice(4..), &resolvers, |_, _, _| {}).await;
        assert_eq!(overlay.state(), OverlayState::Connected);
        assert_eq!(*recording.branch.lock().unwrap(), Some((3, "root-user".to_string())));
        assert_eq!(*recording.parent_ip.lock().unwrap(), Some(std::net::Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[tokio::test]
    async fn losing_the_parent_orphans_the_overlay() {
        let overlay = DistributedOverlay::new(OverlayOptions::default(), Arc::new(TokenFactory::default()));
        let server: Arc<dyn ServerRequests> = Arc::new(RecordingServer::new());
        let conn = loopback_peer_connection("parent").await;
        let addr: SocketAddr = "127.0.0.1:2234".parse().unwrap();
        overlay.adopt_parent(conn, addr, server).await;
        assert!(overlay.has_parent());

        overlay.handle_disconnect("parent");
        assert!(!overlay.has_parent());
        assert_eq!(overlay.state(), OverlayState::Orphaned);
    }

    #[tokio::test]
    async fn child_admission_respects_the_limit() {
        let overlay = DistributedOverlay::new(
            OverlayOptions {
                child_limit: 0,
                ..OverlayOptions::default()
            },
            Arc::new(TokenFactory::default()),
        );
        assert_eq!(overlay.child_count(), 0);
        assert_eq!(overlay.state(), OverlayState::Disconnected);
    }

    #[test]
    fn initial_state_has_no_parent() {
        let overlay = DistributedOverlay::new(OverlayOptions::default(), Arc::new(TokenFactory::default()));
        assert!(!overlay.has_parent());
        assert_eq!(overlay.state(), OverlayState::Disconnected);
    }
}
