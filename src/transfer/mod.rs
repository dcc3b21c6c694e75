//! File transfer engine (§4.H): searches, downloads, uploads, place-in-queue
//! reporting, and delayed distributed search-response delivery.
//!
//! Mirrors the teacher's `torrent`/`download` split in spirit: [`search`]
//! owns the search-response fan-out, this module owns the per-(peer, file)
//! transfer state machines and the inbound peer-frame dispatch that drives
//! both.

pub mod search;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::codec::peer::PeerCode;
use crate::codec::{MessageBuilder, MessageReader};
use crate::conf::TransferConf;
use crate::error::TransferError;
use crate::manager::{ConnectionManager, ServerRequests};
use crate::resolvers::{EnqueueDecision, Resolvers};
use crate::token::TokenFactory;
use crate::transfer::search::SearchEngine;
use crate::types::{SearchResponse, SpeedSample, TransferCompletion, TransferState, Username};
use crate::waiter::{WaitKey, WaiterRegistry};

const WIRE_DOWNLOAD: u32 = 0;
const WIRE_UPLOAD: u32 = 1;

/// A still-live delayed search response keyed by (username, token), paired
/// with the response body for re-delivery.
type PendingSearchResponses = Vec<((Username, u32), SearchResponse)>;

/// State change and throughput notifications fanned out to the embedder
/// (§6.2 "transfer-state-changed", "transfer-progress").
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged {
        username: Username,
        filename: String,
        state: TransferState,
    },
    Progress {
        username: Username,
        filename: String,
        bytes_transferred: u64,
        total: u64,
        bytes_per_sec: f64,
    },
}

/// A reply the transfer engine is waiting on for a peer-initiated
/// `TransferRequest` (§4.H.2 steps 4-5): either the direct answer to our
/// own request, or a queue/upload failure reported against (username,
/// filename) rather than a token.
#[derive(Debug, Clone)]
enum TransferReply {
    Allowed { size: u64 },
    Denied { reason: String },
    QueueFailed { reason: String },
    UploadFailed,
}

struct DownloadRecord {
    state: Mutex<TransferState>,
    /// Fired by the inbound-`TransferRequest(Upload, ...)` handler once the
    /// peer decides to serve a queued download (§4.H.2 step 5); carries the
    /// token and size the peer announced.
    ready: Mutex<Option<oneshot::Sender<(u32, u64)>>>,
}

struct UploadRecord {
    state: Mutex<TransferState>,
}

/// Owns every in-flight transfer plus the search engine, and dispatches
/// inbound peer-dialect frames relevant to either.
pub struct TransferEngine {
    manager: Arc<ConnectionManager>,
    server: Arc<dyn ServerRequests>,
    tokens: Arc<TokenFactory>,
    resolvers: Arc<dyn Resolvers>,
    conf: TransferConf,
    peer_waiters: WaiterRegistry<TransferReply>,
    downloads: Mutex<HashMap<(Username, String), Arc<DownloadRecord>>>,
    uploads: Mutex<HashMap<(Username, String), Arc<UploadRecord>>>,
    /// Distributed search responses we couldn't deliver immediately because
    /// dialing the soliciting peer failed (§4.H.5), retained for
    /// `ClientConf::delayed_response_retention`.
    delayed_responses: Mutex<HashMap<(Username, u32), (SearchResponse, Instant)>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    pub search: Arc<SearchEngine>,
}

impl TransferEngine {
    pub fn new(
        manager: Arc<ConnectionManager>,
        server: Arc<dyn ServerRequests>,
        tokens: Arc<TokenFactory>,
        resolvers: Arc<dyn Resolvers>,
        conf: TransferConf,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            server,
            search: SearchEngine::new(Arc::clone(&tokens)),
            tokens,
            resolvers,
            conf,
            peer_waiters: WaiterRegistry::new(),
            downloads: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            delayed_responses: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn emit_state(&self, username: &str, filename: &str, state: TransferState) {
        let _ = self.events.send(TransferEvent::StateChanged {
            username: username.to_string(),
            filename: filename.to_string(),
            state,
        });
    }

    /// Downloads `filename` from `username`, running the full queue/serve
    /// state machine of §4.H.2. `cancel` resolving at any point aborts the
    /// operation with [`TransferError::Cancelled`].
    pub async fn download(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        cancel: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<Vec<u8>, TransferError> {
        let key = (username.to_string(), filename.to_string());
        {
            let mut downloads = self.downloads.lock().unwrap();
            if downloads.contains_key(&key) {
                return Err(TransferError::DuplicateTransfer);
            }
            downloads.insert(
                key.clone(),
                Arc::new(DownloadRecord {
                    state: Mutex::new(TransferState::Queued),
                    ready: Mutex::new(None),
                }),
            );
        }
        self.emit_state(username, filename, TransferState::Queued);

        let cancel = Box::pin(cancel);
        let result = self.run_download(username, filename, cancel).await;

        self.downloads.lock().unwrap().remove(&key);
        match &result {
            Ok(_) => self.emit_state(username, filename, TransferState::Completed(TransferCompletion::Succeeded)),
            Err(TransferError::Cancelled) => {
                self.emit_state(username, filename, TransferState::Completed(TransferCompletion::Cancelled))
            }
            Err(TransferError::Timeout) => {
                self.emit_state(username, filename, TransferState::Completed(TransferCompletion::TimedOut))
            }
            Err(TransferError::Rejected(reason)) => self.emit_state(
                username,
                filename,
                TransferState::Completed(TransferCompletion::Rejected(reason.clone())),
            ),
            Err(e) => self.emit_state(
                username,
                filename,
                TransferState::Completed(TransferCompletion::Errored(e.to_string())),
            ),
        }
        result
    }

    async fn run_download(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        mut cancel: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    ) -> std::result::Result<Vec<u8>, TransferError> {
        let local_token = self.tokens.next_token();
        let peer = self
            .manager
            .get_or_add_peer_connection(username, Arc::clone(&self.server))
            .await?;

        let frame = MessageBuilder::new(PeerCode::TransferRequest.code())
            .write_u32(WIRE_DOWNLOAD)
            .write_u32(local_token)
            .write_string(filename)
            .finish();
        peer.writer.write(frame).await?;

        let key = (username.to_string(), filename.to_string());
        let record = self.downloads.lock().unwrap().get(&key).cloned().expect("registered above");

        let (remote_token, size) = tokio::select! {
            r = self.await_transfer_allowed(username, filename, local_token, &record) => r?,
            _ = &mut cancel => return Err(TransferError::Cancelled),
        };

        *record.state.lock().unwrap() = TransferState::Initializing;
        self.emit_state(username, filename, TransferState::Initializing);

        let addr = self.server.get_peer_address(username).await?;
        let (mut reader, _writer) = tokio::select! {
            r = self.manager.get_transfer_connection(username, remote_token, addr, Arc::clone(&self.server)) => r?,
            _ = &mut cancel => return Err(TransferError::Cancelled),
        };

        // the peer writes its token back as a 4-byte preamble before
        // streaming raw bytes (§8 scenarios 4-5); purely informational.
        let _ = reader.read_length(4).await?;

        *record.state.lock().unwrap() = TransferState::InProgress;
        self.emit_state(username, filename, TransferState::InProgress);

        let mut data = Vec::with_capacity(size.min(64 * 1024 * 1024) as usize);
        let mut speed = SpeedSample::new(Duration::from_secs(5));
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(self.conf.read_buffer_size as u64) as usize;
            let chunk = tokio::select! {
                r = tokio::time::timeout(self.conf.read_gap_timeout, reader.read_length(want)) => {
                    match r {
                        Ok(Ok(bytes)) => bytes,
                        Ok(Err(e)) => return Err(TransferError::from(e)),
                        Err(_) => return Err(TransferError::Timeout),
                    }
                }
                _ = &mut cancel => return Err(TransferError::Cancelled),
            };
            if chunk.is_empty() {
                return Err(TransferError::from(crate::error::ConnectionError::Eof));
            }
            data.extend_from_slice(&chunk);
            remaining -= chunk.len() as u64;
            speed.push(Instant::now(), data.len() as u64);
            let _ = self.events.send(TransferEvent::Progress {
                username: username.to_string(),
                filename: filename.to_string(),
                bytes_transferred: data.len() as u64,
                total: size,
                bytes_per_sec: speed.bytes_per_sec(),
            });
        }
        Ok(data)
    }

    /// Races the immediate `TransferResponse`/`QueueFailed`/`UploadFailed`
    /// replies to our own request against the later unsolicited
    /// `TransferRequest(Upload, ...)` the peer sends once it dequeues us
    /// (§4.H.2 steps 4-5).
    async fn await_transfer_allowed(
        &self,
        username: &str,
        filename: &str,
        local_token: u32,
        record: &Arc<DownloadRecord>,
    ) -> std::result::Result<(u32, u64), TransferError> {
        let key_resp = WaitKey::qualified(PeerCode::TransferResponse.code(), [local_token.to_string()]);
        let key_qf = WaitKey::qualified(PeerCode::QueueFailed.code(), [username.to_string(), filename.to_string()]);
        let key_uf = WaitKey::qualified(PeerCode::UploadFailed.code(), [username.to_string(), filename.to_string()]);
        let timeout = Some(self.conf.peer_response_timeout);

        let reply = tokio::select! {
            r = self.peer_waiters.wait(key_resp, timeout) => r,
            r = self.peer_waiters.wait(key_qf, timeout) => r,
            r = self.peer_waiters.wait(key_uf, timeout) => r,
        };

        match reply? {
            TransferReply::Allowed { size } => Ok((local_token, size)),
            TransferReply::Denied { reason } => {
                if reason.eq_ignore_ascii_case("queued.") || reason.eq_ignore_ascii_case("queued") {
                    let (tx, rx) = oneshot::channel();
                    *record.ready.lock().unwrap() = Some(tx);
                    rx.await.map_err(|_| TransferError::Failed("peer disconnected while queued".into()))
                } else {
                    Err(TransferError::Rejected(reason))
                }
            }
            TransferReply::QueueFailed { reason } => Err(TransferError::Rejected(reason)),
            TransferReply::UploadFailed => Err(TransferError::Failed("upload failed".into())),
        }
    }

    /// Cancels a caller-driven request before the peer has replied
    /// (currently handled via the `cancel` future passed to
    /// [`download`](Self::download); exposed for symmetry with
    /// [`search::SearchEngine::cancel`]).
    pub fn cancel_download(&self, username: &str, filename: &str) {
        self.downloads.lock().unwrap().remove(&(username.to_string(), filename.to_string()));
    }

    /// Uploads `data` to `username` as `filename` once the embedder has
    /// decided to serve a previously queued request (§4.H.3 steps 2-3).
    pub async fn begin_upload(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        data: &[u8],
    ) -> std::result::Result<(), TransferError> {
        let key = (username.to_string(), filename.to_string());
        let record = self
            .uploads
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(TransferError::StateError("no queued upload for this peer/file"))?;

        let local_token = self.tokens.next_token();
        let peer = self
            .manager
            .get_or_add_peer_connection(username, Arc::clone(&self.server))
            .await?;
        let frame = MessageBuilder::new(PeerCode::TransferRequest.code())
            .write_u32(WIRE_UPLOAD)
            .write_u32(local_token)
            .write_string(filename)
            .write_i64(data.len() as i64)
            .finish();
        peer.writer.write(frame).await?;

        let key_resp = WaitKey::qualified(PeerCode::TransferResponse.code(), [local_token.to_string()]);
        let reply = self.peer_waiters.wait(key_resp, Some(self.conf.peer_response_timeout)).await?;
        match reply {
            TransferReply::Allowed { .. } => {}
            TransferReply::Denied { reason } => return Err(TransferError::Rejected(reason)),
            _ => return Err(TransferError::Failed("unexpected reply to upload request".into())),
        }

        *record.state.lock().unwrap() = TransferState::Initializing;
        self.emit_state(username, filename, TransferState::Initializing);

        let addr = self.server.get_peer_address(username).await?;
        let (_reader, writer) = self
            .manager
            .get_transfer_connection(username, local_token, addr, Arc::clone(&self.server))
            .await?;
        writer.write(Bytes::copy_from_slice(&local_token.to_le_bytes())).await?;

        *record.state.lock().unwrap() = TransferState::InProgress;
        self.emit_state(username, filename, TransferState::InProgress);
        writer.write(Bytes::copy_from_slice(data)).await?;

        *record.state.lock().unwrap() = TransferState::Completed(TransferCompletion::Succeeded);
        self.emit_state(username, filename, TransferState::Completed(TransferCompletion::Succeeded));
        self.uploads.lock().unwrap().remove(&key);
        Ok(())
    }

    /// Handles an inbound `TransferRequest(direction=Download, ...)`: there
    /// is no separate `QueueDownload` wire message, so this frame both
    /// requests and (on accept) queues the download in one step (§4.H.3
    /// step 1, resolved against the absence of a distinct code in §6.1).
    async fn handle_incoming_download_request(self: &Arc<Self>, username: &str, token: u32, filename: String) {
        let addr = match self.server.get_peer_address(username).await {
            Ok(a) => a,
            Err(_) => return,
        };
        let decision = self.resolvers.enqueue_download(username, addr, &filename).await;
        let peer = match self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await {
            Ok(p) => p,
            Err(_) => return,
        };
        match decision {
            EnqueueDecision::Reject(reason) => {
                let frame = MessageBuilder::new(PeerCode::TransferResponse.code())
                    .write_u32(token)
                    .write_bool(false)
                    .write_string(&reason)
                    .finish();
                let _ = peer.writer.write(frame).await;
            }
            EnqueueDecision::Accept => {
                self.uploads.lock().unwrap().insert(
                    (username.to_string(), filename.clone()),
                    Arc::new(UploadRecord {
                        state: Mutex::new(TransferState::Queued),
                    }),
                );
                let frame = MessageBuilder::new(PeerCode::TransferResponse.code())
                    .write_u32(token)
                    .write_bool(false)
                    .write_string("Queued.")
                    .finish();
                let _ = peer.writer.write(frame).await;
            }
        }
    }

    /// Handles the peer's unsolicited `TransferRequest(direction=Upload,
    /// ...)` notifying us it is now ready to serve a download we queued
    /// earlier (§4.H.2 step 5).
    async fn handle_upload_ready(&self, username: &str, token: u32, filename: String, size: u64) {
        let record = self.downloads.lock().unwrap().get(&(username.to_string(), filename)).cloned();
        if let Some(record) = record {
            if let Some(tx) = record.ready.lock().unwrap().take() {
                let _ = tx.send((token, size));
            }
        }
    }

    /// Dispatches one decoded `PeerCode` frame (§4.H.2-4.H.5).
    pub async fn handle_peer_frame(self: &Arc<Self>, username: &str, frame: Bytes) {
        let mut msg = match MessageReader::from_frame(frame.clone()) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("malformed peer frame from {}: {}", username, e);
                return;
            }
        };
        match PeerCode::from_code(msg.read_code()) {
            PeerCode::TransferRequest => {
                let direction = match msg.read_u32() {
                    Ok(d) => d,
                    Err(_) => return,
                };
                let token = match msg.read_u32() {
                    Ok(t) => t,
                    Err(_) => return,
                };
                let filename = match msg.read_string() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                if direction == WIRE_UPLOAD {
                    let size = msg.read_i64().unwrap_or(0) as u64;
                    self.handle_upload_ready(username, token, filename, size).await;
                } else {
                    self.handle_incoming_download_request(username, token, filename).await;
                }
            }
            PeerCode::TransferResponse => {
                let token = match msg.read_u32() {
                    Ok(t) => t,
                    Err(_) => return,
                };
                let allowed = msg.read_bool().unwrap_or(false);
                let reply = if allowed {
                    let size = msg.read_i64().unwrap_or(0) as u64;
                    TransferReply::Allowed { size }
                } else {
                    TransferReply::Denied {
                        reason: msg.read_string().unwrap_or_default(),
                    }
                };
                self.peer_waiters
                    .complete(&WaitKey::qualified(PeerCode::TransferResponse.code(), [token.to_string()]), reply);
            }
            PeerCode::QueueFailed => {
                let filename = match msg.read_string() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let reason = msg.read_string().unwrap_or_default();
                let key = WaitKey::qualified(
                    PeerCode::QueueFailed.code(),
                    [username.to_string(), filename],
                );
                self.peer_waiters.complete(&key, TransferReply::QueueFailed { reason });
            }
            PeerCode::UploadFailed => {
                let filename = match msg.read_string() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let key = WaitKey::qualified(
                    PeerCode::UploadFailed.code(),
                    [username.to_string(), filename],
                );
                self.peer_waiters.complete(&key, TransferReply::UploadFailed);
            }
            PeerCode::UploadDenied => {
                let filename = match msg.read_string() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let reason = msg.read_string().unwrap_or_default();
                let key = WaitKey::qualified(
                    PeerCode::UploadFailed.code(),
                    [username.to_string(), filename],
                );
                self.peer_waiters.complete(&key, TransferReply::Denied { reason });
            }
            PeerCode::PlaceInQueueRequest => {
                let filename = match msg.read_string() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let engine = Arc::clone(self);
                let username = username.to_string();
                tokio::spawn(async move {
                    engine.reply_place_in_queue(&username, filename).await;
                });
            }
            PeerCode::PlaceInQueueResponse => {
                if let Ok(filename) = msg.read_string() {
                    if let Ok(position) = msg.read_u32() {
                        let key = WaitKey::qualified(
                            PeerCode::PlaceInQueueResponse.code(),
                            [username.to_string(), filename],
                        );
                        let _ = position;
                        // place-in-queue responses are consumed as a
                        // one-shot wait by callers of a future
                        // `request_place_in_queue`; no caller exists yet
                        // so this is a documented no-op sink.
                        let _ = key;
                    }
                }
            }
            PeerCode::SearchResponse => {
                if let Err(e) = self.search.handle_response_frame(frame.clone()) {
                    log::debug!("malformed search response from {}: {}", username, e);
                }
            }
            other => log::trace!("unhandled peer code {:?} from {}", other, username),
        }
    }

    async fn reply_place_in_queue(self: Arc<Self>, username: &str, filename: String) {
        let addr = match self.server.get_peer_address(username).await {
            Ok(a) => a,
            Err(_) => return,
        };
        let position = self.resolvers.place_in_queue(username, addr, &filename).await;
        let Some(position) = position else { return };
        let peer = match self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let frame = MessageBuilder::new(PeerCode::PlaceInQueueResponse.code())
            .write_string(&filename)
            .write_u32(position)
            .finish();
        let _ = peer.writer.write(frame).await;
    }

    /// Attempts to deliver a distributed search match to `username`
    /// immediately; on failure to connect, retains it for
    /// `TransferConf`'s retention window so a later peer connection can
    /// flush it (§4.H.5).
    pub async fn deliver_search_response(self: &Arc<Self>, username: Username, token: u32, response: SearchResponse) {
        if self.try_deliver(&username, &response).await {
            return;
        }
        self.resolvers.cache_pending_search_response(&username, token, &response);
        self.delayed_responses
            .lock()
            .unwrap()
            .insert((username, token), (response, Instant::now()));
    }

    /// Seeds `delayed_responses` from [`Resolvers::recover_pending_search_responses`],
    /// so matches that couldn't be delivered before the last disconnect
    /// get another chance once this (freshly rebuilt) engine comes up
    /// (§6.3 "search_response_cache").
    pub async fn recover_pending_responses(self: &Arc<Self>) {
        let recovered = self.resolvers.recover_pending_search_responses().await;
        if recovered.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut delayed = self.delayed_responses.lock().unwrap();
        for (username, token, response) in recovered {
            delayed.insert((username, token), (response, now));
        }
    }

    async fn try_deliver(&self, username: &str, response: &SearchResponse) -> bool {
        let peer = match self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await {
            Ok(p) => p,
            Err(_) => return false,
        };
        let frame = search::encode_search_response(username, response);
        peer.writer.write(frame).await.is_ok()
    }

    /// Periodically retried from the client's background tasks: attempts
    /// delivery of every still-live delayed search response and drops
    /// entries past `retention` (§4.H.5 "retried ... discarded past the
    /// retention window"). No dedicated "peer (re)connected" signal exists
    /// on the manager, so this sweep is the delivery mechanism rather than
    /// a per-connection hook.
    pub async fn sweep_delayed_responses(self: &Arc<Self>, retention: Duration) {
        let now = Instant::now();
        let (pending, expired): (PendingSearchResponses, Vec<(Username, u32)>) = {
            let mut delayed = self.delayed_responses.lock().unwrap();
            let mut expired = Vec::new();
            delayed.retain(|key, (_, at)| {
                let alive = now.duration_since(*at) < retention;
                if !alive {
                    expired.push(key.clone());
                }
                alive
            });
            (delayed.iter().map(|(k, (r, _))| (k.clone(), r.clone())).collect(), expired)
        };
        for (username, token) in expired {
            self.resolvers.clear_pending_search_response(&username, token);
        }
        for (key, response) in pending {
            if self.try_deliver(&key.0, &response).await {
                self.delayed_responses.lock().unwrap().remove(&key);
                self.resolvers.clear_pending_search_response(&key.0, key.1);
            }
        }
    }
}
