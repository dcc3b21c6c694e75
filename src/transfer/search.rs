//! Token-filtered search response streaming (§4.H.1).
//!
//! A search registers a token and a result channel; every `PeerSearchResponse`
//! the transfer engine decodes is routed here by token and filtered per the
//! caller's [`SearchOptions`] before being handed to the consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::peer::PeerCode;
use crate::codec::server::ServerCode;
use crate::codec::{MessageBuilder, MessageReader};
use crate::connection::ConnectionWriter;
use crate::error::{ConnectionError, CodecError};
use crate::token::TokenFactory;
use crate::types::{FileAttributes, FileEntry, SearchResponse, Username};

/// Per-call overrides for [`SearchEngine::search`] (§6.4 defaults live in
/// `conf::SearchConf`).
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub search_timeout: Duration,
    pub minimum_response_file_count: usize,
    pub response_limit: Option<usize>,
}

struct ActiveSearch {
    token: u32,
    tx: mpsc::UnboundedSender<SearchResponse>,
    options: SearchOptions,
    received: AtomicUsize,
}

/// Owns the set of in-flight searches, keyed by the token allocated for
/// each (§4.D: the token factory is shared with the rest of the client so
/// every outstanding correlation ID is drawn from one sequence).
pub struct SearchEngine {
    tokens: Arc<TokenFactory>,
    active: Mutex<HashMap<u32, Arc<ActiveSearch>>>,
}

impl SearchEngine {
    pub fn new(tokens: Arc<TokenFactory>) -> Arc<Self> {
        Arc::new(Self {
            tokens,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates a token, sends `FileSearch(token, query)` to the server,
    /// and returns a channel of matching responses that closes once
    /// `options.search_timeout` elapses (§4.H.1 steps 1-4).
    pub async fn search(
        self: &Arc<Self>,
        query: &str,
        options: SearchOptions,
        server_writer: &ConnectionWriter,
    ) -> std::result::Result<(u32, mpsc::UnboundedReceiver<SearchResponse>), ConnectionError> {
        let token = self.tokens.next_token();
        let (tx, rx) = mpsc::unbounded_channel();
        self.active.lock().unwrap().insert(
            token,
            Arc::new(ActiveSearch {
                token,
                tx,
                options: options.clone(),
                received: AtomicUsize::new(0),
            }),
        );

        let frame = MessageBuilder::new(ServerCode::FileSearch.code())
            .write_u32(token)
            .write_string(query)
            .finish();
        if let Err(e) = server_writer.write(frame).await {
            self.active.lock().unwrap().remove(&token);
            return Err(e);
        }

        let engine = Arc::clone(self);
        let timeout = options.search_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.active.lock().unwrap().remove(&token);
        });

        Ok((token, rx))
    }

    /// Ends a search early, e.g. on caller cancellation.
    pub fn cancel(&self, token: u32) {
        self.active.lock().unwrap().remove(&token);
    }

    /// Decodes and routes one inbound `PeerSearchResponse` frame, applying
    /// the registered options' minimum file count and response cap
    /// (§4.H.1 step 3). A no-op if no search is registered under the
    /// decoded token (it has already completed, timed out, or was never
    /// ours).
    pub fn handle_response_frame(&self, frame: Bytes) -> std::result::Result<(), CodecError> {
        let response = decode_search_response(frame)?;
        let mut active = self.active.lock().unwrap();
        if let Some(search) = active.get(&response.token).cloned() {
            if response.files.len() < search.options.minimum_response_file_count {
                return Ok(());
            }
            let count = search.received.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = search.tx.send(response);
            if let Some(limit) = search.options.response_limit {
                if count >= limit {
                    active.remove(&search.token);
                }
            }
        }
        Ok(())
    }
}

/// File attribute kind codes used in the legacy wire format's fixed
/// (kind, value) attribute sequence.
pub(crate) mod attr_kind {
    pub const BITRATE: u32 = 0;
    pub const DURATION_SECS: u32 = 1;
    pub const IS_VBR: u32 = 2;
    pub const SAMPLE_RATE: u32 = 4;
    pub const BIT_DEPTH: u32 = 5;
}

/// Encodes a [`SearchResponse`] as a compressed `PeerSearchResponse`
/// frame (§4.H.1, §6.1 "SearchResponse (compressed)").
pub fn encode_search_response(local_username: &str, response: &SearchResponse) -> Bytes {
    let mut builder = MessageBuilder::new(PeerCode::SearchResponse.code())
        .write_string(local_username)
        .write_u32(response.token)
        .write_u32(response.files.len() as u32);
    for file in &response.files {
        builder = builder
            .write_u8(1)
            .write_string(&file.filename)
            .write_i64(file.size as i64)
            .write_string(&file.extension);
        let attrs = &file.attributes;
        let mut pairs = Vec::new();
        if let Some(v) = attrs.bitrate {
            pairs.push((attr_kind::BITRATE, v));
        }
        if let Some(v) = attrs.duration_secs {
            pairs.push((attr_kind::DURATION_SECS, v));
        }
        if let Some(v) = attrs.is_vbr {
            pairs.push((attr_kind::IS_VBR, v as u32));
        }
        if let Some(v) = attrs.sample_rate {
            pairs.push((attr_kind::SAMPLE_RATE, v));
        }
        if let Some(v) = attrs.bit_depth {
            pairs.push((attr_kind::BIT_DEPTH, v));
        }
        builder = builder.write_u32(pairs.len() as u32);
        for (kind, value) in pairs {
            builder = builder.write_u32(kind).write_u32(value);
        }
    }
    builder
        .write_bool(response.free_upload_slots)
        .write_u32(response.upload_speed)
        .write_i64(response.queue_length as i64)
        .compress()
        .finish()
}

/// Decodes a (possibly compressed) `PeerSearchResponse` frame.
pub fn decode_search_response(frame: Bytes) -> std::result::Result<SearchResponse, CodecError> {
    let mut reader = MessageReader::from_frame(frame)?;
    reader.expect_code(PeerCode::SearchResponse.code())?;
    reader.decompress()?;

    let username: Username = reader.read_string()?;
    let token = reader.read_u32()?;
    let file_count = reader.read_u32()? as usize;
    let mut files = Vec::with_capacity(file_count.min(4096));
    for _ in 0..file_count {
        let _code = reader.read_u8()?;
        let filename = reader.read_string()?;
        let size = reader.read_i64()? as u64;
        let extension = reader.read_string()?;
        let attr_count = reader.read_u32()? as usize;
        let mut attributes = FileAttributes::default();
        for _ in 0..attr_count.min(4096) {
            let kind = reader.read_u32()?;
            let value = reader.read_u32()?;
            match kind {
                attr_kind::BITRATE => attributes.bitrate = Some(value),
                attr_kind::DURATION_SECS => attributes.duration_secs = Some(value),
                attr_kind::IS_VBR => attributes.is_vbr = Some(value != 0),
                attr_kind::SAMPLE_RATE => attributes.sample_rate = Some(value),
                attr_kind::BIT_DEPTH => attributes.bit_depth = Some(value),
                _ => {}
            }
        }
        files.push(FileEntry {
            filename,
            size,
            extension,
            attributes,
        });
    }
    let free_upload_slots = reader.read_bool()?;
    let upload_speed = reader.read_u32()?;
    let queue_length = reader.read_i64()? as u32;

    Ok(SearchResponse {
        username,
        token,
        files,
        free_upload_slots,
        upload_speed,
        queue_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(token: u32, file_count: usize) -> SearchResponse {
        SearchResponse {
            username: "bob".into(),
            token,
            files: (0..file_count)
                .map(|i| FileEntry {
                    filename: format!("track{}.mp3", i),
                    size: 1000 + i as u64,
                    extension: "mp3".into(),
                    attributes: FileAttributes {
                        bitrate: Some(320),
                        duration_secs: Some(180),
                        is_vbr: Some(false),
                        sample_rate: None,
                        bit_depth: None,
                    },
                })
                .collect(),
            free_upload_slots: true,
            upload_speed: 1_000_000,
            queue_length: 0,
        }
    }

    #[test]
    fn search_response_round_trips() {
        let response = sample_response(7, 2);
        let frame = encode_search_response(&response.username, &response);
        let decoded = decode_search_response(frame.slice(4..)).unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn responses_below_minimum_file_count_are_dropped() {
        let engine = SearchEngine::new(Arc::new(TokenFactory::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = crate::connection::Connection::from_accepted(
                stream,
                peer,
                crate::connection::ConnectionOptions::default(),
            );
            let (mut reader, _writer) = conn.split();
            let _ = reader.read_message().await;
        });
        let client = crate::connection::Connection::connect(addr, crate::connection::ConnectionOptions::default())
            .await
            .unwrap();
        let (_reader, writer) = client.split();

        let options = SearchOptions {
            search_timeout: Duration::from_millis(200),
            minimum_response_file_count: 2,
            response_limit: None,
        };
        let (token, mut rx) = engine.search("needle", options, &writer).await.unwrap();

        let sparse = sample_response(token, 1);
        let frame = encode_search_response("bob", &sparse);
        engine.handle_response_frame(frame.slice(4..)).unwrap();
        assert!(rx.try_recv().is_err());

        let rich = sample_response(token, 2);
        let frame = encode_search_response("bob", &rich);
        engine.handle_response_frame(frame.slice(4..)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), rich);
    }
}
