//! Browse and user-info peer requests (§6.2 `browse`, `get_user_info`):
//! a thin request/reply layer over the same message-connection pool the
//! transfer engine uses, correlated by message code alone since a peer
//! has at most one outstanding request of each kind at a time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::codec::peer::PeerCode;
use crate::codec::{MessageBuilder, MessageReader};
use crate::error::{CodecError, ManagerError};
use crate::manager::{ConnectionManager, ServerRequests};
use crate::resolvers::Resolvers;
use crate::transfer::search::attr_kind;
use crate::types::{BrowseDirectory, BrowseResponse, FileAttributes, FileEntry, UserInfoResponse};
use crate::waiter::{WaitKey, WaiterRegistry};

#[derive(Debug, Clone)]
enum PeerValue {
    Browse(BrowseResponse),
    UserInfo(UserInfoResponse),
}

/// Owns the waiter registry backing [`PeerRequests::browse`] and
/// [`PeerRequests::user_info`].
pub struct PeerRequests {
    manager: Arc<ConnectionManager>,
    server: Arc<dyn ServerRequests>,
    resolvers: Arc<dyn Resolvers>,
    waiters: WaiterRegistry<PeerValue>,
    reply_timeout: Duration,
}

impl PeerRequests {
    pub fn new(
        manager: Arc<ConnectionManager>,
        server: Arc<dyn ServerRequests>,
        resolvers: Arc<dyn Resolvers>,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            server,
            resolvers,
            waiters: WaiterRegistry::new(),
            reply_timeout,
        })
    }

    pub async fn browse(&self, username: &str) -> std::result::Result<BrowseResponse, ManagerError> {
        let peer = self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await?;
        let frame = MessageBuilder::new(PeerCode::BrowseRequest.code()).finish();
        peer.writer.write(frame).await?;
        let key = WaitKey::code(PeerCode::BrowseResponse.code());
        match self.waiters.wait(key, Some(self.reply_timeout)).await? {
            PeerValue::Browse(response) => Ok(response),
            _ => Ok(BrowseResponse::default()),
        }
    }

    pub async fn user_info(&self, username: &str) -> std::result::Result<UserInfoResponse, ManagerError> {
        let peer = self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await?;
        let frame = MessageBuilder::new(PeerCode::UserInfoRequest.code()).finish();
        peer.writer.write(frame).await?;
        let key = WaitKey::code(PeerCode::UserInfoResponse.code());
        match self.waiters.wait(key, Some(self.reply_timeout)).await? {
            PeerValue::UserInfo(response) => Ok(response),
            _ => Err(ManagerError::ConnectionTimeout),
        }
    }

    /// Dispatches a decoded `BrowseResponse`/`UserInfoResponse` frame (a
    /// reply to a request we issued), or serves an inbound
    /// `BrowseRequest`/`UserInfoRequest` (a peer asking us for our own
    /// listing/info); a no-op for any other peer code.
    pub async fn handle_peer_frame(self: &Arc<Self>, username: &str, frame: Bytes) {
        let msg = match MessageReader::from_frame(frame.clone()) {
            Ok(m) => m,
            Err(_) => return,
        };
        match PeerCode::from_code(msg.read_code()) {
            PeerCode::BrowseResponse => {
                if let Ok(response) = decode_browse_response(frame) {
                    self.waiters.complete(&WaitKey::code(PeerCode::BrowseResponse.code()), PeerValue::Browse(response));
                }
            }
            PeerCode::UserInfoResponse => {
                if let Ok(response) = decode_user_info_response(frame) {
                    self.waiters.complete(&WaitKey::code(PeerCode::UserInfoResponse.code()), PeerValue::UserInfo(response));
                }
            }
            PeerCode::BrowseRequest => {
                let this = Arc::clone(self);
                let username = username.to_string();
                tokio::spawn(async move {
                    this.reply_browse_request(&username).await;
                });
            }
            PeerCode::UserInfoRequest => {
                let this = Arc::clone(self);
                let username = username.to_string();
                tokio::spawn(async move {
                    this.reply_user_info_request(&username).await;
                });
            }
            _ => {}
        }
    }

    async fn reply_browse_request(self: Arc<Self>, username: &str) {
        let addr = match self.server.get_peer_address(username).await {
            Ok(a) => a,
            Err(_) => return,
        };
        let response = self.resolvers.browse_response(username, addr).await;
        let peer = match self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let _ = peer.writer.write(encode_browse_response(&response)).await;
    }

    async fn reply_user_info_request(self: Arc<Self>, username: &str) {
        let addr = match self.server.get_peer_address(username).await {
            Ok(a) => a,
            Err(_) => return,
        };
        let response = self.resolvers.user_info_response(username, addr).await;
        let peer = match self.manager.get_or_add_peer_connection(username, Arc::clone(&self.server)).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let _ = peer.writer.write(encode_user_info_response(&response)).await;
    }
}

fn decode_file_entry(reader: &mut MessageReader) -> std::result::Result<FileEntry, CodecError> {
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
    Ok(FileEntry {
        filename,
        size,
        extension,
        attributes,
    })
}

fn encode_file_entry(builder: MessageBuilder, file: &FileEntry) -> MessageBuilder {
    let mut attrs = Vec::new();
    if let Some(bitrate) = file.attributes.bitrate {
        attrs.push((attr_kind::BITRATE, bitrate));
    }
    if let Some(duration) = file.attributes.duration_secs {
        attrs.push((attr_kind::DURATION_SECS, duration));
    }
    if let Some(is_vbr) = file.attributes.is_vbr {
        attrs.push((attr_kind::IS_VBR, is_vbr as u32));
    }
    if let Some(sample_rate) = file.attributes.sample_rate {
        attrs.push((attr_kind::SAMPLE_RATE, sample_rate));
    }
    if let Some(bit_depth) = file.attributes.bit_depth {
        attrs.push((attr_kind::BIT_DEPTH, bit_depth));
    }
    let mut builder = builder
        .write_u8(1)
        .write_string(&file.filename)
        .write_i64(file.size as i64)
        .write_string(&file.extension)
        .write_u32(attrs.len() as u32);
    for (kind, value) in attrs {
        builder = builder.write_u32(kind).write_u32(value);
    }
    builder
}

/// Encodes our own listing as a compressed `BrowseResponse`/`FolderContents`
/// frame, mirroring [`decode_browse_response`]'s layout (§6.1).
pub fn encode_browse_response(response: &BrowseResponse) -> Bytes {
    let mut builder = MessageBuilder::new(PeerCode::BrowseResponse.code()).write_u32(response.directories.len() as u32);
    for dir in &response.directories {
        builder = builder.write_string(&dir.name).write_u32(dir.files.len() as u32);
        for file in &dir.files {
            builder = encode_file_entry(builder, file);
        }
    }
    builder.compress().finish()
}

/// Encodes our own `UserInfoResponse` frame, mirroring
/// [`decode_user_info_response`]'s layout (§6.1); not compressed.
pub fn encode_user_info_response(response: &UserInfoResponse) -> Bytes {
    let builder = MessageBuilder::new(PeerCode::UserInfoResponse.code())
        .write_string(&response.description)
        .write_bool(response.picture.is_some());
    let builder = if let Some(picture) = &response.picture {
        builder.write_u32(picture.len() as u32).write_raw(picture)
    } else {
        builder
    };
    builder
        .write_u32(response.upload_slots)
        .write_u32(response.queue_length)
        .write_bool(response.has_free_upload_slot)
        .finish()
}

/// Decodes a compressed `BrowseResponse`/`FolderContents` frame: a list of
/// directories, each with its own file list (§6.1).
pub fn decode_browse_response(frame: Bytes) -> std::result::Result<BrowseResponse, CodecError> {
    let mut reader = MessageReader::from_frame(frame)?;
    reader.expect_code(PeerCode::BrowseResponse.code())?;
    reader.decompress()?;

    let dir_count = reader.read_u32()? as usize;
    let mut directories = Vec::with_capacity(dir_count.min(4096));
    for _ in 0..dir_count {
        let name = reader.read_string()?;
        let file_count = reader.read_u32()? as usize;
        let mut files = Vec::with_capacity(file_count.min(4096));
        for _ in 0..file_count {
            files.push(decode_file_entry(&mut reader)?);
        }
        directories.push(BrowseDirectory { name, files });
    }
    Ok(BrowseResponse { directories })
}

/// Decodes a `UserInfoResponse` frame (§6.1); not compressed.
pub fn decode_user_info_response(frame: Bytes) -> std::result::Result<UserInfoResponse, CodecError> {
    let mut reader = MessageReader::from_frame(frame)?;
    reader.expect_code(PeerCode::UserInfoResponse.code())?;

    let description = reader.read_string()?;
    let has_picture = reader.read_bool()?;
    let picture = if has_picture {
        let len = reader.read_u32()? as usize;
        Some(reader.read_bytes(len)?.to_vec())
    } else {
        None
    };
    let upload_slots = reader.read_u32()?;
    let queue_length = reader.read_u32()?;
    let has_free_upload_slot = reader.read_bool()?;

    Ok(UserInfoResponse {
        description,
        picture,
        upload_slots,
        queue_length,
        has_free_upload_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_info_round_trips() {
        let frame = MessageBuilder::new(PeerCode::UserInfoResponse.code())
            .write_string("a description")
            .write_bool(false)
            .write_u32(3)
            .write_u32(0)
            .write_bool(true)
            .finish();
        let decoded = decode_user_info_response(frame.slice(4..)).unwrap();
        assert_eq!(decoded.description, "a description");
        assert_eq!(decoded.upload_slots, 3);
        assert!(decoded.has_free_upload_slot);
    }

    #[test]
    fn our_own_user_info_survives_a_round_trip_through_the_wire_encoding() {
        let response = UserInfoResponse {
            description: "sharing my collection".to_string(),
            picture: Some(vec![1, 2, 3, 4]),
            upload_slots: 2,
            queue_length: 5,
            has_free_upload_slot: false,
        };
        let frame = encode_user_info_response(&response);
        let decoded = decode_user_info_response(frame.slice(4..)).unwrap();
        assert_eq!(decoded.description, response.description);
        assert_eq!(decoded.picture, response.picture);
        assert_eq!(decoded.upload_slots, 2);
        assert_eq!(decoded.queue_length, 5);
        assert!(!decoded.has_free_upload_slot);
    }

    #[test]
    fn our_own_browse_listing_survives_a_round_trip_through_the_wire_encoding() {
        let response = BrowseResponse {
            directories: vec![BrowseDirectory {
                name: "Music".to_string(),
                files: vec![FileEntry {
                    filename: "track.mp3".to_string(),
                    size: 4_200_000,
                    extension: "mp3".to_string(),
                    attributes: FileAttributes {
                        bitrate: Some(320),
                        duration_secs: Some(210),
                        is_vbr: Some(false),
                        sample_rate: None,
                        bit_depth: None,
                    },
                }],
            }],
        };
        let frame = encode_browse_response(&response);
        let decoded = decode_browse_response(frame.slice(4..)).unwrap();
        assert_eq!(decoded.directories.len(), 1);
        assert_eq!(decoded.directories[0].name, "Music");
        let file = &decoded.directories[0].files[0];
        assert_eq!(file.filename, "track.mp3");
        assert_eq!(file.size, 4_200_000);
        assert_eq!(file.attributes.bitrate, Some(320));
        assert_eq!(file.attributes.duration_secs, Some(210));
        assert_eq!(file.attributes.is_vbr, Some(false));
    }
}
