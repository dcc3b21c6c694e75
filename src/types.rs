//! Domain types shared across the session, overlay and transfer engine
//! (§3 "Data model"), grounded in the shape of the teacher's
//! `storage_info::FileInfo`: plain data, no behavior beyond small derived
//! accessors.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A Soulseek account name. Plain `String` alias rather than a newtype:
/// the wire format never distinguishes it from any other length-prefixed
/// string, and every call site already threads it alongside other string
/// fields.
pub type Username = String;

/// The direction of a file transfer, from this client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Download,
    Upload,
}

/// Terminal outcomes a transfer can complete with (§4.H.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCompletion {
    Succeeded,
    Cancelled,
    TimedOut,
    Errored(String),
    Rejected(String),
}

/// The transfer state machine (§4.H.2): `None -> Queued -> Initializing ->
/// InProgress -> Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Initializing,
    InProgress,
    Completed(TransferCompletion),
}

/// A typed attribute of a shared file (bit-depth, bit-rate, sample-rate,
/// VBR flag, duration). Modeled as a flat optional-field struct rather than
/// a tagged enum list: the wire format sends a fixed attribute-kind/value
/// pair sequence and most files populate only a handful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub bitrate: Option<u32>,
    pub duration_secs: Option<u32>,
    pub is_vbr: Option<bool>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u32>,
}

/// One file entry within a [`SearchResponse`] or browse listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: FileAttributes,
}

/// A peer's response to a distributed or direct file search (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub username: Username,
    pub token: u32,
    pub files: Vec<FileEntry>,
    pub free_upload_slots: bool,
    pub upload_speed: u32,
    pub queue_length: u32,
}

/// A directory and its files, as returned by a browse or folder-contents
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseDirectory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

/// The full share listing returned by a peer's `BrowseResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseResponse {
    pub directories: Vec<BrowseDirectory>,
}

/// Free-text user description/picture/upload-slot info (`UserInfoResponse`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfoResponse {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub has_free_upload_slot: bool,
}

/// A user's online/away/offline status, as reported by `GetUserStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Away,
            2 => Self::Online,
            _ => Self::Offline,
        }
    }
}

/// Aggregate share/speed statistics for a user (`GetUserStats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStats {
    pub average_speed: u32,
    pub upload_count: u64,
    pub file_count: u32,
    pub directory_count: u32,
}

/// A resolved (IP, port) endpoint for a peer, as returned by
/// `GetPeerAddress` and cached by [`crate::manager`]'s endpoint cache hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: SocketAddr,
}

/// A rolling sample used to compute transfer throughput and ETA (§4.H.2,
/// "rolling average speed"). Kept deliberately small: a fixed window of
/// (instant, cumulative bytes) samples, trimmed to the last
/// `WINDOW` duration on each push.
#[derive(Debug, Clone)]
pub struct SpeedSample {
    samples: Vec<(Instant, u64)>,
    window: Duration,
}

impl SpeedSample {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: Vec::new(),
            window,
        }
    }

    /// Records that `total_bytes` have now been transferred in total.
    pub fn push(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push((now, total_bytes));
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            self.samples.retain(|(t, _)| *t >= cutoff);
        }
    }

    /// Bytes per second averaged over the retained window, or 0 if fewer
    /// than two samples have been recorded.
    pub fn bytes_per_sec(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some((t0, b0)), Some((t1, b1))) if t1 > t0 => {
                let elapsed = t1.duration_since(*t0).as_secs_f64();
                (*b1 as f64 - *b0 as f64) / elapsed
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_status_decodes_known_codes() {
        assert_eq!(UserStatus::from_code(0), UserStatus::Offline);
        assert_eq!(UserStatus::from_code(1), UserStatus::Away);
        assert_eq!(UserStatus::from_code(2), UserStatus::Online);
    }

    #[test]
    fn speed_sample_computes_average_over_window() {
        let mut s = SpeedSample::new(Duration::from_secs(10));
        let t0 = Instant::now();
        s.push(t0, 0);
        s.push(t0 + Duration::from_secs(1), 1000);
        assert!((s.bytes_per_sec() - 1000.0).abs() < 1.0);
    }
}
