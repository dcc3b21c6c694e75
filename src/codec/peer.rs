//! Peer dialect message codes (§6.1).

/// Message codes exchanged directly between two peers over a message
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCode {
    BrowseRequest,
    BrowseResponse,
    UserInfoRequest,
    UserInfoResponse,
    FolderContents,
    TransferRequest,
    TransferResponse,
    PlaceInQueueRequest,
    PlaceInQueueResponse,
    UploadFailed,
    QueueFailed,
    UploadDenied,
    SearchRequest,
    SearchResponse,
    Other(u32),
}

impl PeerCode {
    pub fn code(self) -> u32 {
        match self {
            Self::BrowseRequest => 4,
            Self::BrowseResponse => 5,
            Self::UserInfoRequest => 15,
            Self::UserInfoResponse => 16,
            Self::FolderContents => 36,
            Self::TransferRequest => 40,
            Self::TransferResponse => 41,
            Self::PlaceInQueueRequest => 44,
            Self::PlaceInQueueResponse => 43,
            Self::UploadFailed => 46,
            Self::QueueFailed => 50,
            Self::UploadDenied => 51,
            Self::SearchRequest => 8,
            Self::SearchResponse => 9,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            4 => Self::BrowseRequest,
            5 => Self::BrowseResponse,
            15 => Self::UserInfoRequest,
            16 => Self::UserInfoResponse,
            36 => Self::FolderContents,
            40 => Self::TransferRequest,
            41 => Self::TransferResponse,
            44 => Self::PlaceInQueueRequest,
            43 => Self::PlaceInQueueResponse,
            46 => Self::UploadFailed,
            50 => Self::QueueFailed,
            51 => Self::UploadDenied,
            8 => Self::SearchRequest,
            9 => Self::SearchResponse,
            other => Self::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips() {
        for code in [
            PeerCode::TransferRequest,
            PeerCode::TransferResponse,
            PeerCode::SearchResponse,
            PeerCode::BrowseResponse,
        ] {
            assert_eq!(PeerCode::from_code(code.code()), code);
        }
    }
}
