//! Server dialect message codes (§6.1).

/// Message codes exchanged with the central server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCode {
    Login,
    GetPeerAddress,
    AddUser,
    GetUserStatus,
    PrivateMessage,
    AckPrivateMessage,
    ConnectToPeer,
    FileSearch,
    NetInfo,
    SetListenPort,
    SharedCounts,
    RoomList,
    JoinRoom,
    GetUserStats,
    PrivilegedUsers,
    ParentsIp,
    ParentMinSpeed,
    ParentSpeedRatio,
    WishlistInterval,
    BranchLevel,
    BranchRoot,
    KickedFromServer,
    LeaveRoom,
    SayInRoom,
    /// Any code this crate does not assign semantics to; retains the raw
    /// value so unknown server chatter can still be logged.
    Other(u32),
}

impl ServerCode {
    pub fn code(self) -> u32 {
        match self {
            Self::Login => 1,
            Self::GetPeerAddress => 3,
            Self::AddUser => 5,
            Self::GetUserStatus => 7,
            Self::PrivateMessage => 13,
            Self::AckPrivateMessage => 14,
            Self::ConnectToPeer => 18,
            Self::FileSearch => 22,
            Self::NetInfo => 26,
            Self::SetListenPort => 32,
            Self::SharedCounts => 35,
            Self::RoomList => 64,
            Self::JoinRoom => 65,
            Self::GetUserStats => 36,
            Self::PrivilegedUsers => 69,
            Self::ParentsIp => 73,
            Self::ParentMinSpeed => 83,
            Self::ParentSpeedRatio => 84,
            Self::WishlistInterval => 104,
            Self::BranchLevel => 126,
            Self::BranchRoot => 127,
            Self::KickedFromServer => 41,
            Self::LeaveRoom => 66,
            Self::SayInRoom => 67,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Login,
            3 => Self::GetPeerAddress,
            5 => Self::AddUser,
            7 => Self::GetUserStatus,
            13 => Self::PrivateMessage,
            14 => Self::AckPrivateMessage,
            18 => Self::ConnectToPeer,
            22 => Self::FileSearch,
            26 => Self::NetInfo,
            32 => Self::SetListenPort,
            35 => Self::SharedCounts,
            64 => Self::RoomList,
            65 => Self::JoinRoom,
            36 => Self::GetUserStats,
            69 => Self::PrivilegedUsers,
            73 => Self::ParentsIp,
            83 => Self::ParentMinSpeed,
            84 => Self::ParentSpeedRatio,
            104 => Self::WishlistInterval,
            126 => Self::BranchLevel,
            127 => Self::BranchRoot,
            41 => Self::KickedFromServer,
            66 => Self::LeaveRoom,
            67 => Self::SayInRoom,
            other => Self::Other(other),
        }
    }
}

/// The peer connection type requested in a `ConnectToPeer` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionType {
    /// `"P"` — a peer message connection.
    Peer,
    /// `"F"` — a transfer (file) connection.
    Transfer,
    /// `"D"` — a distributed (search overlay) connection.
    Distributed,
}

impl PeerConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "P",
            Self::Transfer => "F",
            Self::Distributed => "D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(Self::Peer),
            "F" => Some(Self::Transfer),
            "D" => Some(Self::Distributed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips() {
        for code in [
            ServerCode::Login,
            ServerCode::GetPeerAddress,
            ServerCode::ConnectToPeer,
            ServerCode::NetInfo,
            ServerCode::BranchRoot,
        ] {
            assert_eq!(ServerCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn connection_type_round_trips() {
        for ty in [
            PeerConnectionType::Peer,
            PeerConnectionType::Transfer,
            PeerConnectionType::Distributed,
        ] {
            assert_eq!(PeerConnectionType::parse(ty.as_str()), Some(ty));
        }
    }
}
