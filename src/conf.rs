//! Configuration for the client and its parts (§6.4), in the shape of the
//! teacher crate's `conf.rs`: one aggregate [`Conf`] made up of
//! per-subsystem structs, each with a `default` that documents why a
//! particular value was chosen.

use std::time::Duration;

use crate::connection::ConnectionOptions;

/// The aggregate configuration for a [`crate::client::Client`].
#[derive(Clone, Default)]
pub struct Conf {
    pub connection: ConnectionOptions,
    pub client: ClientConf,
    pub search: SearchConf,
    pub transfer: TransferConf,
}

/// Configuration for the client's listener, distributed overlay
/// participation, and automatic server-driven behaviors.
#[derive(Clone)]
pub struct ClientConf {
    /// TCP port to bind for inbound peer connections, if `enable_listener`.
    /// Must fall in `[1024, 65535]`.
    pub listen_port: u16,
    pub enable_listener: bool,
    pub enable_distributed_network: bool,
    pub accept_distributed_children: bool,
    /// Maximum concurrent distributed children; 0 disallows all.
    pub distributed_child_limit: usize,
    /// Bound on the per-child broadcast queue; must be >= 100.
    pub distributed_broadcast_queue_depth: usize,
    pub deduplicate_search_requests: bool,
    pub auto_ack_private_messages: bool,
    pub auto_ack_privilege_notifications: bool,
    pub accept_private_room_invitations: bool,
    /// The concurrent-peer-connection cap enforced by the connection
    /// manager's eviction sweep (§4.E).
    pub max_peer_connections: usize,
    /// How often the manager's eviction sweep runs.
    pub eviction_interval: Duration,
    /// How long a delayed distributed search response is retained waiting
    /// for the soliciting peer to connect (§4.H.5).
    pub delayed_response_retention: Duration,
    /// How long a duplicate (username, token) distributed search request
    /// is remembered for dedup purposes.
    pub search_request_dedup_capacity: usize,
    pub minimum_diagnostic_level: log::Level,
}

impl Default for ClientConf {
    fn default() -> Self {
        Self {
            // an arbitrary but commonly free port in the dynamic/private
            // range; callers overwhelmingly override this
            listen_port: 2234,
            enable_listener: true,
            enable_distributed_network: true,
            accept_distributed_children: true,
            // generous enough to carry a meaningful slice of the broadcast
            // tree without starving the uplink of bandwidth
            distributed_child_limit: 50,
            distributed_broadcast_queue_depth: 100,
            deduplicate_search_requests: true,
            auto_ack_private_messages: true,
            auto_ack_privilege_notifications: true,
            accept_private_room_invitations: true,
            max_peer_connections: 500,
            eviction_interval: Duration::from_secs(15),
            delayed_response_retention: Duration::from_secs(180),
            search_request_dedup_capacity: 1000,
            minimum_diagnostic_level: log::Level::Info,
        }
    }
}

/// Per-call defaults for [`crate::client::Client::search`] (overridable per
/// call via `SearchOptions`).
#[derive(Clone)]
pub struct SearchConf {
    pub search_timeout: Duration,
    pub minimum_response_file_count: usize,
    pub response_limit: Option<usize>,
}

impl Default for SearchConf {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(5),
            minimum_response_file_count: 1,
            response_limit: None,
        }
    }
}

/// Transfer-engine timeouts (§4.H.2) and buffer sizing.
#[derive(Clone)]
pub struct TransferConf {
    pub peer_response_timeout: Duration,
    pub read_gap_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for TransferConf {
    fn default() -> Self {
        Self {
            peer_response_timeout: Duration::from_secs(30),
            read_gap_timeout: Duration::from_secs(15),
            read_buffer_size: 16384,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let conf = Conf::default();
        assert!(conf.client.listen_port >= 1024);
        assert!(conf.client.distributed_broadcast_queue_depth >= 100);
        assert!(conf.connection.write_queue_size > 0);
    }
}
