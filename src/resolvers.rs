//! Embedder resolvers (§6.3): delegate-shaped configuration replaced with a
//! resolver trait supplied at construction, with default no-op
//! implementations (Design Notes: "delegate-based resolvers ... a resolver
//! trait/object supplied at construction, with default no-op
//! implementations").

use std::net::SocketAddr;

use futures::future::BoxFuture;

use crate::types::{BrowseResponse, SearchResponse, UserInfoResponse, Username};

/// The outcome of the embedder deciding whether to accept a queued
/// download request (§4.H.3 "Accepts or rejects via `QueueDownload`
/// handler").
#[derive(Debug, Clone)]
pub enum EnqueueDecision {
    Accept,
    /// Rejection carries a human-readable reason relayed to the peer
    /// (`QueueDownloadException`); any other embedder failure is mapped by
    /// the caller to a generic "internal error" rejection instead of
    /// leaking details (§7).
    Reject(String),
}

/// The full set of delegates an embedder may supply. Every method has a
/// default no-op/empty implementation so a `Client` can be constructed
/// without any resolver customization at all.
pub trait Resolvers: Send + Sync {
    fn browse_response<'a>(
        &'a self,
        username: &'a str,
        addr: SocketAddr,
    ) -> BoxFuture<'a, BrowseResponse> {
        let _ = (username, addr);
        Box::pin(async { BrowseResponse::default() })
    }

    fn user_info_response<'a>(
        &'a self,
        username: &'a str,
        addr: SocketAddr,
    ) -> BoxFuture<'a, UserInfoResponse> {
        let _ = (username, addr);
        Box::pin(async {
            UserInfoResponse {
                description: String::new(),
                picture: None,
                upload_slots: 0,
                queue_length: 0,
                has_free_upload_slot: false,
            }
        })
    }

    /// Returns `None` when there is nothing to report (§4.G "Search
    /// relay": only non-empty matches are sent back to the requester).
    fn search_response<'a>(
        &'a self,
        username: &'a str,
        token: u32,
        query: &'a str,
    ) -> BoxFuture<'a, Option<SearchResponse>> {
        let _ = (username, token, query);
        Box::pin(async { None })
    }

    fn enqueue_download<'a>(
        &'a self,
        username: &'a str,
        addr: SocketAddr,
        filename: &'a str,
    ) -> BoxFuture<'a, EnqueueDecision> {
        let _ = (username, addr, filename);
        Box::pin(async { EnqueueDecision::Accept })
    }

    fn place_in_queue<'a>(
        &'a self,
        username: &'a str,
        addr: SocketAddr,
        filename: &'a str,
    ) -> BoxFuture<'a, Option<u32>> {
        let _ = (username, addr, filename);
        Box::pin(async { None })
    }

    /// Memoizes username -> endpoint mappings across calls (§4.E "Optional
    /// `UserEndpointCache` hook"). Default: no caching, always `None`.
    fn cached_endpoint(&self, username: &str) -> Option<SocketAddr> {
        let _ = username;
        None
    }

    fn cache_endpoint(&self, username: &str, addr: SocketAddr) {
        let _ = (username, addr);
    }

    fn invalidate_endpoint(&self, username: &str) {
        let _ = username;
    }

    /// Retains a distributed search response the engine couldn't deliver
    /// immediately, beyond the in-process retention sweep, so it survives
    /// a reconnect that rebuilds the transfer engine from scratch (§6.3
    /// "search_response_cache"). Default: no persistence.
    fn cache_pending_search_response(&self, username: &str, token: u32, response: &SearchResponse) {
        let _ = (username, token, response);
    }

    /// Drops a previously cached pending response once it is delivered or
    /// expires.
    fn clear_pending_search_response(&self, username: &str, token: u32) {
        let _ = (username, token);
    }

    /// Recovers whatever pending responses were cached before the last
    /// disconnect, read once when a new transfer engine is built.
    fn recover_pending_search_responses(&self) -> BoxFuture<'_, Vec<(Username, u32, SearchResponse)>> {
        Box::pin(async { Vec::new() })
    }
}

/// The resolver set used when an embedder supplies none of its own: every
/// method falls back to the trait's default.
pub struct NoopResolvers;

impl Resolvers for NoopResolvers {}
