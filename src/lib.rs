//! An async client library for the Soulseek peer-to-peer network: message
//! codec, connection layer, connection manager with firewall piercing,
//! server session, distributed search overlay, and file transfer engine.

pub mod client;
pub mod codec;
pub mod conf;
pub mod connection;
pub mod error;
pub mod manager;
pub mod overlay;
pub mod peer_requests;
pub mod resolvers;
pub mod session;
pub mod token;
pub mod transfer;
pub mod types;
pub mod waiter;

pub use client::{Client, ClientEvent};
pub use conf::Conf;
pub use error::ClientError;
