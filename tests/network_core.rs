//! Integration tests driving multiple modules together over real loopback
//! sockets: a search round trip, a full download, the firewall-piercing
//! connect race, and distributed-overlay ping/relay behavior.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpListener;

use soulseek_net::codec::distributed::DistributedCode;
use soulseek_net::codec::init::InitCode;
use soulseek_net::codec::peer::PeerCode;
use soulseek_net::codec::server::PeerConnectionType;
use soulseek_net::codec::{InitMessageBuilder, InitMessageReader, MessageBuilder, MessageReader};
use soulseek_net::connection::{Connection, ConnectionOptions};
use soulseek_net::conf::TransferConf;
use soulseek_net::error::ManagerError;
use soulseek_net::manager::{ConnectionManager, ManagerOptions, PeerConnection, ServerRequests};
use soulseek_net::overlay::{DistributedOverlay, OverlayOptions};
use soulseek_net::resolvers::NoopResolvers;
use soulseek_net::token::TokenFactory;
use soulseek_net::transfer::search::SearchOptions;
use soulseek_net::transfer::TransferEngine;
use soulseek_net::types::{FileAttributes, FileEntry, SearchResponse};

/// A [`ServerRequests`] stub that always resolves `username` to a fixed
/// address and never actually solicits anything (tests drive the direct
/// dial path only, unless noted).
struct FixedAddrServer(SocketAddr);

impl ServerRequests for FixedAddrServer {
    fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, Result<SocketAddr, ManagerError>> {
        let addr = self.0;
        Box::pin(async move { Ok(addr) })
    }
    fn connect_to_peer(&self, _token: u32, _username: &str, _conn_type: PeerConnectionType) {}
}

fn manager_options() -> ManagerOptions {
    ManagerOptions {
        connection: ConnectionOptions {
            connect_timeout: Duration::from_millis(500),
            ..ConnectionOptions::default()
        },
        max_peer_connections: 10,
        eviction_interval: Duration::from_secs(30),
    }
}

fn sample_file(i: usize) -> FileEntry {
    FileEntry {
        filename: format!("track{}.flac", i),
        size: 5_000_000 + i as u64,
        extension: "flac".into(),
        attributes: FileAttributes {
            bitrate: None,
            duration_secs: Some(240),
            is_vbr: None,
            sample_rate: Some(44_100),
            bit_depth: Some(16),
        },
    }
}

/// A search registers with the engine, sends `FileSearch` over the server
/// link, and a response frame decoded off a (simulated) peer connection is
/// routed back out the returned channel, filtered by minimum file count.
#[tokio::test]
async fn search_round_trips_through_the_engine() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let server_read = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
        let (mut reader, _writer) = conn.split();
        reader.read_message().await.unwrap()
    });

    let client = Connection::connect(server_addr, ConnectionOptions::default()).await.unwrap();
    let (_reader, server_writer) = client.split();

    let (peer_tx, _peer_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dist_tx, _dist_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accept_tx, _accept_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnect_tx, _disconnect_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        "me",
        manager_options(),
        Arc::new(TokenFactory::default()),
        peer_tx,
        dist_tx,
        accept_tx,
        disconnect_tx,
    );
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let server: Arc<dyn ServerRequests> = Arc::new(FixedAddrServer(server_addr));
    let engine = TransferEngine::new(
        manager,
        server,
        Arc::new(TokenFactory::default()),
        Arc::new(NoopResolvers),
        TransferConf::default(),
        events_tx,
    );

    let options = SearchOptions {
        search_timeout: Duration::from_secs(5),
        minimum_response_file_count: 1,
        response_limit: None,
    };
    let (token, mut responses) = engine.search.search("flac album", options, &server_writer).await.unwrap();

    let sent_frame = server_read.await.unwrap();
    let mut msg = MessageReader::from_frame(sent_frame).unwrap();
    assert_eq!(msg.read_code(), soulseek_net::codec::server::ServerCode::FileSearch.code());
    assert_eq!(msg.read_u32().unwrap(), token);
    assert_eq!(msg.read_string().unwrap(), "flac album");

    let response = SearchResponse {
        username: "alice".into(),
        token,
        files: vec![sample_file(0), sample_file(1)],
        free_upload_slots: true,
        upload_speed: 2_000_000,
        queue_length: 0,
    };
    let frame = soulseek_net::transfer::search::encode_search_response("alice", &response);
    engine.search.handle_response_frame(frame.slice(4..)).unwrap();

    let received = responses.recv().await.unwrap();
    assert_eq!(received.username, "alice");
    assert_eq!(received.files.len(), 2);
}

/// Responses with fewer files than `minimum_response_file_count` never
/// reach the caller, but the search stays open for a later, richer one.
#[tokio::test]
async fn sparse_responses_are_filtered_but_search_stays_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
        let (mut reader, _writer) = conn.split();
        let _ = reader.read_message().await;
    });
    let client = Connection::connect(server_addr, ConnectionOptions::default()).await.unwrap();
    let (_reader, server_writer) = client.split();

    let (peer_tx, _peer_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dist_tx, _dist_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accept_tx, _accept_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnect_tx, _disconnect_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        "me",
        manager_options(),
        Arc::new(TokenFactory::default()),
        peer_tx,
        dist_tx,
        accept_tx,
        disconnect_tx,
    );
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let server: Arc<dyn ServerRequests> = Arc::new(FixedAddrServer(server_addr));
    let engine = TransferEngine::new(
        manager,
        server,
        Arc::new(TokenFactory::default()),
        Arc::new(NoopResolvers),
        TransferConf::default(),
        events_tx,
    );

    let options = SearchOptions {
        search_timeout: Duration::from_secs(5),
        minimum_response_file_count: 2,
        response_limit: None,
    };
    let (token, mut responses) = engine.search.search("flac", options, &server_writer).await.unwrap();

    let sparse = SearchResponse {
        username: "bob".into(),
        token,
        files: vec![sample_file(0)],
        free_upload_slots: false,
        upload_speed: 0,
        queue_length: 3,
    };
    engine
        .search
        .handle_response_frame(soulseek_net::transfer::search::encode_search_response("bob", &sparse).slice(4..))
        .unwrap();

    let rich = SearchResponse {
        username: "carol".into(),
        token,
        files: vec![sample_file(0), sample_file(1)],
        free_upload_slots: true,
        upload_speed: 500_000,
        queue_length: 0,
    };
    engine
        .search
        .handle_response_frame(soulseek_net::transfer::search::encode_search_response("carol", &rich).slice(4..))
        .unwrap();

    let received = responses.recv().await.unwrap();
    assert_eq!(received.username, "carol");
}

/// A full download: request, accept, transfer-connection dial, token
/// preamble, and the raw byte stream, driven against a hand-rolled peer
/// that speaks the wire protocol directly.
#[tokio::test]
async fn download_happy_path_completes_with_full_payload() {
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
    let payload_for_peer = payload.clone();

    let fake_peer = tokio::spawn(async move {
        // message ("P") connection: read PeerInit, then the download request.
        let (stream, addr) = peer_listener.accept().await.unwrap();
        let conn = Connection::from_accepted(stream, addr, ConnectionOptions::default());
        let (mut reader, writer) = conn.split();
        let init = reader.read_message().await.unwrap();
        let mut init_msg = InitMessageReader::from_frame(init).unwrap();
        assert_eq!(InitCode::from_code(init_msg.read_code()), InitCode::PeerInit);
        let _username = init_msg.read_string().unwrap();
        let conn_type = init_msg.read_string().unwrap();
        assert_eq!(conn_type, "P");
        let _token = init_msg.read_u32().unwrap();

        let request = reader.read_message().await.unwrap();
        let mut req = MessageReader::from_frame(request).unwrap();
        assert_eq!(PeerCode::from_code(req.read_code()), PeerCode::TransferRequest);
        assert_eq!(req.read_u32().unwrap(), 0); // WIRE_DOWNLOAD
        let local_token = req.read_u32().unwrap();
        assert_eq!(req.read_string().unwrap(), "share/song.flac");

        let accept = MessageBuilder::new(PeerCode::TransferResponse.code())
            .write_u32(local_token)
            .write_bool(true)
            .write_i64(payload_for_peer.len() as i64)
            .finish();
        writer.write(accept).await.unwrap();

        // transfer ("F") connection: dialed by the downloader directly.
        let (stream2, addr2) = peer_listener.accept().await.unwrap();
        let conn2 = Connection::from_accepted(stream2, addr2, ConnectionOptions::default());
        let (mut reader2, writer2) = conn2.split();
        let init2 = reader2.read_message().await.unwrap();
        let mut init2_msg = InitMessageReader::from_frame(init2).unwrap();
        assert_eq!(InitCode::from_code(init2_msg.read_code()), InitCode::PeerInit);
        let _username2 = init2_msg.read_string().unwrap();
        let ty2 = init2_msg.read_string().unwrap();
        assert_eq!(ty2, "F");
        let remote_token = init2_msg.read_u32().unwrap();
        assert_eq!(remote_token, local_token);

        writer2.write(Bytes::copy_from_slice(&remote_token.to_le_bytes())).await.unwrap();
        writer2.write(Bytes::copy_from_slice(&payload_for_peer)).await.unwrap();
    });

    let (peer_tx, mut peer_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dist_tx, _dist_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accept_tx, _accept_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnect_tx, _disconnect_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        "me",
        manager_options(),
        Arc::new(TokenFactory::default()),
        peer_tx,
        dist_tx,
        accept_tx,
        disconnect_tx,
    );

    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let server: Arc<dyn ServerRequests> = Arc::new(FixedAddrServer(peer_addr));
    let engine = TransferEngine::new(
        manager,
        server,
        Arc::new(TokenFactory::default()),
        Arc::new(NoopResolvers),
        TransferConf::default(),
        events_tx,
    );

    // the manager's reader task for the "P" connection hands decoded frames
    // (e.g. the `TransferResponse` accept) to this channel; dispatch them
    // the way `Client::connect`'s background task does.
    let dispatch_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        while let Some(incoming) = peer_rx.recv().await {
            dispatch_engine.handle_peer_frame(&incoming.username, incoming.frame).await;
        }
    });

    let never = std::future::pending::<()>();
    let downloaded = engine.download("alice", "share/song.flac", never).await.unwrap();
    assert_eq!(downloaded, payload);

    fake_peer.await.unwrap();
}

/// A connect race where the direct dial has nowhere to land (nothing
/// listens on the resolved address) still succeeds because the server
/// solicits an inbound connection that arrives via the listener's
/// `PierceFirewall` path.
#[tokio::test]
async fn firewall_pierce_race_adopts_the_solicited_connection() {
    let (peer_tx, _peer_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dist_tx, _dist_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accept_tx, _accept_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnect_tx, _disconnect_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        "me",
        ManagerOptions {
            connection: ConnectionOptions {
                connect_timeout: Duration::from_secs(2),
                ..ConnectionOptions::default()
            },
            max_peer_connections: 10,
            eviction_interval: Duration::from_secs(30),
        },
        Arc::new(TokenFactory::default()),
        peer_tx,
        dist_tx,
        accept_tx,
        disconnect_tx,
    );
    let listen_addr = manager.start_listener(0).await.unwrap();

    // An address in TEST-NET-1 (RFC 5737): nothing answers there, so the
    // direct half of the race can never complete.
    let unreachable: SocketAddr = "192.0.2.1:1".parse().unwrap();

    struct SolicitingServer {
        unreachable: SocketAddr,
        listen_addr: SocketAddr,
    }
    impl ServerRequests for SolicitingServer {
        fn get_peer_address<'a>(&'a self, _username: &'a str) -> BoxFuture<'a, Result<SocketAddr, ManagerError>> {
            let addr = self.unreachable;
            Box::pin(async move { Ok(addr) })
        }
        fn connect_to_peer(&self, token: u32, _username: &str, conn_type: PeerConnectionType) {
            assert_eq!(conn_type, PeerConnectionType::Peer);
            let listen_addr = self.listen_addr;
            tokio::spawn(async move {
                let conn = Connection::connect(listen_addr, ConnectionOptions::default()).await.unwrap();
                let (_reader, writer) = conn.split();
                let frame = InitMessageBuilder::new(InitCode::PierceFirewall.code())
                    .write_u32(token)
                    .finish();
                writer.write(frame).await.unwrap();
                // keep the writer alive until the manager reads from its half
                tokio::time::sleep(Duration::from_millis(200)).await;
            });
        }
    }

    let server: Arc<dyn ServerRequests> = Arc::new(SolicitingServer {
        unreachable,
        listen_addr,
    });
    let conn: PeerConnection = manager.get_or_add_peer_connection("bob", server).await.unwrap();
    assert_eq!(conn.username, "bob");
}

/// A `Ping` from the overlay's parent receives a `Ping` reply carrying a
/// freshly allocated token, once the overlay has adopted a parent via
/// `handle_net_info`'s real connect race.
#[tokio::test]
async fn distributed_ping_is_answered_to_the_parent() {
    let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let parent_addr = parent_listener.local_addr().unwrap();

    let fake_parent = tokio::spawn(async move {
        let (stream, addr) = parent_listener.accept().await.unwrap();
        let conn = Connection::from_accepted(stream, addr, ConnectionOptions::default());
        let (mut reader, _writer) = conn.split();
        let init = reader.read_message().await.unwrap();
        let mut init_msg = InitMessageReader::from_frame(init).unwrap();
        assert_eq!(InitCode::from_code(init_msg.read_code()), InitCode::PeerInit);
        let _username = init_msg.read_string().unwrap();
        let conn_type = init_msg.read_string().unwrap();
        assert_eq!(conn_type, "D");
        let _token = init_msg.read_u32().unwrap();

        reader.read_message().await.unwrap()
    });

    let (peer_tx, _peer_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dist_tx, _dist_rx) = tokio::sync::mpsc::unbounded_channel();
    let (accept_tx, _accept_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnect_tx, _disconnect_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        "me",
        manager_options(),
        Arc::new(TokenFactory::default()),
        peer_tx,
        dist_tx,
        accept_tx,
        disconnect_tx,
    );
    let server: Arc<dyn ServerRequests> = Arc::new(FixedAddrServer(parent_addr));

    let overlay = DistributedOverlay::new(OverlayOptions::default(), Arc::new(TokenFactory::default()));
    overlay
        .handle_net_info(vec![("parent".into(), parent_addr)], manager, server)
        .await;
    assert!(overlay.has_parent());

    let ping_frame = MessageBuilder::new(DistributedCode::Ping.code()).write_u32(99).finish();
    let resolvers: Arc<dyn soulseek_net::resolvers::Resolvers> = Arc::new(NoopResolvers);
    overlay
        .handle_frame("parent", ping_frame.slice(4..), &resolvers, |_, _, _| {})
        .await;

    let reply = fake_parent.await.unwrap();
    let mut msg = MessageReader::from_frame(reply).unwrap();
    assert_eq!(DistributedCode::from_code(msg.read_code()), DistributedCode::Ping);
    let _token = msg.read_u32().unwrap();
}
