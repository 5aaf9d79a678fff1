//! End-to-end swarm tests: multiple in-process schedulers talking over real
//! loopback TCP, with a fake origin and a mocked tracker HTTP endpoint
//! standing in for the two external collaborators. Mirrors the unit tests'
//! `FakeOrigin` pattern (see `archive.rs`) but wires up whole `Scheduler`s
//! instead of a bare `Archive`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use sha1::{Digest, Sha1};

use swarmd::archive::OriginOwnership;
use swarmd::conf::Conf;
use swarmd::error::tracker::{OriginError, OriginResult};
use swarmd::error::torrent::TorrentError;
use swarmd::metainfo::Metainfo;
use swarmd::origin::OriginClient;
use swarmd::scheduler;

/// An origin whose metainfo always matches a fixed blob; `download` never
/// succeeds, since every scenario here relies on the swarm itself, not a
/// first-copy pull from the backend.
struct FixedOrigin {
    metainfo: Metainfo,
}

impl OriginClient for FixedOrigin {
    fn get_metainfo<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>> {
        let mi = self.metainfo.clone();
        Box::pin(async move { Ok(mi) })
    }

    fn download<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>> {
        Box::pin(async move { Err(OriginError::NotFound) })
    }
}

fn build_metainfo(name: &str, piece_length: u32, body: &[u8]) -> Metainfo {
    let pieces: Vec<u8> = body
        .chunks(piece_length as usize)
        .flat_map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hasher.finalize().to_vec()
        })
        .collect();
    Metainfo::new(name.to_string(), piece_length, body.len() as u64, pieces)
}

fn fast_conf(store_root: std::path::PathBuf, tracker_url: &str) -> Conf {
    let mut conf = Conf::new(store_root);
    conf.engine.listen_addr = "127.0.0.1:0".parse().unwrap();
    conf.engine.tracker_url = tracker_url.parse().unwrap();
    conf.torrent.announce_interval = Duration::from_millis(150);
    conf.torrent.announce_timeout = Duration::from_secs(2);
    conf.torrent.preemption_interval = Duration::from_millis(150);
    conf.torrent.handshake_timeout = Duration::from_secs(2);
    conf.torrent.request_timeout = Duration::from_secs(5);
    conf
}

fn peer_id_hex(peer_id: swarmd::PeerId) -> String {
    hex::encode(peer_id)
}

/// Scenario: a single seeder already holding the full blob in its cache, and
/// a single leecher that discovers it through the tracker and downloads it
/// byte for byte over one real TCP connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_seeder_to_single_leecher() {
    let body: Vec<u8> = (0..768u32).map(|i| (i % 251) as u8).collect();
    let metainfo = build_metainfo("blob-e2e-1", 256, &body);
    let name = metainfo.name.clone();

    let seeder_dir = tempfile::tempdir().unwrap();
    let cache_path = swarmd::disk::cas::cache_path(seeder_dir.path(), &name);
    std::fs::create_dir_all(cache_path.parent().unwrap()).unwrap();
    std::fs::write(&cache_path, &body).unwrap();

    let mut tracker_server = mockito::Server::new_async().await;
    let tracker_url = format!("{}/announce", tracker_server.url());

    let seeder_origin = Arc::new(FixedOrigin { metainfo: metainfo.clone() });
    let (seeder_handle, _seeder_join) =
        scheduler::spawn(fast_conf(seeder_dir.path().to_path_buf(), &tracker_url), seeder_origin, None, None)
            .await
            .unwrap();

    // registers the pre-seeded torrent: resolves instantly off the cache hit
    // and starts announcing itself as a seeder.
    let seeder_result = seeder_handle.add_torrent("ns".to_string(), name.clone()).await.unwrap();
    assert_eq!(seeder_result, cache_path);
    let (seeder_peer_id, seeder_addr) = seeder_handle.local_info().await.unwrap();

    let leecher_dir = tempfile::tempdir().unwrap();
    let leecher_origin = Arc::new(FixedOrigin { metainfo: metainfo.clone() });
    let (leecher_handle, _leecher_join) =
        scheduler::spawn(fast_conf(leecher_dir.path().to_path_buf(), &tracker_url), leecher_origin, None, None)
            .await
            .unwrap();
    let (leecher_peer_id, _leecher_addr) = leecher_handle.local_info().await.unwrap();

    // the seeder has no one to learn about yet, so its own announces always
    // come back empty.
    let seeder_mock = tracker_server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::UrlEncoded("peer_id".into(), peer_id_hex(seeder_peer_id)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "interval": 1, "peers": [] }).to_string())
        .expect_at_least(1)
        .create_async()
        .await;

    // the leecher's announce hands back exactly the seeder's dial-back
    // address.
    let leecher_mock = tracker_server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::UrlEncoded("peer_id".into(), peer_id_hex(leecher_peer_id)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "interval": 1,
                "peers": [
                    { "peer_id": peer_id_hex(seeder_peer_id), "ip": seeder_addr.ip().to_string(), "port": seeder_addr.port() },
                ],
            })
            .to_string(),
        )
        .expect_at_least(1)
        .create_async()
        .await;

    let downloaded = tokio::time::timeout(Duration::from_secs(10), leecher_handle.add_torrent("ns".to_string(), name.clone()))
        .await
        .expect("download did not finish within the test timeout")
        .expect("download failed");

    let downloaded_bytes = std::fs::read(&downloaded).unwrap();
    assert_eq!(downloaded_bytes, body);
    assert_eq!(downloaded, swarmd::disk::cas::cache_path(leecher_dir.path(), &name));

    seeder_mock.assert_async().await;
    leecher_mock.assert_async().await;

    seeder_handle.shutdown();
    leecher_handle.shutdown();
}

/// Scenario: a leecher whose tracker never produces a usable peer gives up
/// with `TorrentError::Timeout` once `leecher_tti` elapses, and leaves no
/// trace in `cache/`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leecher_without_peers_times_out() {
    let body = b"no peers will ever show up for this one".to_vec();
    let metainfo = build_metainfo("blob-e2e-2", 16, &body);
    let name = metainfo.name.clone();

    let mut tracker_server = mockito::Server::new_async().await;
    let tracker_url = format!("{}/announce", tracker_server.url());
    let _mock = tracker_server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "interval": 1, "peers": [] }).to_string())
        .create_async()
        .await;

    let leecher_dir = tempfile::tempdir().unwrap();
    let mut conf = fast_conf(leecher_dir.path().to_path_buf(), &tracker_url);
    conf.torrent.leecher_tti = Duration::from_millis(300);

    let origin = Arc::new(FixedOrigin { metainfo: metainfo.clone() });
    let (leecher_handle, _join) = scheduler::spawn(conf, origin, None, None).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), leecher_handle.add_torrent("ns".to_string(), name.clone()))
        .await
        .expect("scheduler did not respond within the test timeout");

    assert!(matches!(result, Err(TorrentError::Timeout)), "expected a leecher timeout, got {result:?}");
    assert!(!swarmd::disk::cas::cache_path(leecher_dir.path(), &name).exists());

    leecher_handle.shutdown();
}

/// An origin peer seeds a digest it rendezvous-owns straight from its own
/// `get_metainfo`/`download` pair, without ever needing a seeding peer in
/// the swarm; exercises `OriginOwnership` end to end instead of just through
/// `Archive::create_torrent` directly (see `archive.rs`'s unit test of the
/// same mechanism).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn origin_owner_seeds_without_a_prior_swarm_member() {
    let body: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
    let metainfo = build_metainfo("blob-e2e-3", 16, &body);
    let name = metainfo.name.clone();

    struct OwnerOrigin {
        metainfo: Metainfo,
        body: Vec<u8>,
    }
    impl OriginClient for OwnerOrigin {
        fn get_metainfo<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>> {
            let mi = self.metainfo.clone();
            Box::pin(async move { Ok(mi) })
        }
        fn download<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>> {
            let body = self.body.clone();
            Box::pin(async move { Ok(Bytes::from(body)) })
        }
    }

    let mut tracker_server = mockito::Server::new_async().await;
    let tracker_url = format!("{}/announce", tracker_server.url());
    let _mock = tracker_server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "interval": 1, "peers": [] }).to_string())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let conf = fast_conf(dir.path().to_path_buf(), &tracker_url);
    let self_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let ownership = OriginOwnership {
        rendezvous: swarmd::origin::Rendezvous::new(vec![swarmd::origin::OriginMember { addr: self_addr, weight: 1 }]),
        self_addr,
    };

    let origin = Arc::new(OwnerOrigin { metainfo: metainfo.clone(), body: body.clone() });
    let (handle, _join) = scheduler::spawn(conf, origin, Some(ownership), None).await.unwrap();

    let path = tokio::time::timeout(Duration::from_secs(5), handle.add_torrent("ns".to_string(), name.clone()))
        .await
        .expect("resolution did not finish within the test timeout")
        .expect("resolution failed");

    assert_eq!(std::fs::read(&path).unwrap(), body);
    handle.shutdown();
}

/// A completed torrent idle past `seeder_tti` is evicted from the live set,
/// and a later `add_torrent` for the same name resolves again from scratch
/// rather than finding stale state (spec §8 scenario 6).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seeder_tti_evicts_then_reresolves_on_next_add_torrent() {
    let body = b"short-lived seed, evicted once idle".to_vec();
    let metainfo = build_metainfo("blob-e2e-4", 16, &body);
    let name = metainfo.name.clone();

    let dir = tempfile::tempdir().unwrap();
    let cache_path = swarmd::disk::cas::cache_path(dir.path(), &name);
    std::fs::create_dir_all(cache_path.parent().unwrap()).unwrap();
    std::fs::write(&cache_path, &body).unwrap();

    let mut tracker_server = mockito::Server::new_async().await;
    let tracker_url = format!("{}/announce", tracker_server.url());
    let _mock = tracker_server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "interval": 1, "peers": [] }).to_string())
        .create_async()
        .await;

    let mut conf = fast_conf(dir.path().to_path_buf(), &tracker_url);
    conf.torrent.seeder_tti = Duration::from_millis(150);
    conf.torrent.preemption_interval = Duration::from_millis(50);

    let origin = Arc::new(FixedOrigin { metainfo: metainfo.clone() });
    let (handle, _join) = scheduler::spawn(conf, origin, None, None).await.unwrap();

    let first = handle.add_torrent("ns".to_string(), name.clone()).await.unwrap();
    assert_eq!(first, cache_path);

    // long enough for several preemption sweeps to observe the idle seeder
    // and evict it.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = tokio::time::timeout(Duration::from_secs(5), handle.add_torrent("ns".to_string(), name.clone()))
        .await
        .expect("re-resolution did not finish within the test timeout")
        .expect("re-resolution failed");
    assert_eq!(second, cache_path);
    assert_eq!(std::fs::read(&second).unwrap(), body);

    handle.shutdown();
}
