//! End-to-end tests of the ExtentServer request path
//!
//! A real file-backed device in a temp dir, an in-memory metadata store,
//! and scripted topology and peer collaborators.

use bytes::Bytes;
use cyprestore_common::config::Config;
use cyprestore_common::{
    EsInstance, Error, ExtentRouter, ReplicationMode, RequestType, Result, compute_crc32c,
};
use cyprestore_es::{
    Collaborators, ExtentServer, NoPeers, PeerClient, PeerPool, ReplicateArgs, ReplicateCallback,
    RouterClient,
};
use cyprestore_storage::{
    BlockDevice, FileBlockDevice, FileDeviceConfig, IoReply, KvStore, MemKvStore, OpContext,
    RequestInfo,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const ME: u32 = 1;
const EXTENT_SIZE: u64 = 8192;

/// Fixed topology: every extent has the same primary and secondaries
struct TestRouter {
    primary: u32,
    secondaries: Vec<u32>,
    lookups: AtomicUsize,
}

impl TestRouter {
    fn new(primary: u32, secondaries: &[u32]) -> Arc<Self> {
        Arc::new(Self {
            primary,
            secondaries: secondaries.to_vec(),
            lookups: AtomicUsize::new(0),
        })
    }
}

impl RouterClient for TestRouter {
    fn query_router(&self, extent_id: &str) -> Result<ExtentRouter> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if extent_id.starts_with("unrouted") {
            return Err(Error::ConnectionFailed("topology unavailable".into()));
        }
        let node = |id: u32| EsInstance::new(id, format!("10.0.0.{id}:9500"));
        Ok(ExtentRouter {
            extent_id: extent_id.to_string(),
            primary: node(self.primary),
            secondaries: self.secondaries.iter().map(|&id| node(id)).collect(),
            version: 1,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PeerBehavior {
    Ack,
    RpcFails,
    Unreachable,
    /// Keep the callback until released
    Hold,
}

/// Scripted secondaries; records every replicate they receive
struct TestPeers {
    behavior: PeerBehavior,
    calls: Mutex<Vec<ReplicateArgs>>,
    held: Mutex<Vec<ReplicateCallback>>,
}

impl TestPeers {
    fn new(behavior: PeerBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    fn release_held(&self) {
        for done in self.held.lock().drain(..) {
            done(Ok(()));
        }
    }
}

struct PeerConn(Arc<TestPeers>);

impl PeerClient for PeerConn {
    fn replicate(&self, args: ReplicateArgs, done: ReplicateCallback) {
        self.0.calls.lock().push(args);
        match self.0.behavior {
            PeerBehavior::Hold => self.0.held.lock().push(done),
            behavior => {
                thread::spawn(move || {
                    done(if behavior == PeerBehavior::Ack {
                        Ok(())
                    } else {
                        Err(Error::ConnectionFailed("replicate rpc failed".into()))
                    });
                });
            }
        }
    }
}

struct PeerPoolHandle(Arc<TestPeers>);

impl PeerPool for PeerPoolHandle {
    fn get_client(&self, peer: &EsInstance) -> Result<Arc<dyn PeerClient>> {
        if self.0.behavior == PeerBehavior::Unreachable {
            return Err(Error::ConnectionFailed(format!("{} refused", peer.address)));
        }
        Ok(Arc::new(PeerConn(Arc::clone(&self.0))))
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.es_id = ME;
    config.storage.device_path = dir.path().join("device.img");
    config.storage.device_size = 16 * 1024 * 1024;
    config.storage.direct_io = false;
    config.storage.align_size = 4096;
    config.storage.extent_size = EXTENT_SIZE;
    config.storage.block_size = 4096;
    config.storage.blocks_per_chunk = 1024;
    config.storage.io_workers = 2;
    config.storage.io_batch = 8;
    config.storage.io_queue_size = 64;
    config.metadata.path = dir.path().join("meta.redb");
    config.pools.request_pool_size = 64;
    config.pools.mem_classes = 2;
    config.pools.mem_ring_size = 64;
    config.pools.arena_initial_block = 64 * 1024;
    config.pools.arena_max_block = 256 * 1024;
    config
}

struct Node {
    _dir: TempDir,
    server: ExtentServer,
    peers: Arc<TestPeers>,
    router: Arc<TestRouter>,
}

fn node_with(
    router: Arc<TestRouter>,
    peers: Arc<TestPeers>,
    tweak: impl FnOnce(&mut Config),
) -> Node {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);
    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(FileDeviceConfig::from(&config.storage)).unwrap());
    let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
    let server = ExtentServer::start_with(
        config,
        device,
        store,
        Collaborators {
            router: router.clone(),
            peers: Arc::new(PeerPoolHandle(Arc::clone(&peers))),
        },
    )
    .unwrap();
    Node {
        _dir: dir,
        server,
        peers,
        router,
    }
}

/// Primary node with one acknowledging secondary
fn node() -> Node {
    node_with(TestRouter::new(ME, &[2]), TestPeers::new(PeerBehavior::Ack), |_| {})
}

type Reply = mpsc::Receiver<Result<IoReply>>;

fn channel() -> (impl FnOnce(Result<IoReply>) + Send + 'static, Reply) {
    let (tx, rx) = mpsc::channel();
    (
        move |r| {
            let _ = tx.send(r);
        },
        rx,
    )
}

fn wait(rx: &Reply) -> Result<IoReply> {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("request never completed")
}

fn write(node: &Node, extent: &str, offset: u64, size: u64, payload: &[u8]) -> Result<IoReply> {
    let (done, rx) = channel();
    let payload = Bytes::copy_from_slice(payload);
    let crc = compute_crc32c(&payload);
    node.server
        .handle()
        .write(extent, offset, size, payload, Some(crc), done)
        .unwrap();
    wait(&rx)
}

fn read(node: &Node, extent: &str, offset: u64, size: u64) -> Result<IoReply> {
    let (done, rx) = channel();
    node.server
        .handle()
        .read(extent, offset, size, done)
        .unwrap();
    wait(&rx)
}

#[test]
fn test_check_parameters_alignment_and_bounds() {
    let node = node();
    let engine = node.server.engine();
    let info = |offset, size| RequestInfo {
        req_type: RequestType::Read,
        extent_id: "e1".into(),
        offset,
        size,
        payload: Bytes::new(),
        crc32: None,
    };

    assert!(matches!(
        engine.check_parameters(&info(4097, 4096)),
        Err(Error::InvalidArgument(_))
    ));
    engine.check_parameters(&info(4096, 4096)).unwrap();
    assert!(matches!(
        engine.check_parameters(&info(4096, 8192)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.check_parameters(&RequestInfo {
            extent_id: String::new(),
            ..info(0, 4096)
        }),
        Err(Error::InvalidArgument(_))
    ));

    // Through the full pipeline as well
    assert!(matches!(
        read(&node, "e1", 4097, 4096),
        Err(Error::InvalidArgument(_))
    ));
    read(&node, "e1", 4096, 4096).unwrap();
}

#[test]
fn test_write_replicates_to_secondary_and_reads_back() {
    let node = node();
    let payload = vec![b'a'; 64];

    assert_eq!(write(&node, "e1", 0, 4096, &payload).unwrap(), IoReply::default());

    let calls = node.peers.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].extent_id, "e1");
    assert_eq!(calls[0].size, 4096);
    assert_eq!(calls[0].payload.as_ref(), payload.as_slice());
    assert_eq!(calls[0].crc32, Some(compute_crc32c(&payload)));

    let data = read(&node, "e1", 0, 4096).unwrap().data.unwrap();
    assert_eq!(data.len(), 4096);
    assert_eq!(&data[..64], payload.as_slice());
    assert!(data[64..].iter().all(|&b| b == 0));
    assert_eq!(node.server.locations().extent_count(), 1);
}

#[test]
fn test_write_succeeds_when_secondary_rpc_fails() {
    let node = node_with(
        TestRouter::new(ME, &[2]),
        TestPeers::new(PeerBehavior::RpcFails),
        |_| {},
    );
    write(&node, "e1", 0, 4096, &[b'a'; 64]).unwrap();
    assert_eq!(node.peers.calls.lock().len(), 1);
    assert_eq!(node.server.engine().partial_replications(), 1);

    // A fully acknowledged write leaves the counter alone.
    let acked = self::node();
    write(&acked, "e1", 0, 4096, &[b'a'; 64]).unwrap();
    assert_eq!(acked.server.engine().partial_replications(), 0);
}

#[test]
fn test_write_succeeds_when_secondary_unreachable() {
    let node = node_with(
        TestRouter::new(ME, &[2, 3]),
        TestPeers::new(PeerBehavior::Unreachable),
        |_| {},
    );
    write(&node, "e1", 0, 4096, &[1; 4096]).unwrap();
    assert!(node.peers.calls.lock().is_empty());
    assert_eq!(node.server.engine().partial_replications(), 1);
    assert_eq!(node.server.engine().replicator().skipped(), 2);
}

#[test]
fn test_read_of_unwritten_extent_is_zero_filled() {
    let node = node();
    let reply = read(&node, "e2", 0, 4096).unwrap();
    let data = reply.data.unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|&b| b == 0));
    assert_eq!(reply.crc32, Some(compute_crc32c(&[0u8; 4096])));
    // A read never allocates.
    assert_eq!(node.server.locations().extent_count(), 0);
}

#[test]
fn test_checksum_mismatch_rejected_before_io() {
    let node = node();
    let (done, rx) = channel();
    node.server
        .handle()
        .write("e1", 0, 4096, Bytes::from_static(b"payload"), Some(0xdead_beef), done)
        .unwrap();
    assert!(matches!(wait(&rx), Err(Error::ChecksumError { .. })));
    assert!(node.peers.calls.lock().is_empty());
    assert_eq!(node.server.locations().extent_count(), 0);
}

#[test]
fn test_payload_longer_than_size_rejected() {
    let node = node();
    assert!(matches!(
        write(&node, "e1", 0, 4096, &[0u8; 4097]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_ownership_checks() {
    // Node 1 is a secondary here.
    let node = node_with(TestRouter::new(2, &[ME]), TestPeers::new(PeerBehavior::Ack), |_| {});

    assert!(matches!(
        read(&node, "e1", 0, 4096),
        Err(Error::NoPermission(_))
    ));
    assert!(matches!(
        write(&node, "e1", 0, 4096, b"x"),
        Err(Error::NoPermission(_))
    ));

    let (done, rx) = channel();
    node.server
        .handle()
        .replicate("e1", 0, 4096, Bytes::from_static(b"replica"), None, done)
        .unwrap();
    wait(&rx).unwrap();

    let (done, rx) = channel();
    node.server.handle().scrub("e1", 0, 4096, done).unwrap();
    let mut expected = vec![0u8; 4096];
    expected[..7].copy_from_slice(b"replica");
    assert_eq!(wait(&rx).unwrap().crc32, Some(compute_crc32c(&expected)));
}

#[test]
fn test_replicate_rejected_on_primary() {
    let node = node();
    let (done, rx) = channel();
    node.server
        .handle()
        .replicate("e1", 0, 4096, Bytes::from_static(b"x"), None, done)
        .unwrap();
    assert!(matches!(wait(&rx), Err(Error::NoPermission(_))));
}

#[test]
fn test_star_mode_writes_on_secondary_without_fanout() {
    let node = node_with(
        TestRouter::new(2, &[ME, 3]),
        TestPeers::new(PeerBehavior::Ack),
        |c| c.replication.mode = ReplicationMode::Star,
    );
    write(&node, "e1", 0, 4096, b"star").unwrap();
    assert!(node.peers.calls.lock().is_empty());
    // Reads are still primary-only.
    assert!(matches!(
        read(&node, "e1", 0, 4096),
        Err(Error::NoPermission(_))
    ));
}

#[test]
fn test_router_failure() {
    let node = node();
    assert!(matches!(
        read(&node, "unrouted-1", 0, 4096),
        Err(Error::QueryRouterFail { .. })
    ));
}

#[test]
fn test_delete_frees_space_and_invalidates_router() {
    let node = node();
    let free = node.server.space().free_blocks();
    write(&node, "e1", 4096, 4096, &[3; 4096]).unwrap();
    assert_eq!(node.server.space().free_blocks(), free - 2);
    let lookups = node.router.lookups.load(Ordering::SeqCst);

    let mut handle = node.server.handle();
    let (done, rx) = channel();
    handle.delete("e1", done).unwrap();
    wait(&rx).unwrap();
    assert_eq!(node.server.space().free_blocks(), free);
    assert_eq!(node.server.locations().extent_count(), 0);

    // Next access goes back to the topology service and sees zeros.
    let (done, rx) = channel();
    handle.read("e1", 4096, 4096, done).unwrap();
    let data = wait(&rx).unwrap().data.unwrap();
    assert!(data.iter().all(|&b| b == 0));
    assert_eq!(node.router.lookups.load(Ordering::SeqCst), lookups + 1);

    // Reclaiming an extent that is already gone is not an error.
    let (done, rx) = channel();
    handle.reclaim_extent("e1", done).unwrap();
    wait(&rx).unwrap();
}

#[test]
fn test_log_engine_not_implemented() {
    let node = node_with(TestRouter::new(ME, &[]), TestPeers::new(PeerBehavior::Ack), |c| {
        c.storage.log_engine = true;
    });
    assert!(matches!(
        read(&node, "e1", 0, 4096),
        Err(Error::NotImplemented(_))
    ));
}

#[test]
fn test_request_pool_exhaustion_fails_fast() {
    let node = node_with(
        TestRouter::new(ME, &[2]),
        TestPeers::new(PeerBehavior::Hold),
        |c| c.pools.request_pool_size = 4,
    );
    let mut handle = node.server.handle();
    let receivers: Vec<_> = (0..3)
        .map(|i| {
            let (done, rx) = channel();
            handle
                .write(&format!("e{i}"), 0, 4096, Bytes::from_static(b"x"), None, done)
                .unwrap();
            rx
        })
        .collect();

    let (done, _rx) = channel();
    assert!(matches!(
        handle.read("e0", 0, 4096, done),
        Err(Error::RingFull)
    ));

    node.peers.release_held();
    for rx in &receivers {
        wait(rx).unwrap();
    }
    read(&node, "e0", 0, 4096).unwrap();
}

#[test]
fn test_concurrent_writers_share_one_extent() {
    let node = Arc::new(node());
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let node = Arc::clone(&node);
            thread::spawn(move || {
                let mut handle = node.server.handle();
                let (done, rx) = channel();
                let offset = u64::from(i % 2) * 4096;
                handle
                    .write("shared", offset, 4096, Bytes::from(vec![i; 4096]), None, done)
                    .unwrap();
                wait(&rx).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(node.server.locations().extent_count(), 1);
}

#[test]
fn test_restart_recovers_extents() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let collaborators = || Collaborators {
        router: TestRouter::new(ME, &[]),
        peers: Arc::new(NoPeers),
    };

    let offset = {
        let server = ExtentServer::start(config.clone(), collaborators()).unwrap();
        let (done, rx) = channel();
        server
            .handle()
            .write("persist", 0, 4096, Bytes::from(vec![0x5a; 4096]), None, done)
            .unwrap();
        wait(&rx).unwrap();
        server.period_admin();
        let offset = server
            .locations()
            .query_location("persist", false)
            .unwrap()
            .offset;
        server.shutdown().unwrap();
        offset
    };

    let server = ExtentServer::start(config, collaborators()).unwrap();
    assert_eq!(server.locations().extent_count(), 1);
    assert!(server.space().is_allocated(offset));
    let (done, rx) = channel();
    server.handle().read("persist", 0, 4096, done).unwrap();
    let data = wait(&rx).unwrap().data.unwrap();
    assert!(data.iter().all(|&b| b == 0x5a));
    server.shutdown().unwrap();
}

#[test]
fn test_submit_raw_context() {
    let node = node();
    let (done, rx) = channel();
    let mut handle = node.server.handle();
    handle
        .submit(RequestType::Noop, OpContext::new("e1", 0, 0).on_done(done))
        .unwrap();
    assert!(matches!(wait(&rx), Err(Error::InvalidArgument(_))));
}
