use std::{net::SocketAddr, sync::{atomic::{AtomicUsize, Ordering}, Arc}};
use futures::{SinkExt, StreamExt};
use tokio::{net::{TcpListener, TcpStream}, sync::mpsc, task::JoinHandle};
use tokio_util::codec::Framed;
use crate::{
    block::BlockData,
    metainfo::build_torrent,
    p2p::{handshake::{Handshake, HandshakeCodec}, message::{Message, MessageCodec}, PeerRx},
    store::memory::MemoryStore,
    tracker::{AnnounceResponse, Tracker, TrackerError, TrackerManager},
    Bitfield, MetaInfo,
};
use super::*;

const PIECE_LEN: usize = 32768;
const NUM_PIECES: usize = 4;

fn torrent_data() -> Vec<u8> {
    (0..PIECE_LEN * NUM_PIECES).map(|i| (i % 251) as u8).collect()
}

fn metainfo(data: &[u8]) -> MetaInfo {
    let bytes = build_torrent("seeded.bin", PIECE_LEN, data, "http://127.0.0.1:1/announce");
    MetaInfo::from_bytes(&bytes).unwrap()
}

fn offline(metainfo: &MetaInfo, store: MemoryStore) -> Torrent {
    let config = Config::default();
    let trackers = TrackerManager::from_trackers(Vec::new(), &config);
    Torrent::new(metainfo, config, Box::new(store)).with_trackers(trackers)
}

// Tracker that never has peers, counting its announces.
struct EmptyTracker {
    url: url::Url,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tracker for EmptyTracker {
    async fn announce(&mut self, _: &AnnounceParams) -> std::result::Result<AnnounceResponse, TrackerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AnnounceResponse::new(Duration::from_secs(1800), 0, 0, Vec::new()))
    }

    fn url(&self) -> &url::Url { &self.url }
}

fn with_empty_tracker(metainfo: &MetaInfo, store: MemoryStore, config: Config) -> (Torrent, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let tracker = EmptyTracker {
        url: url::Url::parse("http://tracker.example/announce").unwrap(),
        calls: calls.clone(),
    };
    let trackers = TrackerManager::from_trackers(vec![Box::new(tracker)], &config);
    (Torrent::new(metainfo, config, Box::new(store)).with_trackers(trackers), calls)
}

// Registers a session that never runs, returning what the torrent sends it.
fn attach(torrent: &mut Torrent, address: SocketAddr) -> PeerRx {
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    torrent.peers.insert(address, PeerHandle {
        peer_tx,
        state: SessionState::default(),
        session_handle: tokio::spawn(std::future::pending()),
    });
    peer_rx
}

fn sent(rx: &mut PeerRx) -> Vec<PeerCommand> {
    let mut cmds = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        cmds.push(cmd);
    }
    cmds
}

// Serves the whole torrent to one leecher, returns the haves it was sent.
async fn seed(stream: TcpStream, info_hash: [u8; 20], data: Vec<u8>) -> Vec<u32> {
    let mut socket = Framed::new(stream, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, info_hash);
    socket.send(Handshake::new(info_hash, [5; 20])).await.unwrap();

    let mut socket = socket.map_codec(|_| MessageCodec);
    socket.send(Message::Bitfield(Bitfield::repeat(true, NUM_PIECES))).await.unwrap();
    socket.send(Message::Unchoke).await.unwrap();

    let mut haves = Vec::new();
    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Request(block) => {
                let start = block.piece_idx * PIECE_LEN + block.offset;
                socket.send(Message::Block(BlockData {
                    piece_idx: block.piece_idx,
                    offset: block.offset,
                    data: data[start..start + block.len].to_vec(),
                })).await.unwrap();
            },
            Message::Have { idx } => haves.push(idx),
            _ => {},
        }
    }
    haves
}

async fn spawn_seeder(info_hash: [u8; 20], data: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<u32>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        seed(stream, info_hash, data).await
    });
    (address, handle)
}

#[tokio::test]
async fn test_download_from_local_seeder() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (seeder, seeder_handle) = spawn_seeder(metainfo.info_hash(), data).await;

    let (store, log) = MemoryStore::new(NUM_PIECES);
    let mut torrent = offline(&metainfo, store);
    assert_eq!(torrent.add_peers(vec![seeder, seeder]), 1);

    torrent.start_download().await.unwrap();
    assert_eq!(torrent.state(), TorrentState::Completed);

    let log = log.borrow();
    let mut saves = log.saves.clone();
    saves.sort();
    assert_eq!(saves, vec![0, 1, 2, 3]);
    assert!(log.reconstructed);
    assert!(log.cleaned_up);

    let stats = torrent.stats();
    assert!(stats.is_complete());
    assert_eq!(stats.percentage, 100.0);
    assert_eq!(stats.bytes_completed, (PIECE_LEN * NUM_PIECES) as u64);

    let mut haves = seeder_handle.await.unwrap();
    haves.sort();
    assert_eq!(haves, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_resumed_download_finishes_without_peers() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, log) = MemoryStore::with_pieces(NUM_PIECES, &[0, 1, 2, 3]);
    let mut torrent = offline(&metainfo, store);

    torrent.start_download().await.unwrap();
    assert_eq!(torrent.state(), TorrentState::Completed);
    assert!(log.borrow().saves.is_empty());
    assert!(log.borrow().reconstructed);
}

#[tokio::test]
async fn test_stop_through_handle() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, log) = MemoryStore::new(NUM_PIECES);
    let mut torrent = offline(&metainfo, store);

    torrent.handle().stop().unwrap();
    torrent.start_download().await.unwrap();
    assert_eq!(torrent.state(), TorrentState::Stopped);
    assert!(!log.borrow().reconstructed);
    assert!(!torrent.stats().is_complete());
}

#[tokio::test]
async fn test_initialize_counts_resumed_pieces() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, _) = MemoryStore::with_pieces(NUM_PIECES, &[2]);
    let mut torrent = offline(&metainfo, store);

    torrent.initialize().await.unwrap();
    assert_eq!(torrent.state(), TorrentState::Initialized);
    let stats = torrent.stats();
    assert_eq!(stats.completed_pieces, 1);
    assert_eq!(stats.percentage, 25.0);
    assert_eq!(stats.active_peers, 0);
}

#[test]
fn test_handle_disconnect_ignores_unknown_peers() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, _) = MemoryStore::new(NUM_PIECES);
    let mut torrent = offline(&metainfo, store);

    let address = SocketAddr::from(([10, 0, 0, 9], 6881));
    torrent.handle_disconnect(address, Some(PeerError::IncorrectInfoHash));
    assert!(!torrent.pool.is_blacklisted(&address));
    assert_eq!(torrent.pool.len(), 0);
}

#[tokio::test]
async fn test_stagnation_resets_peers() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, _) = MemoryStore::new(NUM_PIECES);
    let (mut torrent, _) = with_empty_tracker(&metainfo, store, Config::default());
    let address = SocketAddr::from(([10, 0, 0, 4], 6881));
    let mut rx = attach(&mut torrent, address);

    let samples = torrent.ctx.config.stagnation_samples;
    for _ in 1..samples {
        assert!(!torrent.check_progress());
    }
    assert!(torrent.check_progress());

    // The peer is shut down and queued to be dialled again.
    assert!(torrent.peers.is_empty());
    assert!(torrent.closing.contains_key(&address));
    assert!(matches!(sent(&mut rx)[..], [PeerCommand::Shutdown]));
    assert_eq!(torrent.pool.next_peer(), Some(address));

    // Counting starts over.
    assert!(!torrent.check_progress());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_download_announces_early() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, _) = MemoryStore::new(NUM_PIECES);
    let config = Config {
        progress_interval: Duration::from_secs(1),
        stagnation_samples: 2,
        ..Config::default()
    };
    let (mut torrent, calls) = with_empty_tracker(&metainfo, store, config);

    // The regular interval is a minute, anything sooner is forced.
    let run = time::timeout(Duration::from_secs(5), torrent.start_download()).await;
    assert!(run.is_err());
    assert!(calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(torrent.state(), TorrentState::Downloading);
}

#[tokio::test]
async fn test_stuck_pieces_offered_again() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, _) = MemoryStore::new(NUM_PIECES);
    let config = Config { stuck_piece_timeout: Duration::ZERO, ..Config::default() };
    let (mut torrent, _) = with_empty_tracker(&metainfo, store, config);
    let mut rx = attach(&mut torrent, SocketAddr::from(([10, 0, 0, 5], 6881)));

    assert!(torrent.ctx.picker.borrow_mut().start_piece(1));
    torrent.check_stuck_pieces();

    assert!(!torrent.ctx.picker.borrow().is_downloading(1));
    assert!(matches!(sent(&mut rx)[..], [PeerCommand::Request(1)]));

    // Nothing is downloading now, so nothing more is sent.
    torrent.check_stuck_pieces();
    assert!(sent(&mut rx).is_empty());
}

#[tokio::test]
async fn test_lost_piece_requested_before_finishing() {
    let data = torrent_data();
    let metainfo = metainfo(&data);
    let (store, log) = MemoryStore::with_pieces(NUM_PIECES, &[0, 1, 2, 3]);
    let (mut torrent, _) = with_empty_tracker(&metainfo, store, Config::default());
    torrent.initialize().await.unwrap();
    assert!(torrent.ctx.picker.borrow().is_download_complete());
    let mut rx = attach(&mut torrent, SocketAddr::from(([10, 0, 0, 6], 6881)));

    // The store loses a piece after it was counted.
    log.borrow_mut().pieces.remove(&2);
    assert!(!torrent.finish().await.unwrap());

    assert!(matches!(sent(&mut rx)[..], [PeerCommand::Request(2)]));
    assert_eq!(torrent.ctx.picker.borrow().missing_pieces(), vec![2]);
    assert!(!log.borrow().reconstructed);
    assert!(!log.borrow().cleaned_up);
    assert_ne!(torrent.state(), TorrentState::Completed);
}
