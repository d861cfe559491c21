use std::{cell::RefCell, net::SocketAddr, rc::Rc};
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{io::{duplex, DuplexStream}, sync::mpsc};
use tokio_util::codec::Framed;
use crate::{
    block::BlockData,
    info::TorrentInfo,
    picker::Picker,
    store::memory::{MemoryStore, StoreLog},
    torrent::{TorrentCommand, TorrentContext, TorrentRx},
    Bitfield, Config, BLOCK_SIZE, ID,
};
use super::{handshake::*, message::*, *};

const PIECE_LEN: usize = 2 * BLOCK_SIZE;
const INFO_HASH: ID = [7; 20];

struct Harness {
    ctx: Rc<TorrentContext>,
    torrent_rx: TorrentRx,
    log: Rc<RefCell<StoreLog>>,
    data: Vec<Vec<u8>>,
}

fn harness(num_pieces: usize) -> Harness {
    let data = (0..num_pieces).map(|i| vec![i as u8 + 1; PIECE_LEN]).collect::<Vec<_>>();
    let hashes = data.iter().map(|d| Sha1::digest(d).into()).collect();
    let info = TorrentInfo::from_lengths((num_pieces * PIECE_LEN) as u64, PIECE_LEN);
    let (store, log) = MemoryStore::new(num_pieces);
    let config = Config::default();
    let picker = Picker::new(info.clone(), hashes, Box::new(store), &config);
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    let ctx = Rc::new(TorrentContext {
        info_hash: INFO_HASH,
        client_id: config.client_id,
        info,
        picker: RefCell::new(picker),
        torrent_tx,
        config,
    });
    Harness { ctx, torrent_rx, log, data }
}

fn addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 3], 6881))
}

fn drain(rx: &mut TorrentRx) -> Vec<TorrentCommand> {
    let mut cmds = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        cmds.push(cmd);
    }
    cmds
}

// Plays the remote side of the handshake and reads our opening bitfield.
async fn accept(remote: DuplexStream) -> Framed<DuplexStream, MessageCodec> {
    let mut socket = Framed::new(remote, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, INFO_HASH);
    socket.send(Handshake::new(INFO_HASH, [2; 20])).await.unwrap();

    let mut socket = socket.map_codec(|_| MessageCodec);
    match socket.next().await.unwrap().unwrap() {
        Message::Bitfield(bf) => assert!(bf.not_any()),
        other => panic!("expected bitfield, got {}", other),
    }
    socket
}

#[tokio::test]
async fn test_wrong_info_hash_rejected() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = Framed::new(remote, HandshakeCodec);
        socket.next().await.unwrap().unwrap();
        socket.send(Handshake::new([9; 20], [2; 20])).await.unwrap();
        socket
    };
    let (result, _socket) = tokio::join!(session.run_stream(local), peer);
    assert!(matches!(result, Err(PeerError::IncorrectInfoHash)));
}

#[tokio::test]
async fn test_download_from_seeder() {
    let mut h = harness(2);
    let (local, remote) = duplex(1 << 20);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());
    let data = h.data.clone();

    let peer = async move {
        let mut socket = accept(remote).await;
        socket.send(Message::Bitfield(Bitfield::repeat(true, 2))).await.unwrap();
        socket.send(Message::Unchoke).await.unwrap();

        let mut interested = false;
        let mut served = 0;
        while served < 4 {
            match socket.next().await.unwrap().unwrap() {
                Message::Interested => interested = true,
                Message::Request(block) => {
                    let bytes = &data[block.piece_idx][block.offset..block.offset + block.len];
                    socket.send(Message::Block(BlockData {
                        piece_idx: block.piece_idx,
                        offset: block.offset,
                        data: bytes.to_vec(),
                    })).await.unwrap();
                    served += 1;
                },
                Message::KeepAlive => {},
                other => panic!("unexpected {}", other),
            }
        }
        assert!(interested);
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();

    let mut saves = h.log.borrow().saves.clone();
    saves.sort();
    assert_eq!(saves, vec![0, 1]);
    assert!(h.ctx.picker.borrow().is_download_complete());

    let mut completed = drain(&mut h.torrent_rx)
        .into_iter()
        .filter_map(|cmd| match cmd {
            TorrentCommand::PieceCompleted(idx) => Some(idx),
            _ => None,
        })
        .collect::<Vec<_>>();
    completed.sort();
    assert_eq!(completed, vec![0, 1]);

    session.disconnect(None);
    assert!(drain(&mut h.torrent_rx).iter().any(|cmd| matches!(
        cmd,
        TorrentCommand::PeerDisconnected { error: None, .. }
    )));
}

#[tokio::test]
async fn test_late_bitfield_is_violation() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = accept(remote).await;
        socket.send(Message::KeepAlive).await.unwrap();
        socket.send(Message::Bitfield(Bitfield::repeat(true, 2))).await.unwrap();
        socket
    };
    let (result, _socket) = tokio::join!(session.run_stream(local), peer);
    assert!(matches!(result, Err(PeerError::UnexpectedBitfield)));
}

#[tokio::test]
async fn test_have_out_of_range_is_violation() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = accept(remote).await;
        socket.send(Message::Have { idx: 2 }).await.unwrap();
        socket
    };
    let (result, _socket) = tokio::join!(session.run_stream(local), peer);
    assert!(matches!(result, Err(PeerError::InvalidMessage(_))));
}

#[tokio::test]
async fn test_choke_releases_requests() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = accept(remote).await;
        socket.send(Message::Bitfield(Bitfield::repeat(true, 2))).await.unwrap();
        socket.send(Message::Unchoke).await.unwrap();
        let mut requested = 0;
        while requested < 4 {
            if let Message::Request(_) = socket.next().await.unwrap().unwrap() {
                requested += 1;
            }
        }
        socket.send(Message::Choke).await.unwrap();
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();

    let picker = h.ctx.picker.borrow();
    assert_eq!(picker.completion_stats().pending_requests, 0);
    assert_eq!(picker.next_block_to_request(0).map(|b| b.offset), Some(0));
}

#[tokio::test]
async fn test_completed_piece_announced() {
    let h = harness(3);
    let (local, remote) = duplex(1 << 16);
    let (mut session, tx) = PeerSession::new(addr(), h.ctx.clone());
    tx.send(PeerCommand::PieceCompleted(1)).unwrap();

    let peer = async move {
        let mut socket = accept(remote).await;
        loop {
            match socket.next().await.unwrap().unwrap() {
                Message::Have { idx } => {
                    assert_eq!(idx, 1);
                    break;
                },
                Message::KeepAlive => {},
                other => panic!("unexpected {}", other),
            }
        }
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();
}

#[tokio::test]
async fn test_shutdown_command_ends_session() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, tx) = PeerSession::new(addr(), h.ctx.clone());
    tx.send(PeerCommand::Shutdown).unwrap();

    let peer = async move {
        let mut socket = accept(remote).await;
        // Session hangs up.
        while let Some(msg) = socket.next().await {
            msg.unwrap();
        }
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();
}

#[tokio::test]
async fn test_retry_request_taken_once() {
    let h = harness(2);
    let (local, remote) = duplex(1 << 16);
    let (mut session, tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = accept(remote).await;
        // Only piece 1.
        let mut bf = Bitfield::repeat(false, 2);
        bf.set(1, true);
        socket.send(Message::Bitfield(bf)).await.unwrap();
        tx.send(PeerCommand::Request(0)).unwrap();
        tx.send(PeerCommand::Request(1)).unwrap();
        // Let the session pick up both commands before hanging up.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        drop(socket);
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();

    let picker = h.ctx.picker.borrow();
    assert!(!picker.is_downloading(0));
    assert!(picker.is_downloading(1));
}

#[tokio::test]
async fn test_claimed_piece_without_blocks_ends_burst() {
    let h = harness(2);
    // Both pieces already have every block pending from this address.
    {
        let mut picker = h.ctx.picker.borrow_mut();
        for idx in 0..2 {
            assert!(picker.record_request_sent(idx, 0, BLOCK_SIZE, addr()));
            assert!(picker.record_request_sent(idx, BLOCK_SIZE, BLOCK_SIZE, addr()));
        }
    }
    let (local, remote) = duplex(1 << 16);
    let (mut session, _tx) = PeerSession::new(addr(), h.ctx.clone());

    let peer = async move {
        let mut socket = accept(remote).await;
        socket.send(Message::Bitfield(Bitfield::repeat(true, 2))).await.unwrap();
        socket.send(Message::Unchoke).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        drop(socket);
    };
    let (result, _) = tokio::join!(session.run_stream(local), peer);
    result.unwrap();

    let stats = h.ctx.picker.borrow().completion_stats();
    assert_eq!(stats.downloading, 1);
    assert_eq!(stats.pending_requests, 4);
}
