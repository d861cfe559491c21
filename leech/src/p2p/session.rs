use std::{collections::HashMap, net::SocketAddr, rc::Rc, time::{Duration, Instant}};
use tokio::{sync::mpsc, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    block::{BlockData, BlockInfo},
    picker::{BlockOutcome, PickerError},
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{*, message::*, handshake::*, state::*};

type MessageSink<S> = SplitSink<Framed<S, MessageCodec>, Message>;

pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Shared with every session of the torrent, never borrowed across an await.
    ctx: Rc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Pending block requests from client to peer, and when they went out.
    requests_out: HashMap<BlockInfo, Instant>,

    // Pieces this session has claimed from the picker.
    active_pieces: Vec<usize>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    // Only the first message after the handshake may be a bitfield.
    bitfield_allowed: bool,

    // Time of the last message from the peer.
    last_message: Instant,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Rc<TorrentContext>) -> (PeerSession, PeerTx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces);
        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                requests_out: HashMap::new(),
                active_pieces: Vec::new(),
                bitfield,
                bitfield_allowed: false,
                last_message: Instant::now(),
                state: SessionState::default(),
            },
            peer_tx,
        )
    }

    // Connects out to the peer, runs until the session ends and reports back.
    #[tracing::instrument(name = "peer", skip(self), fields(address = %self.address))]
    pub async fn start(&mut self) {
        let result = self.connect().await;
        self.disconnect(result.err());
    }

    async fn connect(&mut self) -> Result<()> {
        self.state.update(|state| state.conn_state = ConnState::Connecting);
        self.report_state();
        let stream = time::timeout(self.ctx.config.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");
        self.run_stream(stream).await
    }

    // Handshakes and exchanges messages over an established stream.
    pub async fn run_stream<S: PeerStream>(&mut self, stream: S) -> Result<()> {
        let mut socket = Framed::new(stream, HandshakeCodec);
        self.exchange_handshake(&mut socket).await?;
        // Keeps anything the peer sent straight after its handshake.
        let socket = socket.map_codec(|_| MessageCodec);
        self.run(socket).await
    }

    // Releases everything the session held and tells the torrent why it ended.
    pub fn disconnect(&mut self, error: Option<PeerError>) {
        self.ctx.picker.borrow_mut().peer_disconnected(self.address, &self.bitfield);
        self.requests_out.clear();
        self.active_pieces.clear();

        match &error {
            Some(e) => tracing::warn!("session ended: {}", e),
            None => tracing::info!("session ended"),
        }
        self.state.close(error.is_some());
        self.report_state();
        self.ctx.torrent_tx.send(TorrentCommand::PeerDisconnected {
            address: self.address,
            error,
        }).ok();
    }

    async fn exchange_handshake<S: PeerStream>(&mut self, socket: &mut Framed<S, HandshakeCodec>) -> Result<()> {
        let handshake = Handshake::new(self.ctx.info_hash, *self.ctx.client_id.as_bytes());
        tracing::trace!("send handshake");
        socket.send(handshake).await?;
        self.state.update(|state| {
            state.conn_state = ConnState::HandshakeSent;
            state.handshake_sent = true;
        });
        self.report_state();

        let reply = match time::timeout(self.ctx.config.connect_timeout, socket.next()).await {
            Err(_) => return Err(PeerError::Timeout),
            Ok(None) => return Err(PeerError::NoHandshake),
            Ok(Some(reply)) => reply?,
        };
        if reply.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }

        self.state.update(|state| {
            state.conn_state = ConnState::Connected;
            state.handshake_received = true;
        });
        self.report_state();
        tracing::info!("handshake successful, peer connected");
        Ok(())
    }

    async fn run<S: PeerStream>(&mut self, socket: Framed<S, MessageCodec>) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        // Always sent, even with no pieces.
        let own = self.ctx.picker.borrow().own_bitfield().clone();
        self.send_message(&mut sink, Message::Bitfield(own)).await?;
        self.bitfield_allowed = true;
        self.last_message = Instant::now();

        let keep_alive_interval = self.ctx.config.keep_alive_interval;
        let mut keep_alive = time::interval_at(time::Instant::now() + keep_alive_interval, keep_alive_interval);
        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => match msg {
                Some(msg) => {
                    self.last_message = Instant::now();
                    self.handle_msg(&mut sink, msg?).await?;
                    self.bitfield_allowed = false;
                },
                None => {
                    tracing::info!("peer closed connection");
                    break;
                },
            },

            // Command from the torrent.
            Some(cmd) = self.peer_rx.recv() => match cmd {
                PeerCommand::PieceCompleted(idx) => self.handle_completed_piece(&mut sink, idx).await?,
                PeerCommand::Request(idx) => self.handle_piece_request(&mut sink, idx).await?,
                PeerCommand::Shutdown => {
                    tracing::info!("session shutdown");
                    break;
                },
            },

            _ = keep_alive.tick() => self.send_message(&mut sink, Message::KeepAlive).await?,

            _ = ticker.tick() => self.tick(&mut sink).await?,

        }}

        Ok(())
    }

    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, msg: Message) -> Result<()> {
        tracing::debug!("send: {}", msg);
        sink.send(msg).await
    }

    fn report_state(&mut self) {
        if !self.state.take_changed() {
            return;
        }
        self.ctx.torrent_tx.send(TorrentCommand::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    async fn tick<S: PeerStream>(&mut self, sink: &mut MessageSink<S>) -> Result<()> {
        if self.last_message.elapsed() >= self.ctx.config.keep_alive_interval * 2 {
            tracing::warn!("peer idle for too long");
            return Err(PeerError::Timeout);
        }

        // Give up on requests the peer hasn't answered in time.
        let now = Instant::now();
        let timeout = self.ctx.config.request_timeout;
        let expired = self.requests_out
            .iter()
            .filter(|(_, sent)| now.duration_since(**sent) >= timeout)
            .map(|(block, _)| *block)
            .collect::<Vec<_>>();
        if !expired.is_empty() {
            tracing::debug!("{} requests timed out", expired.len());
            let mut picker = self.ctx.picker.borrow_mut();
            for block in expired.iter() {
                self.requests_out.remove(block);
                picker.cancel_request(block.piece_idx, block.offset, self.address);
            }
        }
        if !expired.is_empty() {
            self.make_requests(sink).await?;
        }

        self.state.tick();
        self.report_state();
        Ok(())
    }

    async fn handle_msg<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, msg: Message) -> Result<()> {
        tracing::debug!("read: {}", msg);

        match msg {

            Message::Bitfield(bitfield) => {
                if !self.bitfield_allowed {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Free pending requests for other peers.
                    self.ctx.picker.borrow_mut().release_peer_requests(self.address);
                    self.requests_out.clear();
                    self.state.update(|state| state.in_flight = 0);
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    self.make_requests(sink).await?;
                }
            },

            Message::Interested => {
                self.state.update(|state| state.peer_interested = true);
                self.update_choke(sink).await?;
            },

            Message::NotInterested => {
                self.state.update(|state| state.peer_interested = false);
                self.update_choke(sink).await?;
            },

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Block(block) => {
                self.handle_block(block)?;
                self.make_requests(sink).await?;
            },

            // Uploading isn't supported, requests are never answered.
            Message::Request(block) => {
                if self.state.choked {
                    tracing::warn!("request whilst choked: {:?}", block);
                } else {
                    tracing::debug!("ignoring request: {:?}", block);
                }
            },

            Message::Cancel(block) => tracing::trace!("cancel for {:?}", block),

            Message::Port { port } => tracing::debug!("peer dht port {}", port),

        }

        self.report_state();
        Ok(())
    }

    async fn handle_bitfield<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.ctx.info.num_pieces;
        // Whole bytes on the wire, so up to 7 bits of padding.
        if bitfield.len() < num_pieces || bitfield.len() >= num_pieces + 8 {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield of {} bits for {} pieces", bitfield.len(), num_pieces,
            )));
        }
        bitfield.resize(num_pieces, false);
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        // Interested if peer has pieces we don't.
        let interested = self.ctx.picker.borrow_mut().peer_bitfield(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage(format!("have for piece {}", idx)));
        }
        // Peer already has piece.
        if self.bitfield[idx] {
            return Ok(());
        }
        self.bitfield.set(idx, true);
        self.state.update(|state| state.num_pieces += 1);

        let needed = self.ctx.picker.borrow_mut().peer_have(idx);
        if needed && !self.state.interested {
            self.update_interest(sink, true).await?;
        }
        self.make_requests(sink).await
    }

    fn handle_block(&mut self, block: BlockData) -> Result<()> {
        let info = block.info();
        if self.requests_out.remove(&info).is_none() {
            tracing::debug!("unrequested block: {:?}", info);
        }
        let len = block.data.len() as u64;
        self.state.block_received(len);

        let outcome = self.ctx.picker
            .borrow_mut()
            .record_block_received(block.piece_idx, block.offset, &block.data, self.address);

        match outcome {
            Ok(BlockOutcome::Completed) => {
                tracing::info!("piece {} completed", block.piece_idx);
                self.active_pieces.retain(|&idx| idx != block.piece_idx);
                self.ctx.torrent_tx.send(TorrentCommand::PieceCompleted(block.piece_idx))?;
            },
            Ok(BlockOutcome::HashMismatch) => {
                tracing::warn!("piece {} failed verification", block.piece_idx);
                self.requests_out.retain(|b, _| b.piece_idx != block.piece_idx);
            },
            Ok(_) => {},
            Err(PickerError::Store(e)) => {
                tracing::error!("failed to save piece {}: {}", block.piece_idx, e);
                self.requests_out.retain(|b, _| b.piece_idx != block.piece_idx);
            },
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // Announce a verified piece, cancelling any requests still out for it.
    async fn handle_completed_piece<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, idx: usize) -> Result<()> {
        let cancels = self.requests_out
            .keys()
            .filter(|b| b.piece_idx == idx)
            .copied()
            .collect::<Vec<_>>();
        for block in cancels {
            self.requests_out.remove(&block);
            sink.feed(Message::Cancel(block)).await?;
        }
        self.active_pieces.retain(|&p| p != idx);
        self.send_message(sink, Message::Have { idx: idx as u32 }).await?;

        let needed = self.ctx.picker.borrow().peer_needs(&self.bitfield);
        if self.state.interested && !needed {
            self.update_interest(sink, false).await?;
        }
        Ok(())
    }

    // A piece the torrent wants retried, taken only if the peer has it and nobody else has.
    async fn handle_piece_request<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, idx: usize) -> Result<()> {
        if !self.bitfield.get(idx).map_or(false, |b| *b) {
            return Ok(());
        }
        if self.ctx.picker.borrow_mut().start_piece(idx) {
            tracing::debug!("took over piece {}", idx);
            self.active_pieces.push(idx);
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    async fn update_interest<S: PeerStream>(&mut self, sink: &mut MessageSink<S>, interested: bool) -> Result<()> {
        if interested == self.state.interested {
            return Ok(());
        }
        let msg = if interested { Message::Interested } else { Message::NotInterested };
        self.send_message(sink, msg).await?;
        self.state.update(|state| state.interested = interested);
        self.make_requests(sink).await
    }

    async fn update_choke<S: PeerStream>(&mut self, sink: &mut MessageSink<S>) -> Result<()> {
        if self.state.peer_interested && self.state.choked {
            self.send_message(sink, Message::Unchoke).await?;
            self.state.update(|state| state.choked = false);
        } else if !self.state.peer_interested && !self.state.choked {
            self.send_message(sink, Message::Choke).await?;
            self.state.update(|state| state.choked = true);
        }
        Ok(())
    }

    // Queue requests up to the burst size.
    async fn make_requests<S: PeerStream>(&mut self, sink: &mut MessageSink<S>) -> Result<()> {
        if !self.state.can_request() {
            return Ok(());
        }

        let burst = self.ctx.config.request_burst;
        let requests = {
            let mut picker = self.ctx.picker.borrow_mut();
            self.active_pieces.retain(|&idx| picker.is_downloading(idx));

            let mut requests = Vec::new();
            while self.requests_out.len() + requests.len() < burst {
                let next = self.active_pieces
                    .iter()
                    .find_map(|&idx| picker.next_block_for_peer(idx, self.address));
                let block = match next {
                    Some(block) => block,
                    None => {
                        let Some(idx) = picker.next_piece_to_request(Some(&self.bitfield)) else {
                            break;
                        };
                        self.active_pieces.push(idx);
                        // A fresh claim with nothing to ask for ends the burst.
                        match picker.next_block_for_peer(idx, self.address) {
                            Some(block) => block,
                            None => break,
                        }
                    },
                };
                if !picker.record_request_sent(block.piece_idx, block.offset, block.len, self.address) {
                    break;
                }
                requests.push(block);
            }
            requests
        };

        if requests.is_empty() {
            return Ok(());
        }
        tracing::debug!("requesting {} blocks", requests.len());
        let now = Instant::now();
        for block in requests {
            self.requests_out.insert(block, now);
            sink.feed(Message::Request(block)).await?;
        }
        sink.flush().await?;
        let in_flight = self.requests_out.len();
        self.state.update(|state| state.in_flight = in_flight);
        Ok(())
    }
}
