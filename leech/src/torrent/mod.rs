use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};
use futures::future::join_all;
use tokio::{sync::mpsc, task::LocalSet, time};
use crate::{
    config::{ClientIdentity, Config},
    info::TorrentInfo,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{state::SessionState, FailureKind, PeerCommand, PeerError, PeerHandle},
    picker::Picker,
    stats::{estimate_eta, DownloadStats},
    store::{PieceStore, StoreError},
    tracker::{AnnounceParams, Event, TrackerManager},
    ID,
};

mod pool;
#[cfg(test)]
mod tests;

pub use pool::PeerPool;

// Stuck pieces handed back to peers per sweep.
const MAX_STUCK_RETRIES: usize = 10;

// Missing pieces re-requested when the completion check fails.
const MAX_MISSING_RETRIES: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::ChannelError(e.to_string())
    }
}

#[derive(Debug)]
pub enum TorrentCommand {

    // Latest state of a peer session.
    PeerState { address: SocketAddr, state: SessionState },

    // Sent by a peer session once a piece is verified and saved.
    PieceCompleted(usize),

    // Last message from a session, error is None for a clean close.
    PeerDisconnected { address: SocketAddr, error: Option<PeerError> },

    // Peers found outside the trackers.
    AddPeers(Vec<SocketAddr>),

    Shutdown,

}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Idle,
    Initialized,
    Downloading,
    Completed,
    Stopped,
}

// State shared by the torrent and all of its peer sessions on one thread.
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ClientIdentity,

    pub info: TorrentInfo,

    // Only ever borrowed between awaits.
    pub picker: RefCell<Picker>,

    // Commands to the torrent.
    pub torrent_tx: TorrentTx,

    pub config: Config,

}

// Controls a running torrent from anywhere, including other threads.
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    torrent_tx: TorrentTx,
}

impl TorrentHandle {

    pub fn stop(&self) -> Result<()> {
        self.torrent_tx.send(TorrentCommand::Shutdown).map_err(Into::into)
    }

    pub fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<()> {
        self.torrent_tx.send(TorrentCommand::AddPeers(peers)).map_err(Into::into)
    }
}

// Samples of downloaded bytes, used for speed and stall detection.
#[derive(Debug)]
struct ProgressMonitor {
    last_downloaded: u64,
    last_sample: Instant,
    unchanged: usize,
}

pub struct Torrent {

    name: String,

    ctx: Rc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Sessions told to shut down that haven't ended yet.
    closing: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but don't have a session with.
    pool: PeerPool,

    trackers: TrackerManager,

    torrent_rx: TorrentRx,

    state: TorrentState,

    monitor: ProgressMonitor,

    stats: DownloadStats,

    next_announce: Duration,

}

impl Torrent {

    pub fn new(metainfo: &MetaInfo, config: Config, store: Box<dyn PieceStore>) -> Torrent {
        let info = TorrentInfo::new(metainfo);
        let picker = Picker::new(info.clone(), metainfo.piece_hashes(), store, &config);
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let trackers = TrackerManager::new(metainfo.trackers(), &config);
        let pool = PeerPool::new(config.max_retry_attempts);

        Torrent {
            name: metainfo.name().to_string(),
            ctx: Rc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id: config.client_id.clone(),
                info,
                picker: RefCell::new(picker),
                torrent_tx,
                config,
            }),
            peers: HashMap::new(),
            closing: HashMap::new(),
            pool,
            trackers,
            torrent_rx,
            state: TorrentState::Idle,
            monitor: ProgressMonitor {
                last_downloaded: 0,
                last_sample: Instant::now(),
                unchanged: 0,
            },
            stats: DownloadStats::default(),
            next_announce: Duration::ZERO,
        }
    }

    // Swaps the trackers built from the metainfo.
    pub fn with_trackers(mut self, trackers: TrackerManager) -> Torrent {
        self.trackers = trackers;
        self
    }

    pub fn handle(&self) -> TorrentHandle {
        TorrentHandle { torrent_tx: self.ctx.torrent_tx.clone() }
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    // Prepares the store, picks up pieces from a previous run and asks the
    // trackers for peers.
    #[tracing::instrument(skip_all, name = "torrent", fields(name = %self.name))]
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != TorrentState::Idle {
            return Ok(());
        }
        let resumed = {
            let mut picker = self.ctx.picker.borrow_mut();
            picker.store_mut().initialize()?;
            picker.load_completed()
        };
        if resumed > 0 {
            tracing::info!("resuming with {}/{} pieces", resumed, self.ctx.info.num_pieces);
        }
        self.state = TorrentState::Initialized;
        self.stats = self.build_stats(0.0);
        self.next_announce = self.announce(Some(Event::Started)).await;
        Ok(())
    }

    // Runs until every piece is downloaded and the files are written, or until stopped.
    pub async fn start_download(&mut self) -> Result<()> {
        self.initialize().await?;
        let local = LocalSet::new();
        local.run_until(self.run()).await
    }

    pub async fn stop(&mut self) {
        if matches!(self.state, TorrentState::Completed | TorrentState::Stopped) {
            return;
        }
        self.shutdown_peers().await;
        self.announce(Some(Event::Stopped)).await;
        self.state = TorrentState::Stopped;
    }

    // Queues peers for connection, returns how many were new.
    pub fn add_peers(&mut self, peers: Vec<SocketAddr>) -> usize {
        let added = self.pool.add_peers(peers, |address| self.peers.contains_key(address));
        tracing::debug!("added {} peers", added);
        added
    }

    pub fn stats(&self) -> DownloadStats {
        let mut stats = self.build_stats(self.stats.download_speed);
        stats.eta = self.stats.eta;
        stats
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(name = %self.name))]
    async fn run(&mut self) -> Result<()> {
        self.state = TorrentState::Downloading;
        self.monitor.last_sample = Instant::now();
        let complete = self.ctx.picker.borrow().is_download_complete();
        if complete && self.finish().await? {
            return Ok(());
        }

        let config = &self.ctx.config;
        let mut maintain = time::interval(Duration::from_secs(1));
        let mut progress = time::interval_at(time::Instant::now() + config.progress_interval, config.progress_interval);
        let mut stuck = time::interval_at(time::Instant::now() + config.stuck_check_interval, config.stuck_check_interval);
        let announce = time::sleep(self.next_announce);
        tokio::pin!(announce);

        // Top level torrent loop, commands first so sessions are never pruned
        // before their last message is read.
        loop { tokio::select! {
            biased;

            Some(cmd) = self.torrent_rx.recv() => match cmd {

                TorrentCommand::PeerState { address, state } => self.handle_peer_state(address, state),

                TorrentCommand::PieceCompleted(idx) => {
                    if self.handle_piece_completed(idx).await? {
                        break;
                    }
                },

                TorrentCommand::PeerDisconnected { address, error } => self.handle_disconnect(address, error),

                TorrentCommand::AddPeers(peers) => {
                    self.add_peers(peers);
                },

                TorrentCommand::Shutdown => {
                    tracing::info!("stopping torrent");
                    self.stop().await;
                    break;
                },
            },

            _ = maintain.tick() => self.maintain_connections(),

            _ = progress.tick() => {
                if self.check_progress() {
                    let delay = self.announce(None).await;
                    announce.as_mut().reset(time::Instant::now() + delay);
                }
            },

            _ = stuck.tick() => self.check_stuck_pieces(),

            _ = &mut announce => {
                let delay = self.announce(None).await;
                announce.as_mut().reset(time::Instant::now() + delay);
            },

        }}

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(num_peers = self.peers.len() + self.pool.len()))]
    async fn announce(&mut self, event: Option<Event>) -> Duration {
        let (downloaded, left) = {
            let picker = self.ctx.picker.borrow();
            let stats = picker.completion_stats();
            (picker.downloaded(), self.ctx.info.total_len.saturating_sub(stats.bytes_completed))
        };
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: *self.ctx.client_id.as_bytes(),
            port: self.ctx.config.listen_port,
            uploaded: 0,
            downloaded,
            left,
            event,
            num_want: Some(self.ctx.config.num_want),
        };

        let round = self.trackers.announce(params, self.ctx.config.healthy_swarm_peers).await;
        let added = self.pool.add_peers(round.peers.iter().copied(), |address| self.peers.contains_key(address));
        let known = self.peers.len() + self.pool.len();
        let delay = self.trackers.next_announce_delay(known, &round);
        tracing::info!("{} new peers from trackers, next announce in {:?}", added, delay);
        delay
    }

    fn maintain_connections(&mut self) {
        let now = Instant::now();
        self.closing.retain(|_, peer| !peer.is_finished());

        // Sessions that ended without saying so.
        let dead = self.peers
            .iter()
            .filter(|(_, peer)| peer.is_finished())
            .map(|(address, _)| *address)
            .collect::<Vec<_>>();
        for address in dead {
            tracing::warn!("session for {} ended unexpectedly", address);
            self.peers.remove(&address);
            self.pool.record_failure(address, FailureKind::Retry, now);
        }

        let config = &self.ctx.config;
        if self.peers.len() < config.min_active_connections {
            let requeued = self.pool.requeue_failed(now, config.retry_peer_limit);
            if requeued > 0 {
                tracing::debug!("retrying {} failed peers", requeued);
            }
        }

        let mut skipped = Vec::new();
        while self.peers.len() < config.max_connections {
            let Some(address) = self.pool.next_peer() else { break };
            if self.closing.contains_key(&address) {
                skipped.push(address);
                continue;
            }
            if self.peers.contains_key(&address) {
                continue;
            }
            tracing::trace!("connecting to {}", address);
            self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone()));
        }
        for address in skipped {
            self.pool.push_back(address);
        }
    }

    // Samples progress, true when the download has stalled and peers were reset.
    fn check_progress(&mut self) -> bool {
        let now = Instant::now();
        let downloaded = self.ctx.picker.borrow().downloaded();
        let elapsed = now.saturating_duration_since(self.monitor.last_sample).as_secs_f64();
        let delta = downloaded.saturating_sub(self.monitor.last_downloaded);
        let speed = if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };
        self.monitor.last_sample = now;
        self.monitor.last_downloaded = downloaded;

        let mut stats = self.build_stats(speed);
        stats.eta = estimate_eta(stats.total_len.saturating_sub(stats.bytes_completed), speed);
        tracing::info!(
            "{:.1}% complete, {} peers, {:.0} B/s",
            stats.percentage, stats.active_peers, stats.download_speed,
        );
        let complete = stats.is_complete();
        self.stats = stats;

        if delta == 0 && !complete {
            self.monitor.unchanged += 1;
        } else {
            self.monitor.unchanged = 0;
        }
        if self.monitor.unchanged < self.ctx.config.stagnation_samples {
            return false;
        }

        tracing::warn!("no progress for {} samples, resetting peers", self.monitor.unchanged);
        self.monitor.unchanged = 0;
        self.reset_all_peers();
        true
    }

    fn check_stuck_pieces(&mut self) {
        let now = Instant::now();
        let stuck = {
            let mut picker = self.ctx.picker.borrow_mut();
            picker.sweep_expired_requests(now);
            picker.mark_stuck_pieces_available(now)
        };
        if stuck.is_empty() {
            return;
        }
        tracing::debug!("{} pieces stuck", stuck.len());
        for idx in stuck.into_iter().take(MAX_STUCK_RETRIES) {
            self.broadcast(PeerCommand::Request(idx));
        }
    }

    // Disconnects every peer and starts over with all non-blacklisted addresses.
    fn reset_all_peers(&mut self) {
        let active = self.peers.keys().copied().collect::<Vec<_>>();
        {
            let mut picker = self.ctx.picker.borrow_mut();
            for address in active.iter() {
                picker.release_peer_requests(*address);
            }
        }
        for (address, peer) in self.peers.drain() {
            peer.send(PeerCommand::Shutdown);
            self.closing.insert(address, peer);
        }
        self.pool.reset_all(active);
        self.trackers.reset();
    }

    fn broadcast(&self, cmd: PeerCommand) {
        for peer in self.peers.values() {
            peer.send(cmd);
        }
    }

    fn handle_peer_state(&mut self, address: SocketAddr, state: SessionState) {
        if let Some(peer) = self.peers.get_mut(&address) {
            if state.is_connected() && !peer.state.is_connected() {
                self.pool.record_connected(address);
            }
            peer.state = state;
        }
    }

    fn handle_disconnect(&mut self, address: SocketAddr, error: Option<PeerError>) {
        // Sessions shut down by us are already gone.
        if self.peers.remove(&address).is_none() {
            return;
        }
        let kind = error.as_ref().map_or(FailureKind::Retry, PeerError::kind);
        tracing::debug!("peer {} disconnected ({:?})", address, kind);
        self.pool.record_failure(address, kind, Instant::now());
    }

    // True once the torrent is finished.
    async fn handle_piece_completed(&mut self, idx: usize) -> Result<bool> {
        self.broadcast(PeerCommand::PieceCompleted(idx));
        let stats = self.ctx.picker.borrow().completion_stats();
        tracing::info!("piece {} downloaded, {}/{} pieces", idx, stats.completed, stats.total);
        if stats.completed < stats.total {
            return Ok(false);
        }
        self.finish().await
    }

    // Checks completion against the store before writing out the files.
    async fn finish(&mut self) -> Result<bool> {
        let (lost, complete) = {
            let mut picker = self.ctx.picker.borrow_mut();
            let lost = picker.recheck_store();
            (lost, picker.is_download_complete())
        };
        if !lost.is_empty() || !complete {
            let missing = self.ctx.picker.borrow().missing_pieces();
            tracing::warn!("completion check failed, {} pieces missing", missing.len());
            for idx in missing.into_iter().take(MAX_MISSING_RETRIES) {
                self.broadcast(PeerCommand::Request(idx));
            }
            return Ok(false);
        }

        tracing::info!("download complete");
        self.shutdown_peers().await;
        {
            let mut picker = self.ctx.picker.borrow_mut();
            let store = picker.store_mut();
            store.reconstruct_files()?;
            store.cleanup()?;
        }
        self.announce(Some(Event::Completed)).await;
        self.state = TorrentState::Completed;
        self.stats = self.build_stats(0.0);
        Ok(true)
    }

    // Tells every session to end and waits for them, up to the connect timeout.
    async fn shutdown_peers(&mut self) {
        tracing::info!("disconnecting from {} peers", self.peers.len());
        self.broadcast(PeerCommand::Shutdown);
        let mut handles = self.peers
            .drain()
            .chain(self.closing.drain())
            .map(|(_, peer)| peer.session_handle)
            .collect::<Vec<_>>();

        let timeout = self.ctx.config.connect_timeout;
        if time::timeout(timeout, join_all(handles.iter_mut())).await.is_err() {
            tracing::warn!("sessions still running after {:?}, aborting", timeout);
            handles.iter().for_each(|h| h.abort());
        }
    }

    fn build_stats(&self, speed: f64) -> DownloadStats {
        let completion = self.ctx.picker.borrow().completion_stats();
        let percentage = if completion.total == 0 {
            0.0
        } else {
            completion.completed as f64 / completion.total as f64 * 100.0
        };
        DownloadStats {
            percentage,
            active_peers: self.peers.values().filter(|p| p.state.is_connected()).count(),
            download_speed: speed,
            eta: None,
            completed_pieces: completion.completed,
            total_pieces: completion.total,
            bytes_completed: completion.bytes_completed,
            total_len: self.ctx.info.total_len,
        }
    }
}
