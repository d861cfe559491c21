use crate::stats::ThroughputStats;

// Lifecycle of a peer connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    HandshakeSent,
    Connected,
    // Closed because of a failure.
    Error,
}

// Snapshot a session reports to the torrent whenever it changes.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // We refuse the peer's requests.
    pub choked: bool,

    // We want pieces the peer has.
    pub interested: bool,

    // The peer refuses our requests.
    pub peer_choking: bool,

    pub peer_interested: bool,

    pub handshake_sent: bool,

    pub handshake_received: bool,

    // Requests sent to the peer still waiting on data.
    pub in_flight: usize,

    pub throughput: ThroughputStats,

    // Pieces the peer advertised.
    pub num_pieces: usize,

    // Set by `update`, cleared once reported.
    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        // Both sides start out choked and uninterested.
        SessionState {
            conn_state: ConnState::default(),
            choked: true,
            peer_choking: true,
            interested: false,
            peer_interested: false,
            handshake_sent: false,
            handshake_received: false,
            in_flight: 0,
            num_pieces: 0,
            throughput: ThroughputStats::default(),
            changed: false,
        }
    }
}

impl SessionState {

    // Starts a new throughput window.
    pub fn tick(&mut self) {
        self.throughput.reset();
        self.changed = true;
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }

    pub fn is_connected(&self) -> bool {
        self.conn_state == ConnState::Connected
    }

    // Requests only make sense while unchoked and interested.
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.interested
    }

    pub fn block_received(&mut self, len: u64) {
        self.update(|state| {
            state.throughput.down += len;
            state.in_flight = state.in_flight.saturating_sub(1);
        });
    }

    pub fn close(&mut self, failed: bool) {
        self.update(|state| {
            state.conn_state = if failed { ConnState::Error } else { ConnState::Disconnected };
            state.in_flight = 0;
        });
    }

    // Take the pending change, if any.
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }
}
