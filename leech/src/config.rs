use std::{path::PathBuf, time::Duration};
use rand::{distributions::Alphanumeric, Rng};
use crate::ID;

// Azureus style client prefix, the rest of the id is random.
const PEER_ID_PREFIX: &[u8; 8] = b"-LE0001-";

// The 20 byte peer id we present to trackers and peers.
// Generated once when the client starts and passed down explicitly.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity(ID);

impl ClientIdentity {

    pub fn generate() -> Self {
        let mut id = [0; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .zip(id[8..].iter_mut())
            .for_each(|(c, b)| *b = c);
        Self(id)
    }

    pub fn from_bytes(id: ID) -> Self { Self(id) }

    pub fn as_bytes(&self) -> &ID { &self.0 }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: ClientIdentity,

    // Where downloaded files (and in progress pieces) are written.
    pub dir: PathBuf,

    // Port reported to trackers.
    pub listen_port: u16,

    // Upper bound on concurrent peer sessions.
    pub max_connections: usize,

    // Below this many sessions failed peers are retried.
    pub min_active_connections: usize,

    pub connect_timeout: Duration,

    pub max_retry_attempts: u32,

    // Max failed peers requeued per maintenance tick.
    pub retry_peer_limit: usize,

    pub keep_alive_interval: Duration,

    // Max outstanding block requests per peer.
    pub request_burst: usize,

    // Pending requests older than this are dropped.
    pub request_timeout: Duration,

    // A downloading piece without block activity for this long is handed back.
    pub stuck_piece_timeout: Duration,

    pub stuck_check_interval: Duration,

    pub progress_interval: Duration,

    // Unchanged progress samples before the swarm is considered stalled.
    pub stagnation_samples: usize,

    pub num_want: u32,

    // Trackers announced to concurrently in one rotation step.
    pub tracker_batch_size: usize,

    pub tracker_timeout: Duration,

    pub udp_timeout: Duration,

    pub healthy_swarm_peers: usize,

    pub struggling_swarm_peers: usize,

    pub log_level: tracing::Level,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: ClientIdentity::generate(),
            dir: PathBuf::from("downloads"),
            listen_port: 6881,
            max_connections: 200,
            min_active_connections: 5,
            connect_timeout: Duration::from_secs(15),
            max_retry_attempts: 2,
            retry_peer_limit: 15,
            keep_alive_interval: Duration::from_secs(120),
            request_burst: 20,
            request_timeout: Duration::from_secs(30),
            stuck_piece_timeout: Duration::from_secs(30),
            stuck_check_interval: Duration::from_secs(5),
            progress_interval: Duration::from_secs(2),
            stagnation_samples: 5,
            num_want: 80,
            tracker_batch_size: 5,
            tracker_timeout: Duration::from_secs(5),
            udp_timeout: Duration::from_secs(15),
            healthy_swarm_peers: 30,
            struggling_swarm_peers: 10,
            log_level: tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_format() {
        let id = ClientIdentity::generate();
        let bytes = id.as_bytes();
        assert_eq!(&bytes[..8], b"-LE0001-");
        assert!(bytes[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_config_keeps_identity() {
        let config = Config::default();
        let cloned = config.clone();
        assert_eq!(config.client_id, cloned.client_id);
    }
}
