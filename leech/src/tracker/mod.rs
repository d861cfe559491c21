use std::{collections::HashSet, net::SocketAddr, time::Duration};
use url::Url;
use crate::{Config, ID};

mod http;
mod udp;
mod manager;
pub use udp::UdpTracker;
pub use http::HttpTracker;
pub use manager::{TrackerManager, AnnounceRound};

type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("http request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("malformed bencode response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("tracker timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("tracker url has no usable host or port")]
    InvalidUrl,

    // Tracker explicitly refused the announce.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch {
        expected: i32,
        actual: i32,
    },

}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse>;

    fn url(&self) -> &Url;

}

// Builds a tracker client based on url scheme.
pub fn tracker_for(url: Url, config: &Config) -> Option<Box<dyn Tracker>> {
    match url.scheme() {
        "http" | "https" => Some(Box::new(HttpTracker::new(url, config.tracker_timeout))),
        "udp" => Some(Box::new(UdpTracker::new(url, config.udp_timeout))),
        scheme => {
            tracing::warn!("unsupported tracker scheme: {}", scheme);
            None
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {

    // Time the tracker wants between regular announces.
    pub interval: Duration,

    pub seeders: u32,

    pub leechers: u32,

    pub peers: Vec<SocketAddr>,

}

impl AnnounceResponse {

    pub fn new(interval: Duration, seeders: u32, leechers: u32, peers: Vec<SocketAddr>) -> Self {
        Self { interval, seeders, leechers, peers: dedup_peers(peers) }
    }
}

// Removes repeated addresses, keeping first-seen order.
pub fn dedup_peers(peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::with_capacity(peers.len());
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}

// What we tell a tracker about ourselves on each announce.
#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub client_id: ID,

    // Port we claim to listen on.
    pub port: u16,

    // Byte counters since the started event.
    pub uploaded: u64,
    pub downloaded: u64,

    // Bytes still missing.
    pub left: u64,

    // None for a regular re-announce.
    pub event: Option<Event>,

    pub num_want: Option<u32>,

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Completed,
    Started,
    Stopped,
}

impl Event {

    // Event field of a UDP announce, 0 when there is no event.
    pub fn code(event: Option<Event>) -> i32 {
        event.map_or(0, |event| event as i32 + 1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Completed => "completed",
            Event::Started => "started",
            Event::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_peers() {
        let a = SocketAddr::from(([1, 2, 3, 4], 1));
        let b = SocketAddr::from(([1, 2, 3, 4], 2));
        assert_eq!(dedup_peers(vec![a, b, a, b, a]), vec![a, b]);
    }

    #[test]
    fn test_event_codes() {
        assert_eq!(Event::code(None), 0);
        assert_eq!(Event::code(Some(Event::Completed)), 1);
        assert_eq!(Event::code(Some(Event::Started)), 2);
        assert_eq!(Event::code(Some(Event::Stopped)), 3);
        assert_eq!(Event::Started.to_string(), "started");
    }

    #[test]
    fn test_tracker_for_scheme() {
        let config = Config::default();
        assert!(tracker_for(Url::parse("http://t.example/announce").unwrap(), &config).is_some());
        assert!(tracker_for(Url::parse("udp://t.example:80").unwrap(), &config).is_some());
        assert!(tracker_for(Url::parse("wss://t.example").unwrap(), &config).is_none());
    }
}
