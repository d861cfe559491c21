use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
};
use rand::Rng;
use crate::p2p::FailureKind;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// Peers that failed for local reasons are tried again after this, free of charge.
const IGNORED_RETRY_DELAY: Duration = Duration::from_secs(5);

// Exponential backoff with +/-15% jitter, `attempts` counts from 1.
pub fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let delay = BASE_BACKOFF.saturating_mul(1 << exp).min(MAX_BACKOFF);
    delay.mul_f64(rand::thread_rng().gen_range(0.85..1.15))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailedPeer {

    attempts: u32,

    // None once the peer is out of attempts.
    next_retry: Option<Instant>,

}

// Every peer address a torrent knows of, and what to do with it next.
#[derive(Debug)]
pub struct PeerPool {

    // Not yet dialled, in discovery order.
    queue: VecDeque<SocketAddr>,

    failed: HashMap<SocketAddr, FailedPeer>,

    // Attempts so far, kept while a failed peer is queued again.
    attempts: HashMap<SocketAddr, u32>,

    blacklist: HashSet<SocketAddr>,

    max_attempts: u32,

}

impl PeerPool {

    pub fn new(max_attempts: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            failed: HashMap::new(),
            attempts: HashMap::new(),
            blacklist: HashSet::new(),
            max_attempts,
        }
    }

    // Queues peers not already known, returns how many were new.
    pub fn add_peers<I, F>(&mut self, peers: I, is_active: F) -> usize
    where
        I: IntoIterator<Item = SocketAddr>,
        F: Fn(&SocketAddr) -> bool,
    {
        let mut added = 0;
        for address in peers {
            if is_active(&address) || self.is_known(&address) {
                continue;
            }
            self.queue.push_back(address);
            added += 1;
        }
        added
    }

    pub fn is_known(&self, address: &SocketAddr) -> bool {
        self.blacklist.contains(address)
            || self.failed.contains_key(address)
            || self.queue.contains(address)
    }

    pub fn next_peer(&mut self) -> Option<SocketAddr> {
        self.queue.pop_front()
    }

    // Back of the queue, for peers that can't be dialled just now.
    pub fn push_back(&mut self, address: SocketAddr) {
        if !self.queue.contains(&address) {
            self.queue.push_back(address);
        }
    }

    pub fn record_failure(&mut self, address: SocketAddr, kind: FailureKind, now: Instant) {
        match kind {
            FailureKind::Blacklist => {
                tracing::debug!("blacklisting {}", address);
                self.failed.remove(&address);
                self.attempts.remove(&address);
                self.blacklist.insert(address);
            },
            FailureKind::Ignore => {
                let attempts = self.attempts.get(&address).copied().unwrap_or(0);
                self.failed.insert(address, FailedPeer {
                    attempts,
                    next_retry: Some(now + IGNORED_RETRY_DELAY),
                });
            },
            FailureKind::Retry => {
                let attempts = self.attempts.get(&address).copied().unwrap_or(0) + 1;
                self.attempts.insert(address, attempts);
                let next_retry = if attempts < self.max_attempts {
                    Some(now + backoff(attempts))
                } else {
                    tracing::trace!("{} out of attempts", address);
                    None
                };
                self.failed.insert(address, FailedPeer { attempts, next_retry });
            },
        }
    }

    // A successful handshake wipes the peer's record.
    pub fn record_connected(&mut self, address: SocketAddr) {
        self.attempts.remove(&address);
    }

    // Queues up to `limit` failed peers whose backoff has passed, earliest first.
    pub fn requeue_failed(&mut self, now: Instant, limit: usize) -> usize {
        let mut due = self.failed
            .iter()
            .filter_map(|(address, peer)| peer.next_retry.filter(|t| *t <= now).map(|t| (t, *address)))
            .collect::<Vec<_>>();
        due.sort();
        due.truncate(limit);
        for (_, address) in due.iter() {
            self.failed.remove(address);
            self.queue.push_back(*address);
        }
        due.len()
    }

    // Forgets every failure and queues `active` and all failed peers again.
    // Blacklisted peers stay out.
    pub fn reset_all<I: IntoIterator<Item = SocketAddr>>(&mut self, active: I) {
        let failed = self.failed.drain().map(|(address, _)| address).collect::<Vec<_>>();
        for address in active.into_iter().chain(failed) {
            self.push_back(address);
        }
        self.attempts.clear();
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn failed(&self) -> usize {
        self.failed.len()
    }

    pub fn blacklisted(&self) -> usize {
        self.blacklist.len()
    }

    pub fn is_blacklisted(&self, address: &SocketAddr) -> bool {
        self.blacklist.contains(address)
    }

    // Distinct addresses known, excluding the blacklist.
    pub fn len(&self) -> usize {
        self.queue.len() + self.failed.len()
    }
}
