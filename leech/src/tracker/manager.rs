use std::{collections::HashSet, net::SocketAddr, time::{Duration, Instant}};
use futures::future::join_all;
use url::Url;
use crate::Config;
use super::{tracker_for, AnnounceParams, AnnounceResponse, Event, Tracker};

// Consecutive failures after which a tracker is left out of rotation.
pub const MAX_TRACKER_FAILURES: u32 = 5;

// Used when no tracker gave an interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

const ALL_FAILED_RETRY: Duration = Duration::from_secs(30);
const STRUGGLING_INTERVAL: Duration = Duration::from_secs(60);
const RECOVERING_INTERVAL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackerProtocol {
    Udp,
    Http,
}

impl TrackerProtocol {
    fn of(url: &Url) -> Self {
        match url.scheme() {
            "udp" => TrackerProtocol::Udp,
            _ => TrackerProtocol::Http,
        }
    }
}

pub struct TrackerRecord {

    client: Box<dyn Tracker>,

    protocol: TrackerProtocol,

    // Consecutive failures, reset on success.
    failures: u32,

    successes: u32,

    last_success: Option<Instant>,

    last_failure: Option<Instant>,

    // Peers in the last successful response.
    last_peers: usize,

    interval: Option<Duration>,

    seeders: u32,

    leechers: u32,

}

impl TrackerRecord {

    fn new(client: Box<dyn Tracker>) -> Self {
        Self {
            protocol: TrackerProtocol::of(client.url()),
            client,
            failures: 0,
            successes: 0,
            last_success: None,
            last_failure: None,
            last_peers: 0,
            interval: None,
            seeders: 0,
            leechers: 0,
        }
    }

    fn is_usable(&self) -> bool {
        self.failures < MAX_TRACKER_FAILURES
    }


    // Errors stop here, a failed announce is just no peers.
    async fn announce(&mut self, params: &AnnounceParams) -> Option<AnnounceResponse> {
        match self.client.announce(params).await {
            Ok(resp) => {
                tracing::info!(
                    "tracker {} gave {} peers ({} seeders, {} leechers)",
                    self.client.url(), resp.peers.len(), resp.seeders, resp.leechers,
                );
                self.failures = 0;
                self.successes += 1;
                self.last_success = Some(Instant::now());
                self.last_peers = resp.peers.len();
                self.interval = Some(resp.interval);
                self.seeders = resp.seeders;
                self.leechers = resp.leechers;
                Some(resp)
            },
            Err(e) => {
                self.failures += 1;
                self.last_failure = Some(Instant::now());
                tracing::warn!("announce to {} failed ({}/{}): {}", self.client.url(), self.failures, MAX_TRACKER_FAILURES, e);
                None
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnnounceRound {

    // Unique across the round.
    pub peers: Vec<SocketAddr>,

    pub attempted: usize,

    pub succeeded: usize,

    // Shortest interval any tracker asked for.
    pub interval: Option<Duration>,

}

// Rotates announces across every tracker of a torrent, a batch at a time,
// until enough peers have been found.
pub struct TrackerManager {

    records: Vec<TrackerRecord>,

    // Where the next round starts.
    cursor: usize,

    batch_size: usize,

    healthy_peers: usize,

    struggling_peers: usize,

}

impl TrackerManager {

    pub fn new(tiers: Vec<Vec<Url>>, config: &Config) -> Self {
        let mut seen = HashSet::new();
        let trackers = tiers
            .into_iter()
            .flatten()
            .filter(|url| seen.insert(url.clone()))
            .filter_map(|url| tracker_for(url, config))
            .collect();
        Self::from_trackers(trackers, config)
    }

    pub fn from_trackers(trackers: Vec<Box<dyn Tracker>>, config: &Config) -> Self {
        let mut records = trackers.into_iter().map(TrackerRecord::new).collect::<Vec<_>>();
        // UDP trackers are cheaper, try them first.
        records.sort_by_key(|r| r.protocol);
        Self {
            records,
            cursor: 0,
            batch_size: config.tracker_batch_size.max(1),
            healthy_peers: config.healthy_swarm_peers,
            struggling_peers: config.struggling_swarm_peers,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn urls(&self) -> Vec<&Url> {
        self.records.iter().map(|r| r.client.url()).collect()
    }

    // Announces batch by batch from the cursor, stopping once `target` unique peers
    // are known. Completed and stopped events go to every usable tracker.
    pub async fn announce(&mut self, params: AnnounceParams, target: usize) -> AnnounceRound {
        let mut round = AnnounceRound::default();
        let n = self.records.len();
        if n == 0 {
            return round;
        }

        let target = match params.event {
            Some(Event::Completed) | Some(Event::Stopped) => usize::MAX,
            _ => target,
        };

        let usable = (0..n)
            .map(|i| (self.cursor + i) % n)
            .filter(|&i| self.records[i].is_usable())
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for batch in usable.chunks(self.batch_size) {
            let responses = join_all(
                self.records
                    .iter_mut()
                    .enumerate()
                    .filter(|(i, _)| batch.contains(i))
                    .map(|(_, r)| r.announce(&params))
            ).await;

            round.attempted += batch.len();
            for resp in responses.into_iter().flatten() {
                round.succeeded += 1;
                round.interval = Some(round.interval.map_or(resp.interval, |i| i.min(resp.interval)));
                round.peers.extend(resp.peers.into_iter().filter(|p| seen.insert(*p)));
            }

            if let Some(last) = batch.last() {
                self.cursor = (last + 1) % n;
            }
            if round.peers.len() >= target {
                break;
            }
        }

        tracing::debug!(
            "announce round: {}/{} trackers answered, {} peers",
            round.succeeded, round.attempted, round.peers.len(),
        );
        round
    }

    // Orders trackers by their record, most reliable first.
    pub fn sort_by_success(&mut self) {
        self.records.sort_by(|a, b| {
            a.failures.cmp(&b.failures)
                .then(b.successes.cmp(&a.successes))
                .then(b.last_success.cmp(&a.last_success))
                // Never failed sorts ahead of failed long ago.
                .then(a.last_failure.cmp(&b.last_failure))
        });
    }

    // Puts every tracker back in rotation, most reliable first.
    pub fn reset(&mut self) {
        self.sort_by_success();
        for r in self.records.iter_mut() {
            tracing::debug!(
                "resetting {:?} tracker {}: {} failures, last gave {} peers, last failed {:?} ago",
                r.protocol, r.client.url(), r.failures, r.last_peers, r.last_failure.map(|t| t.elapsed()),
            );
            r.failures = 0;
        }
        self.cursor = 0;
    }

    // Announce sooner while the swarm is small.
    pub fn next_announce_delay(&self, known_peers: usize, round: &AnnounceRound) -> Duration {
        if round.succeeded == 0 {
            ALL_FAILED_RETRY
        } else if known_peers < self.struggling_peers {
            STRUGGLING_INTERVAL
        } else if known_peers < self.healthy_peers {
            RECOVERING_INTERVAL
        } else {
            round.interval.unwrap_or(DEFAULT_INTERVAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
    use super::*;
    use super::super::{Result, TrackerError};

    struct FakeTracker {
        url: Url,
        peers: Vec<SocketAddr>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Tracker for FakeTracker {
        async fn announce(&mut self, _: &AnnounceParams) -> Result<AnnounceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TrackerError::Failure("down".into()));
            }
            Ok(AnnounceResponse::new(Duration::from_secs(900), 1, 1, self.peers.clone()))
        }

        fn url(&self) -> &Url { &self.url }
    }

    fn fake(i: u8, num_peers: u8, fail: bool) -> (Box<dyn Tracker>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tracker = FakeTracker {
            url: Url::parse(&format!("http://tracker{}.example/announce", i)).unwrap(),
            peers: (0..num_peers).map(|p| SocketAddr::from(([10, 0, i, p], 6881))).collect(),
            fail,
            calls: calls.clone(),
        };
        (Box::new(tracker), calls)
    }

    fn params(event: Option<Event>) -> AnnounceParams {
        AnnounceParams {
            info_hash: [0; 20],
            client_id: [0; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event,
            num_want: Some(80),
        }
    }

    #[test]
    fn test_udp_first() {
        let manager = TrackerManager::new(vec![
            vec![Url::parse("http://a.example/announce").unwrap()],
            vec![Url::parse("udp://b.example:80").unwrap(), Url::parse("http://a.example/announce").unwrap()],
        ], &Config::default());
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.urls()[0].scheme(), "udp");
    }

    #[tokio::test]
    async fn test_progressive_rotation() {
        let (trackers, calls): (Vec<_>, Vec<_>) = (0..12).map(|i| fake(i, 10, false)).unzip();
        let mut manager = TrackerManager::from_trackers(trackers, &Config::default());

        let round = manager.announce(params(None), 30).await;
        assert_eq!(round.attempted, 5);
        assert_eq!(round.succeeded, 5);
        assert_eq!(round.peers.len(), 50);
        assert_eq!(round.interval, Some(Duration::from_secs(900)));

        // Next round continues where the last one stopped.
        manager.announce(params(None), 30).await;
        assert_eq!(calls[5].load(Ordering::SeqCst), 1);
        assert_eq!(calls[0].load(Ordering::SeqCst), 1);

        // Terminal events reach everyone.
        let round = manager.announce(params(Some(Event::Stopped)), 30).await;
        assert_eq!(round.attempted, 12);
    }

    #[tokio::test]
    async fn test_failing_tracker_dropped() {
        let (bad, bad_calls) = fake(0, 0, true);
        let (good, _) = fake(1, 3, false);
        let mut manager = TrackerManager::from_trackers(vec![bad, good], &Config::default());

        for _ in 0..MAX_TRACKER_FAILURES {
            let round = manager.announce(params(None), 100).await;
            assert_eq!(round.succeeded, 1);
        }
        let round = manager.announce(params(None), 100).await;
        assert_eq!(round.attempted, 1);
        assert_eq!(bad_calls.load(Ordering::SeqCst), MAX_TRACKER_FAILURES as usize);

        // Reset brings it back, behind the reliable tracker.
        manager.reset();
        assert_eq!(manager.urls()[0].as_str(), "http://tracker1.example/announce");
        let round = manager.announce(params(None), 100).await;
        assert_eq!(round.attempted, 2);
    }

    #[tokio::test]
    async fn test_records_track_outcomes() {
        let (bad, _) = fake(0, 0, true);
        let (good, _) = fake(1, 4, false);
        let mut manager = TrackerManager::from_trackers(vec![bad, good], &Config::default());
        assert!(manager.records.iter().all(|r| r.protocol == TrackerProtocol::Http));

        manager.announce(params(None), 100).await;
        let bad = &manager.records[0];
        assert!(bad.last_failure.is_some());
        assert!(bad.last_success.is_none());
        assert_eq!(bad.last_peers, 0);
        let good = &manager.records[1];
        assert!(good.last_failure.is_none());
        assert_eq!(good.last_peers, 4);
    }

    #[tokio::test]
    async fn test_recent_failure_sorts_last() {
        let (a, _) = fake(0, 1, false);
        let (b, _) = fake(1, 1, false);
        let mut manager = TrackerManager::from_trackers(vec![a, b], &Config::default());
        manager.announce(params(None), 100).await;

        // Same counts and success time, only one has failed before.
        let at = Instant::now();
        for record in manager.records.iter_mut() {
            record.last_success = Some(at);
        }
        manager.records[0].last_failure = Some(at);
        manager.sort_by_success();
        assert_eq!(manager.urls()[0].as_str(), "http://tracker1.example/announce");
    }

    #[test]
    fn test_announce_delay() {
        let manager = TrackerManager::from_trackers(Vec::new(), &Config::default());
        let ok = AnnounceRound { succeeded: 1, interval: Some(Duration::from_secs(900)), ..Default::default() };
        let failed = AnnounceRound { attempted: 3, ..Default::default() };

        assert_eq!(manager.next_announce_delay(100, &failed), Duration::from_secs(30));
        assert_eq!(manager.next_announce_delay(5, &ok), Duration::from_secs(60));
        assert_eq!(manager.next_announce_delay(20, &ok), Duration::from_secs(180));
        assert_eq!(manager.next_announce_delay(50, &ok), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_no_trackers() {
        let mut manager = TrackerManager::from_trackers(Vec::new(), &Config::default());
        let round = manager.announce(params(Some(Event::Started)), 10).await;
        assert_eq!(round, AnnounceRound::default());
    }
}
