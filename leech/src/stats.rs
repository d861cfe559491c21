use std::time::Duration;

// Longest ETA reported, anything beyond is clamped.
pub const MAX_ETA: Duration = Duration::from_secs(24 * 60 * 60);

// Snapshot of overall download progress.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DownloadStats {

    // 0.0 - 100.0
    pub percentage: f64,

    pub active_peers: usize,

    // Bytes per second over the last sample window.
    pub download_speed: f64,

    // None while no data is arriving.
    pub eta: Option<Duration>,

    pub completed_pieces: usize,

    pub total_pieces: usize,

    // Bytes of verified pieces.
    pub bytes_completed: u64,

    pub total_len: u64,

}

impl DownloadStats {

    pub fn is_complete(&self) -> bool {
        self.total_pieces > 0 && self.completed_pieces == self.total_pieces
    }
}

pub fn estimate_eta(remaining: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    let secs = remaining as f64 / speed;
    Some(Duration::from_secs_f64(secs.min(MAX_ETA.as_secs_f64())))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.up.add(other.up.round);
        self.down.add(other.down.round);
    }
}

// Rounds folded into the moving average.
const SMOOTHING_ROUNDS: f64 = 5.0;

// Byte counter with an exponential moving average over rounds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    // Bytes since the last `reset`.
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Closes the current round.
    pub fn reset(&mut self) {
        let round = std::mem::take(&mut self.round) as f64;
        self.avg += (round - self.avg) / SMOOTHING_ROUNDS;
        self.peak = self.peak.max(self.avg);
    }

    pub fn avg(&self) -> u64 { self.avg as u64 }

    pub fn peak(&self) -> u64 { self.peak as u64 }

    pub fn total(&self) -> u64 { self.total }

    pub fn round(&self) -> u64 { self.round }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_capped() {
        assert_eq!(estimate_eta(1000, 0.0), None);
        assert_eq!(estimate_eta(1000, 100.0), Some(Duration::from_secs(10)));
        assert_eq!(estimate_eta(u64::MAX, 1.0), Some(MAX_ETA));
    }

    #[test]
    fn test_counter_average() {
        let mut counter = Counter::default();
        counter += 500;
        counter.reset();
        assert_eq!(counter.avg(), 100);
        assert_eq!(counter.total(), 500);
        assert_eq!(counter.round(), 0);
        counter.reset();
        assert_eq!(counter.avg(), 80);
        assert_eq!(counter.peak(), 100);
    }

    #[test]
    fn test_throughput_sum() {
        let mut a = ThroughputStats::default();
        let mut b = ThroughputStats::default();
        b.down += 300;
        a += &b;
        assert_eq!(a.down.total(), 300);
    }
}
