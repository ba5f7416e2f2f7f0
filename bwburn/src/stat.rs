use core::{
    fmt::{self, Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{sync::Arc, time::Instant};

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Shared traffic accumulator, fed by every worker on each body chunk.
///
/// A single atomic counter, no locks: increments are plain atomic additions
/// and reads are point-in-time snapshots that can never observe a torn or
/// decreasing value.
#[derive(Debug, Default)]
pub struct TrafficStat {
    bytes_rx: AtomicU64,
}

impl TrafficStat {
    /// Increases the number of bytes received by the given value.
    #[inline]
    pub fn on_recv(&self, n: u64) {
        self.bytes_rx.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the total number of bytes received so far.
    #[inline]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }
}

/// Periodic throughput sampling over a [`TrafficStat`].
///
/// Owned by the reporter alone. Keeps the bookkeeping required to turn two
/// consecutive counter reads into an instantaneous rate; the counter itself
/// stays untouched.
#[derive(Debug)]
pub struct ThroughputSampler {
    stat: Arc<TrafficStat>,
    started_at: Instant,
    last_bytes: u64,
    last_at: Instant,
}

impl ThroughputSampler {
    pub fn new(stat: Arc<TrafficStat>) -> Self {
        let now = Instant::now();
        let last_bytes = stat.bytes_rx();

        Self {
            stat,
            started_at: now,
            last_bytes,
            last_at: now,
        }
    }

    /// Takes a snapshot of the counter and advances the sampling window.
    pub fn sample(&mut self) -> Sample {
        let now = Instant::now();
        let total = self.stat.bytes_rx();

        let m = Sample {
            total,
            delta: total - self.last_bytes,
            elapsed: now - self.last_at,
            since_start: now - self.started_at,
        };

        self.last_bytes = total;
        self.last_at = now;

        m
    }
}

/// One point-in-time throughput reading.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Cumulative bytes received since the run started.
    pub total: u64,
    /// Bytes received since the previous sample.
    pub delta: u64,
    /// Time since the previous sample.
    pub elapsed: Duration,
    /// Time since the run started.
    pub since_start: Duration,
}

impl Sample {
    /// Instantaneous throughput in MB/s over the last sampling window.
    pub fn speed(&self) -> f64 {
        rate(self.delta, self.elapsed)
    }

    /// Average throughput in MB/s since the run started.
    pub fn avg_speed(&self) -> f64 {
        rate(self.total, self.since_start)
    }

    /// Cumulative volume in GiB.
    pub fn total_gib(&self) -> f64 {
        self.total as f64 / GIB
    }
}

impl Display for Sample {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            fmt,
            "speed: {:.3} MB/s | total: {:.3} GiB | avg: {:.3} MB/s",
            self.speed(),
            self.total_gib(),
            self.avg_speed()
        )
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / MIB / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn test_concurrent_adds_are_lossless() {
        let stat = Arc::new(TrafficStat::default());

        let mut threads = Vec::new();
        for _ in 0..8 {
            let stat = stat.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..100_000 {
                    stat.on_recv(7);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(stat.bytes_rx(), 8 * 100_000 * 7);
    }

    #[test]
    fn test_sampler_tracks_deltas() {
        let stat = Arc::new(TrafficStat::default());
        let mut sampler = ThroughputSampler::new(stat.clone());

        stat.on_recv(1024);
        let sample = sampler.sample();
        assert_eq!(sample.total, 1024);
        assert_eq!(sample.delta, 1024);

        stat.on_recv(512);
        let sample = sampler.sample();
        assert_eq!(sample.total, 1536);
        assert_eq!(sample.delta, 512);
    }

    #[test]
    fn test_sample_rates() {
        let sample = Sample {
            total: 200 * 1024 * 1024,
            delta: 100 * 1024 * 1024,
            elapsed: Duration::from_secs(10),
            since_start: Duration::from_secs(40),
        };

        assert!((sample.speed() - 10.0).abs() < 1e-9);
        assert!((sample.avg_speed() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_zero_elapsed() {
        let sample = Sample {
            total: 1024,
            delta: 1024,
            elapsed: Duration::ZERO,
            since_start: Duration::ZERO,
        };

        assert_eq!(sample.speed(), 0.0);
        assert_eq!(sample.avg_speed(), 0.0);
    }
}
