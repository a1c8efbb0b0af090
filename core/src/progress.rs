use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::listener::DownloadListener;
use crate::session::{DownloadState, StateCell};
use crate::signal::StopSignal;

#[derive(Debug)]
pub struct ProgressCounters {
    downloaded: AtomicU64,
    per_chunk: Vec<AtomicU64>,
}

impl ProgressCounters {
    pub fn new(resume_points: &[u64]) -> Self {
        Self {
            downloaded: AtomicU64::new(resume_points.iter().sum()),
            per_chunk: resume_points.iter().map(|v| AtomicU64::new(*v)).collect(),
        }
    }

    pub fn add(&self, chunk: usize, bytes: u64) {
        if let Some(slot) = self.per_chunk.get(chunk) {
            slot.fetch_add(bytes, Ordering::Relaxed);
        }
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn chunk(&self, chunk: usize) -> u64 {
        self.per_chunk
            .get(chunk)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.per_chunk
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SpeedGauge(AtomicU64);

impl SpeedGauge {
    pub fn set(&self, bytes_per_sec: f64) {
        self.0.store(bytes_per_sec.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

pub fn percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        downloaded as f64 / total as f64 * 100.0
    }
}

pub fn speed(delta_bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        delta_bytes as f64 / elapsed_secs
    } else {
        0.0
    }
}

pub struct ProgressAggregator<'a> {
    pub counters: &'a ProgressCounters,
    pub total: u64,
    pub listener: &'a dyn DownloadListener,
    pub gauge: &'a SpeedGauge,
    pub interval: std::time::Duration,
}

impl ProgressAggregator<'_> {
    pub fn run(&self, stop: &StopSignal, state: &StateCell) {
        let mut last_bytes = self.counters.downloaded();
        let mut last_time = Instant::now();
        while !stop.wait(self.interval) {
            if state.get() != DownloadState::Downloading {
                break;
            }
            let now = Instant::now();
            let current = self.counters.downloaded();
            let rate = speed(
                current.saturating_sub(last_bytes),
                now.duration_since(last_time).as_secs_f64(),
            );
            self.gauge.set(rate);
            self.listener
                .on_progress(current, self.total, rate, percent(current, self.total));
            last_bytes = current;
            last_time = now;
        }
        self.gauge.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::DownloadEvent;
    use crate::signal::StopReason;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_percent_and_speed() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(speed(1000, 0.5), 2000.0);
        assert_eq!(speed(1000, 0.0), 0.0);
    }

    #[test]
    fn test_counters_track_total_and_slots() {
        let counters = ProgressCounters::new(&[10, 0, 5]);
        assert_eq!(counters.downloaded(), 15);
        counters.add(1, 7);
        counters.add(2, 1);
        assert_eq!(counters.downloaded(), 23);
        assert_eq!(counters.snapshot(), vec![10, 7, 6]);
        assert_eq!(counters.chunk(1), 7);
        assert_eq!(counters.chunk(9), 0);
    }

    #[test]
    fn test_counters_under_concurrent_writers() {
        let counters = ProgressCounters::new(&[0; 8]);
        thread::scope(|scope| {
            for chunk in 0..8 {
                let counters = &counters;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        counters.add(chunk, 3);
                    }
                });
            }
        });
        assert_eq!(counters.downloaded(), 8 * 1000 * 3);
        assert_eq!(counters.snapshot().iter().sum::<u64>(), counters.downloaded());
    }

    #[test]
    fn test_aggregator_reports_until_stopped() {
        let counters = ProgressCounters::new(&[0, 0]);
        let gauge = SpeedGauge::default();
        let (tx, rx) = channel();
        let state = StateCell::new(DownloadState::Downloading);
        let stop = StopSignal::new();
        let aggregator = ProgressAggregator {
            counters: &counters,
            total: 100,
            listener: &tx,
            gauge: &gauge,
            interval: Duration::from_millis(5),
        };

        thread::scope(|scope| {
            scope.spawn(|| aggregator.run(&stop, &state));
            counters.add(0, 40);
            thread::sleep(Duration::from_millis(40));
            counters.add(1, 10);
            thread::sleep(Duration::from_millis(40));
            stop.trigger(StopReason::Finished);
        });
        drop(tx);

        let mut last = 0;
        let mut seen = 0;
        for event in rx.iter() {
            if let DownloadEvent::Progress {
                downloaded, total, ..
            } = event
            {
                assert!(downloaded >= last);
                assert_eq!(total, 100);
                last = downloaded;
                seen += 1;
            }
        }
        assert!(seen > 0);
        assert_eq!(last, 50);
        assert_eq!(gauge.get(), 0.0);
    }

    #[test]
    fn test_aggregator_exits_when_state_changes() {
        let counters = ProgressCounters::new(&[0]);
        let gauge = SpeedGauge::default();
        let state = StateCell::new(DownloadState::Paused);
        let stop = StopSignal::new();
        let (tx, rx) = channel();
        ProgressAggregator {
            counters: &counters,
            total: 10,
            listener: &tx,
            gauge: &gauge,
            interval: Duration::from_millis(1),
        }
        .run(&stop, &state);
        drop(tx);
        assert_eq!(rx.iter().count(), 0);
    }
}
