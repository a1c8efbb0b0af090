use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunk::ChunkDescriptor;
use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{HttpRequest, NetClient};
use crate::progress::ProgressCounters;
use crate::resume::ResumeStore;
use crate::signal::{StopReason, StopSignal};
use crate::strategy;
use crate::throttle::Throttle;

pub struct WorkerContext<'a> {
    pub url: &'a str,
    pub temp_path: &'a Path,
    pub total_size: u64,
    pub config: &'a DownloadConfig,
    pub net: &'a dyn NetClient,
    pub store: &'a dyn ResumeStore,
    pub counters: &'a ProgressCounters,
    pub throttle: &'a Throttle,
    pub stop: &'a StopSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed,
    Stopped,
}

pub struct ChunkWorker<'a> {
    ctx: &'a WorkerContext<'a>,
    chunk: ChunkDescriptor,
    written: u64,
    checkpointed: u64,
    buffer_size: usize,
}

impl<'a> ChunkWorker<'a> {
    pub fn new(ctx: &'a WorkerContext<'a>, chunk: ChunkDescriptor, resume_from: u64) -> Self {
        let written = resume_from.min(chunk.len());
        Self {
            ctx,
            chunk,
            written,
            checkpointed: written,
            buffer_size: ctx.config.buffer_size,
        }
    }

    pub fn run(mut self) -> CoreResult<ChunkOutcome> {
        let len = self.chunk.len();
        if self.written >= len {
            debug!(chunk = self.chunk.index, "chunk already complete");
            return Ok(ChunkOutcome::Completed);
        }

        let mut failures = 0u32;
        loop {
            if self.ctx.stop.is_stopped() {
                return Ok(self.stopped());
            }

            let err = match self.fetch_once() {
                Ok(()) if self.written >= len => {
                    self.checkpoint();
                    debug!(chunk = self.chunk.index, bytes = len, "chunk complete");
                    return Ok(ChunkOutcome::Completed);
                }
                _ if self.ctx.stop.is_stopped() => return Ok(self.stopped()),
                Ok(()) => CoreError::Network(format!(
                    "body ended after {} of {} bytes",
                    self.written, len
                )),
                Err(err) => err,
            };

            if err.is_fatal() || matches!(err, CoreError::RangeNotSupported(_)) {
                self.checkpoint();
                return Err(err);
            }

            failures += 1;
            self.checkpoint();
            if failures > self.ctx.config.retry_count {
                return Err(CoreError::ChunkFailed {
                    index: self.chunk.index,
                    attempts: failures,
                    message: err.to_string(),
                });
            }
            warn!(
                chunk = self.chunk.index,
                attempt = failures,
                offset = self.chunk.start + self.written,
                error = %err,
                "chunk request failed, retrying"
            );
            if self.ctx.stop.wait(backoff(self.ctx.config.retry_delay(), failures)) {
                return Ok(self.stopped());
            }
        }
    }

    fn stopped(&mut self) -> ChunkOutcome {
        if self.ctx.stop.reason() != StopReason::Cancelled {
            self.checkpoint();
        }
        ChunkOutcome::Stopped
    }

    fn checkpoint(&mut self) {
        if self.written == self.checkpointed {
            return;
        }
        match self
            .ctx
            .store
            .save(self.ctx.temp_path, self.chunk.index, self.written)
        {
            Ok(()) => self.checkpointed = self.written,
            Err(err) => warn!(
                chunk = self.chunk.index,
                error = %err,
                "failed to persist resume point"
            ),
        }
    }

    fn fetch_once(&mut self) -> CoreResult<()> {
        let start = self.chunk.start + self.written;
        let req = HttpRequest::ranged(self.ctx.url, start, self.chunk.end);
        let mut resp = self.ctx.net.get(&req)?;

        let whole_file = start == 0 && self.chunk.end + 1 == self.ctx.total_size;
        match resp.status_code {
            206 => {}
            200 if whole_file => {}
            200 => return Err(CoreError::RangeNotSupported(200)),
            code => {
                return Err(CoreError::Network(format!(
                    "unexpected status {} for bytes={}-{}",
                    code, start, self.chunk.end
                )))
            }
        }

        let path = self.ctx.temp_path;
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| CoreError::io(path, err))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|err| CoreError::io(path, err))?;

        self.stream(&mut resp.body, &mut file)
    }

    fn stream(&mut self, body: &mut dyn Read, file: &mut impl Write) -> CoreResult<()> {
        let len = self.chunk.len();
        let retune_window = self.ctx.config.buffer_retune_window();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        while self.written < len {
            if self.ctx.stop.is_stopped() {
                return Ok(());
            }

            let want = (len - self.written).min(buffer.len() as u64) as usize;
            let read = match body.read(&mut buffer[..want]) {
                Ok(0) => return Ok(()),
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CoreError::Network(err.to_string())),
            };
            file.write_all(&buffer[..read])
                .map_err(|err| CoreError::io(self.ctx.temp_path, err))?;

            let read = read as u64;
            self.written += read;
            self.ctx.counters.add(self.chunk.index as usize, read);

            if self.written - self.checkpointed >= self.ctx.config.checkpoint_bytes {
                file.flush()
                    .map_err(|err| CoreError::io(self.ctx.temp_path, err))?;
                self.checkpoint();
            }

            window_bytes += read;
            let elapsed = window_start.elapsed();
            if elapsed >= retune_window {
                let rate = window_bytes as f64 / elapsed.as_secs_f64();
                let next = strategy::buffer_size(rate);
                if next != buffer.len() {
                    debug!(chunk = self.chunk.index, from = buffer.len(), to = next, "retuned read buffer");
                    buffer.resize(next, 0);
                    self.buffer_size = next;
                }
                window_start = Instant::now();
                window_bytes = 0;
            }

            let pause = self.ctx.throttle.reserve(read);
            if !pause.is_zero() && self.ctx.stop.wait(pause) {
                return Ok(());
            }
        }

        file.flush()
            .map_err(|err| CoreError::io(self.ctx.temp_path, err))
    }
}

fn backoff(base: Duration, failures: u32) -> Duration {
    base.checked_mul(failures).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::resume::MemoryResumeStore;
    use crate::tests::{pattern, FakeNet};
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        temp_path: std::path::PathBuf,
        config: DownloadConfig,
        store: MemoryResumeStore,
        counters: ProgressCounters,
        throttle: Throttle,
        stop: StopSignal,
    }

    impl Harness {
        fn new(total: u64, config: DownloadConfig) -> Self {
            let dir = TempDir::new().unwrap();
            let temp_path = dir.path().join("file.bin.tmp");
            fs::File::create(&temp_path).unwrap().set_len(total).unwrap();
            Self {
                _dir: dir,
                temp_path,
                config,
                store: MemoryResumeStore::default(),
                counters: ProgressCounters::new(&[0]),
                throttle: Throttle::new(None),
                stop: StopSignal::new(),
            }
        }

        fn context<'a>(&'a self, net: &'a FakeNet, total: u64) -> WorkerContext<'a> {
            WorkerContext {
                url: "http://fake/file.bin",
                temp_path: &self.temp_path,
                total_size: total,
                config: &self.config,
                net,
                store: &self.store,
                counters: &self.counters,
                throttle: &self.throttle,
                stop: &self.stop,
            }
        }
    }

    fn quick_config() -> DownloadConfig {
        DownloadConfig {
            retry_count: 2,
            retry_delay_ms: 1,
            checkpoint_bytes: 1024,
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn test_short_body_is_retried_from_offset() {
        let total = 10_000u64;
        let net = FakeNet::new(total).with_short_bodies(1);
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);

        let outcome = ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0)
            .run()
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Completed);

        let ranges = net.requested_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], Some((0, total - 1)));
        let (second_start, _) = ranges[1].unwrap();
        assert!(second_start > 0);
        assert_eq!(fs::read(&harness.temp_path).unwrap(), pattern(total));
        assert_eq!(harness.counters.downloaded(), total);
    }

    #[test]
    fn test_ignored_range_fails_without_retry() {
        let total = 10_000u64;
        let net = FakeNet::new(total).ignoring_ranges();
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);

        let err = ChunkWorker::new(&ctx, ChunkDescriptor::new(1, 5_000, total - 1), 0)
            .run()
            .unwrap_err();
        assert!(matches!(err, CoreError::RangeNotSupported(200)));
        assert_eq!(net.get_count(), 1);
    }

    #[test]
    fn test_full_body_accepted_for_single_chunk() {
        let total = 3_000u64;
        let net = FakeNet::new(total).ignoring_ranges();
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);

        let outcome = ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0)
            .run()
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Completed);
        assert_eq!(fs::read(&harness.temp_path).unwrap(), pattern(total));
    }

    #[test]
    fn test_retries_are_bounded() {
        let total = 4_000u64;
        let net = FakeNet::new(total).failing_gets();
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);

        let err = ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0)
            .run()
            .unwrap_err();
        match err {
            CoreError::ChunkFailed { index, attempts, .. } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(net.get_count(), 3);
    }

    #[test]
    fn test_resume_point_skips_written_prefix() {
        let total = 8_000u64;
        let net = FakeNet::new(total);
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);

        ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 3_000)
            .run()
            .unwrap();
        assert_eq!(net.requested_ranges(), vec![Some((3_000, total - 1))]);
        assert_eq!(
            harness.store.load_all(&harness.temp_path).unwrap().get(&0),
            Some(&total)
        );
    }

    #[test]
    fn test_completed_chunk_makes_no_request() {
        let total = 100u64;
        let net = FakeNet::new(total);
        let harness = Harness::new(total, quick_config());
        let ctx = harness.context(&net, total);
        let outcome = ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), total)
            .run()
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Completed);
        assert_eq!(net.get_count(), 0);
    }

    #[test]
    fn test_pause_checkpoints_and_cancel_does_not() {
        let total = 200_000u64;
        let net = FakeNet::new(total)
            .with_read_size(1024)
            .with_read_delay(Duration::from_millis(2));
        let config = DownloadConfig {
            checkpoint_bytes: u64::MAX,
            ..quick_config()
        };

        for (reason, expect_record) in [(StopReason::Paused, true), (StopReason::Cancelled, false)] {
            let harness = Harness::new(total, config.clone());
            let ctx = harness.context(&net, total);
            let outcome = std::thread::scope(|scope| {
                let handle = scope.spawn(|| {
                    ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0).run()
                });
                std::thread::sleep(Duration::from_millis(30));
                harness.stop.trigger(reason);
                handle.join().unwrap()
            });
            assert_eq!(outcome.unwrap(), ChunkOutcome::Stopped);
            let records = harness.store.load_all(&harness.temp_path).unwrap();
            assert_eq!(records.contains_key(&0), expect_record);
            if let Some(saved) = records.get(&0) {
                assert_eq!(*saved, harness.counters.downloaded());
                assert!(*saved < total);
            }
        }
    }

    #[test]
    fn test_read_buffer_grows_on_fast_link() {
        let total = 32 * MIB;
        let net = FakeNet::new(total).with_read_size(MIB as usize);
        let config = DownloadConfig {
            buffer_retune_ms: 1,
            checkpoint_bytes: MIB,
            ..quick_config()
        };
        let harness = Harness::new(total, config);
        let ctx = harness.context(&net, total);

        ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0)
            .run()
            .unwrap();
        let lens = net.read_lengths();
        assert_eq!(lens[0], strategy::MEDIUM_BUFFER);
        assert!(lens.contains(&strategy::LARGE_BUFFER));
        assert_eq!(fs::read(&harness.temp_path).unwrap(), pattern(total));
    }

    #[test]
    fn test_read_buffer_shrinks_on_slow_link() {
        let total = 64 * 1024u64;
        let net = FakeNet::new(total)
            .with_read_size(1024)
            .with_read_delay(Duration::from_millis(2));
        let config = DownloadConfig {
            buffer_retune_ms: 1,
            ..quick_config()
        };
        let harness = Harness::new(total, config);
        let ctx = harness.context(&net, total);

        ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0)
            .run()
            .unwrap();
        let lens = net.read_lengths();
        assert_eq!(lens[0], strategy::MEDIUM_BUFFER);
        assert_eq!(lens[1], strategy::SMALL_BUFFER);
        assert!(lens[1..].iter().all(|len| *len <= strategy::SMALL_BUFFER));
    }

    #[test]
    fn test_backoff_grows_linearly_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 1), Duration::from_millis(500));
        assert_eq!(backoff(base, 3), Duration::from_millis(1500));
        assert_eq!(backoff(Duration::from_millis(u64::MAX), 5_000), Duration::MAX);
    }

    #[test]
    fn test_huge_retry_delay_is_cut_short_by_stop() {
        let total = 4_000u64;
        let net = FakeNet::new(total).failing_gets();
        let config = DownloadConfig {
            retry_delay_ms: u64::MAX,
            ..quick_config()
        };
        let harness = Harness::new(total, config);
        let ctx = harness.context(&net, total);

        let outcome = std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                ChunkWorker::new(&ctx, ChunkDescriptor::new(0, 0, total - 1), 0).run()
            });
            std::thread::sleep(Duration::from_millis(30));
            harness.stop.trigger(StopReason::Paused);
            handle.join().unwrap()
        });
        assert_eq!(outcome.unwrap(), ChunkOutcome::Stopped);
        assert_eq!(net.get_count(), 1);
    }
}
