use std::fmt;

use crate::config::DownloadConfig;
use crate::strategy::{self, NetworkClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self { index, start, end }
    }

    pub fn len(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    pub fn build(total_size: u64, worker_count: u32, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        if total_size == 0 {
            return Self {
                total_size,
                chunk_size,
                chunks: Vec::new(),
            };
        }

        let count = strategy::effective_worker_count(total_size, worker_count, chunk_size);
        let mut chunks = Vec::with_capacity(count as usize);
        for index in 0..count {
            let start = u64::from(index) * chunk_size;
            let end = if index == count - 1 {
                total_size - 1
            } else {
                start + chunk_size - 1
            };
            chunks.push(ChunkDescriptor::new(index, start, end));
        }

        Self {
            total_size,
            chunk_size,
            chunks,
        }
    }

    pub fn for_download(total_size: u64, network: NetworkClass, config: &DownloadConfig) -> Self {
        let workers = strategy::worker_count(total_size, network).min(config.max_workers);
        let chunk_size = strategy::chunk_size(
            total_size,
            workers,
            config.min_chunk_size,
            config.max_chunk_size,
        );
        Self::build(total_size, workers, chunk_size)
    }

    pub fn from_fingerprint(fingerprint: &PlanFingerprint) -> Option<Self> {
        if fingerprint.total_size == 0 || fingerprint.chunk_size == 0 || fingerprint.chunk_count == 0
        {
            return None;
        }
        let plan = Self::build(
            fingerprint.total_size,
            fingerprint.chunk_count,
            fingerprint.chunk_size,
        );
        if plan.len() as u32 != fingerprint.chunk_count {
            return None;
        }
        Some(plan)
    }

    pub fn fingerprint(&self) -> PlanFingerprint {
        PlanFingerprint {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            chunk_count: self.chunks.len() as u32,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// Enough to rebuild a `ChunkPlan` deterministically. Persisted next to the
// chunk records because those are keyed by chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanFingerprint {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

impl PlanFingerprint {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let total_size = parts.next()?.parse().ok()?;
        let chunk_size = parts.next()?.parse().ok()?;
        let chunk_count = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            total_size,
            chunk_size,
            chunk_count,
        })
    }
}

impl fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.total_size, self.chunk_size, self.chunk_count)
    }
}
