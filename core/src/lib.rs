pub mod checksum;
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod naming;
pub mod net;
pub mod progress;
pub mod resume;
pub mod session;
pub mod signal;
pub mod strategy;
pub mod throttle;
pub mod worker;


pub use crate::checksum::{ChecksumRequest, ChecksumType};
pub use crate::chunk::{ChunkDescriptor, ChunkPlan};
pub use crate::config::DownloadConfig;
pub use crate::engine::DownloadEngine;
pub use crate::error::{CoreError, CoreResult};
pub use crate::listener::{DownloadEvent, DownloadListener, NoopListener};
pub use crate::session::{DownloadRequest, DownloadState};
pub use crate::strategy::NetworkClass;
