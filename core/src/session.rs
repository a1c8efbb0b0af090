use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::checksum::ChecksumRequest;
use crate::chunk::ChunkPlan;
use crate::progress::{ProgressCounters, SpeedGauge};
use crate::signal::StopSignal;
use crate::strategy::NetworkClass;

const STATE_IDLE: u8 = 0;
const STATE_PROBING: u8 = 1;
const STATE_DOWNLOADING: u8 = 2;
const STATE_PAUSED: u8 = 3;
const STATE_COMPLETED: u8 = 4;
const STATE_CANCELLED: u8 = 5;
const STATE_FAILED: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Probing,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Idle => "idle",
            DownloadState::Probing => "probing",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Probing | DownloadState::Downloading)
    }

    fn as_u8(self) -> u8 {
        match self {
            DownloadState::Idle => STATE_IDLE,
            DownloadState::Probing => STATE_PROBING,
            DownloadState::Downloading => STATE_DOWNLOADING,
            DownloadState::Paused => STATE_PAUSED,
            DownloadState::Completed => STATE_COMPLETED,
            DownloadState::Cancelled => STATE_CANCELLED,
            DownloadState::Failed => STATE_FAILED,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            STATE_PROBING => DownloadState::Probing,
            STATE_DOWNLOADING => DownloadState::Downloading,
            STATE_PAUSED => DownloadState::Paused,
            STATE_COMPLETED => DownloadState::Completed,
            STATE_CANCELLED => DownloadState::Cancelled,
            STATE_FAILED => DownloadState::Failed,
            _ => DownloadState::Idle,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: DownloadState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn get(&self) -> DownloadState {
        DownloadState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: DownloadState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub destination_dir: PathBuf,
    pub file_name: Option<String>,
    pub checksum: Option<ChecksumRequest>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination_dir: destination_dir.into(),
            file_name: None,
            checksum: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumRequest) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionLayout {
    pub total_size: u64,
    pub file_name: String,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
    pub plan: ChunkPlan,
}

#[derive(Debug)]
pub struct Session {
    pub request: DownloadRequest,
    pub network_class: NetworkClass,
    pub layout: OnceLock<SessionLayout>,
    pub stop: StopSignal,
    pub speed: SpeedGauge,
    progress: Mutex<Option<Arc<ProgressCounters>>>,
    started: AtomicBool,
}

impl Session {
    pub fn new(request: DownloadRequest, network_class: NetworkClass) -> Self {
        Self {
            request,
            network_class,
            layout: OnceLock::new(),
            stop: StopSignal::new(),
            speed: SpeedGauge::default(),
            progress: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> Option<&SessionLayout> {
        self.layout.get()
    }

    pub fn set_counters(&self, counters: Arc<ProgressCounters>) {
        let mut slot = self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(counters);
    }

    pub fn counters(&self) -> Option<Arc<ProgressCounters>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn totals(&self) -> (u64, u64) {
        let total = self.layout().map(|layout| layout.total_size).unwrap_or(0);
        let downloaded = self
            .counters()
            .map(|counters| counters.downloaded())
            .unwrap_or(0);
        (downloaded, total)
    }

    pub fn chunk_progress(&self) -> Vec<u64> {
        self.counters()
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;

    #[test]
    fn test_state_cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), DownloadState::Idle);
        for state in [
            DownloadState::Probing,
            DownloadState::Downloading,
            DownloadState::Paused,
            DownloadState::Completed,
            DownloadState::Cancelled,
            DownloadState::Failed,
            DownloadState::Idle,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
        assert!(DownloadState::Probing.is_active());
        assert!(!DownloadState::Paused.is_active());
        assert_eq!(DownloadState::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_request_builder() {
        let req = DownloadRequest::new("http://host/a.bin", "/tmp/out")
            .with_file_name("b.bin")
            .with_checksum(ChecksumRequest::new(ChecksumType::Md5, "00"));
        assert_eq!(req.file_name.as_deref(), Some("b.bin"));
        assert_eq!(req.destination_dir, PathBuf::from("/tmp/out"));
        assert!(req.checksum.is_some());
    }

    #[test]
    fn test_session_totals_before_and_after_layout() {
        let session = Session::new(
            DownloadRequest::new("http://host/a.bin", "/tmp"),
            NetworkClass::Wifi,
        );
        assert_eq!(session.totals(), (0, 0));
        assert!(session.chunk_progress().is_empty());
        assert!(session.mark_started());
        assert!(!session.mark_started());

        let _ = session.layout.set(SessionLayout {
            total_size: 10,
            file_name: "a.bin".to_string(),
            temp_path: PathBuf::from("/tmp/a.bin.tmp"),
            final_path: PathBuf::from("/tmp/a.bin"),
            plan: ChunkPlan::build(10, 2, 5),
        });
        session.set_counters(Arc::new(ProgressCounters::new(&[3, 1])));
        assert_eq!(session.totals(), (4, 10));
        assert_eq!(session.chunk_progress(), vec![3, 1]);
    }
}
