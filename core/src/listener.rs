use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

/// Receives every observable outcome of a download.
///
/// Callbacks arrive on engine threads: the supervisor, the progress ticker, or
/// the thread that called a control operation. Implementations must not call
/// `pause`, `resume`, `cancel` or `wait` on the engine from inside a callback.
pub trait DownloadListener: Send + Sync {
    fn on_start(&self, total_size: u64, file_name: &str);
    fn on_progress(&self, downloaded: u64, total: u64, speed_bytes_per_sec: f64, percent: f64);
    fn on_complete(&self, path: &Path);
    fn on_error(&self, message: &str);
    fn on_pause(&self, downloaded: u64, total: u64);
    fn on_resume(&self, downloaded: u64, total: u64);

    /// Explicit cancellation. Listeners that do not override this receive it
    /// as an error message instead.
    fn on_cancel(&self) {
        self.on_error("download cancelled");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        total_size: u64,
        file_name: String,
    },
    Progress {
        downloaded: u64,
        total: u64,
        speed_bytes_per_sec: f64,
        percent: f64,
    },
    Completed {
        path: PathBuf,
    },
    Error {
        message: String,
    },
    Paused {
        downloaded: u64,
        total: u64,
    },
    Resumed {
        downloaded: u64,
        total: u64,
    },
    Cancelled,
}

impl DownloadListener for Sender<DownloadEvent> {
    fn on_start(&self, total_size: u64, file_name: &str) {
        let _ = self.send(DownloadEvent::Started {
            total_size,
            file_name: file_name.to_string(),
        });
    }

    fn on_progress(&self, downloaded: u64, total: u64, speed_bytes_per_sec: f64, percent: f64) {
        let _ = self.send(DownloadEvent::Progress {
            downloaded,
            total,
            speed_bytes_per_sec,
            percent,
        });
    }

    fn on_complete(&self, path: &Path) {
        let _ = self.send(DownloadEvent::Completed {
            path: path.to_path_buf(),
        });
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(DownloadEvent::Error {
            message: message.to_string(),
        });
    }

    fn on_pause(&self, downloaded: u64, total: u64) {
        let _ = self.send(DownloadEvent::Paused { downloaded, total });
    }

    fn on_resume(&self, downloaded: u64, total: u64) {
        let _ = self.send(DownloadEvent::Resumed { downloaded, total });
    }

    fn on_cancel(&self) {
        let _ = self.send(DownloadEvent::Cancelled);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DownloadListener for NoopListener {
    fn on_start(&self, _total_size: u64, _file_name: &str) {}
    fn on_progress(&self, _downloaded: u64, _total: u64, _speed: f64, _percent: f64) {}
    fn on_complete(&self, _path: &Path) {}
    fn on_error(&self, _message: &str) {}
    fn on_pause(&self, _downloaded: u64, _total: u64) {}
    fn on_resume(&self, _downloaded: u64, _total: u64) {}
}
