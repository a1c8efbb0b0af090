use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::chunk::PlanFingerprint;
use crate::error::{CoreError, CoreResult};

/// Per-chunk resume points, keyed by the temp file they describe.
///
/// Records for different chunks are independent: a missing or unreadable
/// record costs only that chunk its progress.
pub trait ResumeStore: Send + Sync {
    fn load_all(&self, temp_file: &Path) -> CoreResult<HashMap<u32, u64>>;
    fn save(&self, temp_file: &Path, chunk_index: u32, bytes_written: u64) -> CoreResult<()>;
    fn clear(&self, temp_file: &Path) -> CoreResult<()>;

    fn load_plan(&self, temp_file: &Path) -> CoreResult<Option<PlanFingerprint>>;
    fn save_plan(&self, temp_file: &Path, plan: &PlanFingerprint) -> CoreResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarResumeStore;

const CHUNK_MARKER: &str = ".chunk";
const PLAN_SUFFIX: &str = ".plan";
const STAGING_SUFFIX: &str = ".part";

impl SidecarResumeStore {
    pub fn new() -> Self {
        Self
    }

    pub fn record_path(temp_file: &Path, chunk_index: u32) -> PathBuf {
        sibling(temp_file, &format!("{}{}", CHUNK_MARKER, chunk_index))
    }

    pub fn plan_path(temp_file: &Path) -> PathBuf {
        sibling(temp_file, PLAN_SUFFIX)
    }

    fn record_prefix(temp_file: &Path) -> Option<String> {
        let name = temp_file.file_name()?.to_string_lossy();
        Some(format!("{}{}", name, CHUNK_MARKER))
    }

    // Write-then-rename so a crash mid-write never leaves a torn record.
    fn write_atomic(path: &Path, contents: &str) -> CoreResult<()> {
        let staging = sibling(path, STAGING_SUFFIX);
        fs::write(&staging, contents).map_err(|err| CoreError::io(&staging, err))?;
        fs::rename(&staging, path).map_err(|err| CoreError::io(path, err))
    }

    fn remove_if_present(path: &Path) -> CoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::io(path, err)),
        }
    }

    fn sidecar_entries(temp_file: &Path) -> CoreResult<Vec<(String, PathBuf)>> {
        let Some(prefix) = Self::record_prefix(temp_file) else {
            return Ok(Vec::new());
        };
        let dir = match temp_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::io(&dir, err)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CoreError::io(&dir, err))?;
            let name = entry.file_name().to_string_lossy().to_string();
            match name.strip_prefix(&prefix) {
                Some(rest) if is_record_suffix(rest) => out.push((rest.to_string(), entry.path())),
                _ => {}
            }
        }
        Ok(out)
    }
}

impl ResumeStore for SidecarResumeStore {
    fn load_all(&self, temp_file: &Path) -> CoreResult<HashMap<u32, u64>> {
        let mut records = HashMap::new();
        for (suffix, path) in Self::sidecar_entries(temp_file)? {
            // Staging leftovers end in `.part` and fail the index parse.
            let Ok(index) = suffix.parse::<u32>() else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(raw) => match raw.trim().parse::<u64>() {
                    Ok(bytes) => {
                        records.insert(index, bytes);
                    }
                    Err(_) => warn!(path = %path.display(), "ignoring unparsable resume record"),
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable resume record")
                }
            }
        }
        Ok(records)
    }

    fn save(&self, temp_file: &Path, chunk_index: u32, bytes_written: u64) -> CoreResult<()> {
        Self::write_atomic(
            &Self::record_path(temp_file, chunk_index),
            &bytes_written.to_string(),
        )
    }

    fn clear(&self, temp_file: &Path) -> CoreResult<()> {
        for (_, path) in Self::sidecar_entries(temp_file)? {
            Self::remove_if_present(&path)?;
        }
        let plan = Self::plan_path(temp_file);
        Self::remove_if_present(&plan)?;
        Self::remove_if_present(&sibling(&plan, STAGING_SUFFIX))
    }

    fn load_plan(&self, temp_file: &Path) -> CoreResult<Option<PlanFingerprint>> {
        let path = Self::plan_path(temp_file);
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let parsed = PlanFingerprint::parse(&raw);
                if parsed.is_none() {
                    warn!(path = %path.display(), "ignoring corrupt plan fingerprint");
                }
                Ok(parsed)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CoreError::io(&path, err)),
        }
    }

    fn save_plan(&self, temp_file: &Path, plan: &PlanFingerprint) -> CoreResult<()> {
        Self::write_atomic(&Self::plan_path(temp_file), &plan.to_string())
    }
}

// `<N>` for a record, `<N>.part` for one still being written.
fn is_record_suffix(rest: &str) -> bool {
    let index = rest.strip_suffix(STAGING_SUFFIX).unwrap_or(rest);
    !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) && index.parse::<u32>().is_ok()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Default)]
struct MemoryEntry {
    records: HashMap<u32, u64>,
    plan: Option<PlanFingerprint>,
}

#[derive(Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<PathBuf, MemoryEntry>>,
}

impl MemoryResumeStore {
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<PathBuf, MemoryEntry>) -> T) -> CoreResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::Storage("resume store lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load_all(&self, temp_file: &Path) -> CoreResult<HashMap<u32, u64>> {
        self.with_entries(|entries| {
            entries
                .get(temp_file)
                .map(|entry| entry.records.clone())
                .unwrap_or_default()
        })
    }

    fn save(&self, temp_file: &Path, chunk_index: u32, bytes_written: u64) -> CoreResult<()> {
        self.with_entries(|entries| {
            entries
                .entry(temp_file.to_path_buf())
                .or_default()
                .records
                .insert(chunk_index, bytes_written);
        })
    }

    fn clear(&self, temp_file: &Path) -> CoreResult<()> {
        self.with_entries(|entries| {
            entries.remove(temp_file);
        })
    }

    fn load_plan(&self, temp_file: &Path) -> CoreResult<Option<PlanFingerprint>> {
        self.with_entries(|entries| entries.get(temp_file).and_then(|entry| entry.plan))
    }

    fn save_plan(&self, temp_file: &Path, plan: &PlanFingerprint) -> CoreResult<()> {
        self.with_entries(|entries| {
            entries.entry(temp_file.to_path_buf()).or_default().plan = Some(*plan);
        })
    }
}
