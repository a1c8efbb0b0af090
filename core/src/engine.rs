use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::checksum::verify_checksum;
use crate::chunk::ChunkPlan;
use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::listener::DownloadListener;
use crate::naming;
use crate::net::{HttpRequest, NetClient, ReqwestNetClient};
use crate::progress::{self, ProgressAggregator, ProgressCounters};
use crate::resume::{ResumeStore, SidecarResumeStore};
use crate::session::{DownloadRequest, DownloadState, Session, SessionLayout, StateCell};
use crate::signal::{Latch, StopReason};
use crate::strategy::NetworkClass;
use crate::throttle::Throttle;
use crate::worker::{ChunkOutcome, ChunkWorker, WorkerContext};

/// Drives one logical download at a time through probing, parallel chunk
/// transfer, pause/resume and completion.
///
/// Control operations may be called from any thread. Each one finishes its
/// transition before returning: `pause` and `cancel` join every worker of the
/// running attempt first.
pub struct DownloadEngine {
    config: Arc<DownloadConfig>,
    net: Arc<dyn NetClient>,
    store: Arc<dyn ResumeStore>,
    listener: Arc<dyn DownloadListener>,
    network_class: Mutex<NetworkClass>,
    state: Arc<StateCell>,
    control: Mutex<Option<AttemptHandle>>,
    session: RwLock<Option<Arc<Session>>>,
}

struct AttemptHandle {
    thread: JoinHandle<()>,
    finished: Arc<Latch>,
}

impl DownloadEngine {
    pub fn new(config: DownloadConfig, listener: Arc<dyn DownloadListener>) -> CoreResult<Self> {
        config.validate()?;
        let net = ReqwestNetClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            net: Arc::new(net),
            store: Arc::new(SidecarResumeStore::new()),
            listener,
            network_class: Mutex::new(NetworkClass::default()),
            state: Arc::new(StateCell::new(DownloadState::Idle)),
            control: Mutex::new(None),
            session: RwLock::new(None),
        })
    }

    pub fn with_net_client(mut self, net: Box<dyn NetClient>) -> Self {
        self.net = Arc::from(net);
        self
    }

    pub fn with_resume_store(mut self, store: Box<dyn ResumeStore>) -> Self {
        self.store = Arc::from(store);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn set_network_class(&self, network_class: NetworkClass) {
        *self
            .network_class
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = network_class;
    }

    pub fn network_class(&self) -> NetworkClass {
        *self
            .network_class
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self, request: DownloadRequest) -> CoreResult<()> {
        let mut control = self.lock_control()?;
        if self.state.get().is_active() {
            return self.reject(CoreError::AlreadyRunning);
        }
        Self::join_attempt(&mut control);

        let session = Arc::new(Session::new(request, self.network_class()));
        info!(
            url = %session.request.url,
            network = %session.network_class,
            "starting download"
        );
        self.set_session(Some(Arc::clone(&session)));
        self.launch(&mut control, session)
    }

    pub fn pause(&self) -> CoreResult<()> {
        let mut control = self.lock_control()?;
        let state = self.state.get();
        let session = match self.current_session() {
            Some(session) if state.is_active() => session,
            _ => {
                return self.reject(CoreError::InvalidState(format!(
                    "cannot pause while {}",
                    state
                )))
            }
        };

        session.stop.trigger(StopReason::Paused);
        Self::join_attempt(&mut control);

        match self.state.get() {
            DownloadState::Paused => {
                let (downloaded, total) = session.totals();
                info!(downloaded, total, "download paused");
                self.listener.on_pause(downloaded, total);
                Ok(())
            }
            other => self.reject(CoreError::InvalidState(format!(
                "download already {}",
                other
            ))),
        }
    }

    pub fn resume(&self) -> CoreResult<()> {
        let mut control = self.lock_control()?;
        let state = self.state.get();
        let session = match self.current_session() {
            Some(session) if state == DownloadState::Paused => session,
            _ => {
                return self.reject(CoreError::InvalidState(format!(
                    "nothing to resume while {}",
                    state
                )))
            }
        };
        Self::join_attempt(&mut control);

        session.stop.reset();
        let (downloaded, total) = session.totals();
        info!(downloaded, total, "resuming download");
        self.listener.on_resume(downloaded, total);
        self.launch(&mut control, session)
    }

    pub fn cancel(&self) -> CoreResult<()> {
        let mut control = self.lock_control()?;
        let state = self.state.get();
        match (state, self.current_session()) {
            (state, Some(session)) if state.is_active() => {
                session.stop.trigger(StopReason::Cancelled);
                Self::join_attempt(&mut control);
                let after = self.state.get();
                if after != DownloadState::Cancelled {
                    return self.reject(CoreError::InvalidState(format!(
                        "download already {}",
                        after
                    )));
                }
            }
            (DownloadState::Paused, Some(session)) => {
                if let Some(layout) = session.layout() {
                    discard_artifacts(self.store.as_ref(), layout);
                }
            }
            (state, _) => {
                return self.reject(CoreError::InvalidState(format!(
                    "cannot cancel while {}",
                    state
                )))
            }
        }

        self.set_session(None);
        self.state.set(DownloadState::Cancelled);
        info!("download cancelled");
        self.listener.on_cancel();
        Ok(())
    }

    pub fn wait(&self) -> DownloadState {
        let latch = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|handle| Arc::clone(&handle.finished));
        if let Some(latch) = latch {
            latch.wait();
        }

        let mut control = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if control
            .as_ref()
            .map(|handle| handle.finished.is_open())
            .unwrap_or(false)
        {
            Self::join_attempt(&mut control);
        }
        self.state.get()
    }

    pub fn state(&self) -> DownloadState {
        self.state.get()
    }

    pub fn is_downloading(&self) -> bool {
        self.state.get() == DownloadState::Downloading
    }

    pub fn is_paused(&self) -> bool {
        self.state.get() == DownloadState::Paused
    }

    pub fn has_resumable_download(&self) -> bool {
        self.is_paused() && self.current_session().is_some()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.totals().0
    }

    pub fn total_bytes(&self) -> u64 {
        self.totals().1
    }

    pub fn progress_percent(&self) -> f64 {
        let (downloaded, total) = self.totals();
        progress::percent(downloaded, total)
    }

    pub fn current_speed(&self) -> f64 {
        if !self.is_downloading() {
            return 0.0;
        }
        self.current_session()
            .map(|session| session.speed.get())
            .unwrap_or(0.0)
    }

    pub fn chunk_progress(&self) -> Vec<u64> {
        self.current_session()
            .map(|session| session.chunk_progress())
            .unwrap_or_default()
    }

    fn totals(&self) -> (u64, u64) {
        self.current_session()
            .map(|session| session.totals())
            .unwrap_or((0, 0))
    }

    fn launch(
        &self,
        control: &mut Option<AttemptHandle>,
        session: Arc<Session>,
    ) -> CoreResult<()> {
        self.state.set(DownloadState::Probing);
        let finished = Arc::new(Latch::new());
        let attempt = Attempt {
            config: Arc::clone(&self.config),
            net: Arc::clone(&self.net),
            store: Arc::clone(&self.store),
            listener: Arc::clone(&self.listener),
            state: Arc::clone(&self.state),
            session,
            finished: Arc::clone(&finished),
        };

        let spawned = thread::Builder::new()
            .name("rangefetch-supervisor".to_string())
            .spawn(move || attempt.run());
        match spawned {
            Ok(thread) => {
                *control = Some(AttemptHandle { thread, finished });
                Ok(())
            }
            Err(err) => {
                let err = CoreError::Io(format!("failed to spawn download thread: {}", err));
                self.state.set(DownloadState::Failed);
                error!(error = %err, "download failed");
                self.listener.on_error(&err.to_string());
                Err(err)
            }
        }
    }

    fn reject(&self, err: CoreError) -> CoreResult<()> {
        warn!(error = %err, "control operation rejected");
        self.listener.on_error(&err.to_string());
        Err(err)
    }

    fn lock_control(&self) -> CoreResult<MutexGuard<'_, Option<AttemptHandle>>> {
        self.control
            .lock()
            .map_err(|_| CoreError::InvalidState("engine control lock poisoned".to_string()))
    }

    fn join_attempt(control: &mut Option<AttemptHandle>) {
        if let Some(handle) = control.take() {
            let _ = handle.thread.join();
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_session(&self, session: Option<Arc<Session>>) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        if let Some(session) = self
            .session
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            session.stop.trigger(StopReason::Paused);
        }
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::join_attempt(control);
    }
}

enum AttemptOutcome {
    Completed(PathBuf),
    Stopped,
}

struct Attempt {
    config: Arc<DownloadConfig>,
    net: Arc<dyn NetClient>,
    store: Arc<dyn ResumeStore>,
    listener: Arc<dyn DownloadListener>,
    state: Arc<StateCell>,
    session: Arc<Session>,
    finished: Arc<Latch>,
}

// Opens the latch however the supervisor exits, panics included.
struct FinishGuard {
    state: Arc<StateCell>,
    finished: Arc<Latch>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.state.get().is_active() {
            if thread::panicking() {
                error!("download thread panicked");
            }
            self.state.set(DownloadState::Failed);
        }
        self.finished.open();
    }
}

impl Attempt {
    fn run(self) {
        let _guard = FinishGuard {
            state: Arc::clone(&self.state),
            finished: Arc::clone(&self.finished),
        };

        let result = self.execute();
        let err = match (result, self.session.stop.reason()) {
            (Ok(AttemptOutcome::Completed(path)), _) => {
                self.state.set(DownloadState::Completed);
                info!(path = %path.display(), "download complete");
                self.listener.on_complete(&path);
                return;
            }
            (_, StopReason::Paused) => {
                self.state.set(DownloadState::Paused);
                return;
            }
            (_, StopReason::Cancelled) => {
                if let Some(layout) = self.session.layout() {
                    discard_artifacts(self.store.as_ref(), layout);
                }
                self.state.set(DownloadState::Cancelled);
                return;
            }
            (Err(err), _) => err,
            (Ok(AttemptOutcome::Stopped), _) => {
                CoreError::InvalidState("download stopped without a reason".to_string())
            }
        };

        if let Some(layout) = self.session.layout() {
            discard_artifacts(self.store.as_ref(), layout);
        }
        self.state.set(DownloadState::Failed);
        error!(error = %err, "download failed");
        self.listener.on_error(&err.to_string());
    }

    fn execute(&self) -> CoreResult<AttemptOutcome> {
        let layout = match self.session.layout() {
            Some(layout) => layout.clone(),
            None => {
                let layout = self.prepare()?;
                let _ = self.session.layout.set(layout.clone());
                layout
            }
        };
        if self.session.stop.is_stopped() {
            return Ok(AttemptOutcome::Stopped);
        }

        self.allocate(&layout)?;
        let resume_points = self.resume_points(&layout);
        let counters = Arc::new(ProgressCounters::new(&resume_points));
        self.session.set_counters(Arc::clone(&counters));

        self.state.set(DownloadState::Downloading);
        if self.session.mark_started() {
            info!(
                file = %layout.file_name,
                total = layout.total_size,
                chunks = layout.plan.len(),
                "download started"
            );
            self.listener.on_start(layout.total_size, &layout.file_name);
        }

        let results = self.run_workers(&layout, &resume_points, &counters);
        if matches!(
            self.session.stop.reason(),
            StopReason::Paused | StopReason::Cancelled
        ) {
            return Ok(AttemptOutcome::Stopped);
        }
        let mut all_completed = true;
        for result in results {
            all_completed &= result? == ChunkOutcome::Completed;
        }
        if !all_completed {
            return Err(CoreError::InvalidState(
                "chunk stopped before completion".to_string(),
            ));
        }

        self.finalize(&layout).map(AttemptOutcome::Completed)
    }

    fn prepare(&self) -> CoreResult<SessionLayout> {
        let request = &self.session.request;
        let (total_size, disposition) = self.probe()?;
        let file_name = naming::resolve_file_name(
            request.file_name.as_deref(),
            &request.url,
            disposition.as_deref(),
        );

        fs::create_dir_all(&request.destination_dir)
            .map_err(|err| CoreError::io(&request.destination_dir, err))?;
        let final_path = request.destination_dir.join(&file_name);
        let temp_path = request
            .destination_dir
            .join(format!("{}{}", file_name, self.config.temp_suffix));
        let plan = self.plan(total_size, &temp_path);
        debug!(
            total = total_size,
            chunks = plan.len(),
            chunk_size = plan.chunk_size,
            "planned download"
        );

        Ok(SessionLayout {
            total_size,
            file_name,
            temp_path,
            final_path,
            plan,
        })
    }

    fn probe(&self) -> CoreResult<(u64, Option<String>)> {
        let url = self.session.request.url.as_str();
        match self.net.head(&HttpRequest::new(url)) {
            Ok(resp) if resp.is_success() => match resp.total_bytes {
                Some(total) if total > 0 => return Ok((total, resp.content_disposition)),
                _ => debug!("HEAD carried no usable length, probing with a ranged GET"),
            },
            Ok(resp) => debug!(
                status = resp.status_code,
                "HEAD rejected, probing with a ranged GET"
            ),
            Err(err) => debug!(error = %err, "HEAD failed, probing with a ranged GET"),
        }

        let resp = self
            .net
            .get(&HttpRequest::ranged(url, 0, 0))
            .map_err(|err| CoreError::Probe(err.to_string()))?;
        if !resp.is_success() {
            return Err(CoreError::Probe(format!(
                "server answered status {}",
                resp.status_code
            )));
        }
        match resp.range_total {
            Some(total) if total > 0 => Ok((total, resp.content_disposition)),
            _ => Err(CoreError::Probe(
                "server did not report a content length".to_string(),
            )),
        }
    }

    fn plan(&self, total_size: u64, temp_path: &Path) -> ChunkPlan {
        match self.store.load_plan(temp_path) {
            Ok(Some(fingerprint)) if fingerprint.total_size == total_size => {
                if let Some(plan) = ChunkPlan::from_fingerprint(&fingerprint) {
                    debug!(chunks = plan.len(), "reusing persisted chunk plan");
                    return plan;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "could not read persisted chunk plan"),
        }

        if let Err(err) = self.store.clear(temp_path) {
            warn!(error = %err, "could not clear stale resume records");
        }
        let plan = ChunkPlan::for_download(total_size, self.session.network_class, &self.config);
        self.save_plan(temp_path, &plan);
        plan
    }

    fn save_plan(&self, temp_path: &Path, plan: &ChunkPlan) {
        if let Err(err) = self.store.save_plan(temp_path, &plan.fingerprint()) {
            warn!(error = %err, "could not persist chunk plan");
        }
    }

    fn allocate(&self, layout: &SessionLayout) -> CoreResult<()> {
        let path = &layout.temp_path;
        let previous_len = fs::metadata(path).ok().map(|meta| meta.len());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|err| CoreError::io(path, err))?;

        if previous_len != Some(layout.total_size) {
            file.set_len(layout.total_size)
                .map_err(|err| CoreError::io(path, err))?;
            // Records describe bytes this file no longer holds.
            if let Err(err) = self.store.clear(path) {
                warn!(error = %err, "could not clear stale resume records");
            }
            self.save_plan(path, &layout.plan);
        }
        Ok(())
    }

    fn resume_points(&self, layout: &SessionLayout) -> Vec<u64> {
        let records = self
            .store
            .load_all(&layout.temp_path)
            .unwrap_or_else(|err| {
                warn!(error = %err, "could not load resume records");
                HashMap::new()
            });

        layout
            .plan
            .chunks
            .iter()
            .map(|chunk| match records.get(&chunk.index) {
                Some(&written) if written <= chunk.len() => {
                    debug!(chunk = chunk.index, bytes = written, "resuming chunk");
                    written
                }
                Some(&written) => {
                    warn!(
                        chunk = chunk.index,
                        bytes = written,
                        "resume record exceeds chunk length, restarting chunk"
                    );
                    0
                }
                None => 0,
            })
            .collect()
    }

    // Every chunk worker and the progress ticker are children of one scope,
    // so returning from here means all of them have exited.
    fn run_workers(
        &self,
        layout: &SessionLayout,
        resume_points: &[u64],
        counters: &ProgressCounters,
    ) -> Vec<CoreResult<ChunkOutcome>> {
        let stop = &self.session.stop;
        let throttle = Throttle::new(self.config.speed_limit_bytes_per_sec);
        let ctx = WorkerContext {
            url: &self.session.request.url,
            temp_path: &layout.temp_path,
            total_size: layout.total_size,
            config: &self.config,
            net: self.net.as_ref(),
            store: self.store.as_ref(),
            counters,
            throttle: &throttle,
            stop,
        };
        let aggregator = ProgressAggregator {
            counters,
            total: layout.total_size,
            listener: self.listener.as_ref(),
            gauge: &self.session.speed,
            interval: self.config.progress_interval(),
        };

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(layout.plan.len());
            let mut spawn_failure = None;
            for (chunk, resume_from) in layout
                .plan
                .chunks
                .iter()
                .copied()
                .zip(resume_points.iter().copied())
            {
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("rangefetch-chunk-{}", chunk.index))
                    .spawn_scoped(scope, move || {
                        let result = ChunkWorker::new(ctx, chunk, resume_from).run();
                        if let Err(err) = &result {
                            warn!(chunk = chunk.index, error = %err, "chunk abandoned");
                            ctx.stop.trigger(StopReason::Failed);
                        }
                        result
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        stop.trigger(StopReason::Failed);
                        spawn_failure = Some(CoreError::Io(format!(
                            "failed to spawn chunk worker: {}",
                            err
                        )));
                        break;
                    }
                }
            }

            let ticker = thread::Builder::new()
                .name("rangefetch-progress".to_string())
                .spawn_scoped(scope, || aggregator.run(stop, &self.state));
            if let Err(err) = &ticker {
                warn!(error = %err, "progress ticker unavailable");
            }

            let mut results: Vec<_> = handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CoreError::InvalidState("chunk worker panicked".to_string()))
                    })
                })
                .collect();
            if let Some(err) = spawn_failure {
                results.push(Err(err));
            }

            // From here on pause and cancel can no longer win the race.
            stop.trigger(StopReason::Finished);
            if let Ok(ticker) = ticker {
                let _ = ticker.join();
            }
            results
        })
    }

    fn finalize(&self, layout: &SessionLayout) -> CoreResult<PathBuf> {
        let temp = &layout.temp_path;
        OpenOptions::new()
            .write(true)
            .open(temp)
            .and_then(|file| file.sync_all())
            .map_err(|err| CoreError::io(temp, err))?;

        if let Some(checksum) = &self.session.request.checksum {
            verify_checksum(temp, checksum)?;
            debug!(algorithm = checksum.checksum_type.as_str(), "checksum verified");
        }

        fs::rename(temp, &layout.final_path)
            .map_err(|err| CoreError::io(&layout.final_path, err))?;
        if let Err(err) = self.store.clear(temp) {
            warn!(error = %err, "could not clear resume records");
        }
        Ok(layout.final_path.clone())
    }
}

fn discard_artifacts(store: &dyn ResumeStore, layout: &SessionLayout) {
    match fs::remove_file(&layout.temp_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %layout.temp_path.display(),
            error = %err,
            "could not remove temp file"
        ),
    }
    if let Err(err) = store.clear(&layout.temp_path) {
        warn!(error = %err, "could not clear resume records");
    }
}
