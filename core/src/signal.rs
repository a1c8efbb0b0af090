use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_CANCELED: u8 = 2;
const STOP_FAILED: u8 = 3;
const STOP_FINISHED: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    None,
    Paused,
    Cancelled,
    Failed,
    Finished,
}

impl StopReason {
    fn as_u8(self) -> u8 {
        match self {
            StopReason::None => STOP_NONE,
            StopReason::Paused => STOP_PAUSED,
            StopReason::Cancelled => STOP_CANCELED,
            StopReason::Failed => STOP_FAILED,
            StopReason::Finished => STOP_FINISHED,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            STOP_PAUSED => StopReason::Paused,
            STOP_CANCELED => StopReason::Cancelled,
            STOP_FAILED => StopReason::Failed,
            STOP_FINISHED => StopReason::Finished,
            _ => StopReason::None,
        }
    }
}

/// Stop flag for one download attempt. Workers poll it between reads, and
/// every sleep in the engine goes through `wait` so it ends as soon as the
/// flag is raised.
#[derive(Debug, Default)]
pub struct StopSignal {
    reason: AtomicU8,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason(&self) -> StopReason {
        StopReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    pub fn is_stopped(&self) -> bool {
        self.reason.load(Ordering::SeqCst) != STOP_NONE
    }

    pub fn trigger(&self, reason: StopReason) -> bool {
        if reason == StopReason::None {
            return false;
        }
        let won = self
            .reason
            .compare_exchange(STOP_NONE, reason.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            let _guard = self.guard();
            self.cvar.notify_all();
        }
        won
    }

    pub fn reset(&self) {
        self.reason.store(STOP_NONE, Ordering::SeqCst);
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let guard = self.guard();
        drop(
            self.cvar
                .wait_timeout_while(guard, timeout, |_| !self.is_stopped()),
        );
        self.is_stopped()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *open = true;
        self.cvar.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wait(&self) {
        let open = self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(self.cvar.wait_while(open, |open| !*open));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_first_reason_wins() {
        let signal = StopSignal::new();
        assert_eq!(signal.reason(), StopReason::None);
        assert!(signal.trigger(StopReason::Paused));
        assert!(!signal.trigger(StopReason::Cancelled));
        assert_eq!(signal.reason(), StopReason::Paused);
        signal.reset();
        assert!(!signal.is_stopped());
        assert!(!signal.trigger(StopReason::None));
    }

    #[test]
    fn test_wait_times_out_when_quiet() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_trigger_interrupts_long_wait() {
        let signal = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&signal);
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.trigger(StopReason::Cancelled);
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_latch_releases_waiters() {
        let latch = Arc::new(Latch::new());
        let waiter = Arc::clone(&latch);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        assert!(!latch.is_open());
        latch.open();
        handle.join().unwrap();
        assert!(latch.is_open());
    }
}
