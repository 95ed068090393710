use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UpdaterError;

/// Reporting boundaries for progress signals.
pub const PROGRESS_BOUNDARIES: &[u8] = &[0, 25, 50, 75];
/// The monitor polls the job's progress at this cadence.
const MONITOR_POLL: Duration = Duration::from_millis(250);
/// Off-boundary emissions are rate limited to one per second.
const MONITOR_MIN_PERIOD: Duration = Duration::from_secs(1);

/// Shared progress counter between a worker and its monitor.
pub struct Progress {
    percent: AtomicU8,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Progress {
            percent: AtomicU8::new(0),
        })
    }

    pub fn set(&self, percent: u8) {
        self.percent.store(percent.min(100), Ordering::SeqCst);
    }

    pub fn get(&self) -> u8 {
        self.percent.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    Download,
    Flash,
}

struct ActiveJob {
    handle_id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slots {
    download: Option<ActiveJob>,
    flash: Option<ActiveJob>,
}

/// Tracks the device's active jobs.
///
/// At most one download and one flash are active at any time, device-wide;
/// a flash additionally refuses to start while a download runs. Job
/// records live until the owning worker drops its [`JobGuard`], which it
/// does only after the terminal signal has been published.
pub struct JobTable {
    slots: Mutex<Slots>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        JobTable {
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn begin_download(
        self: &Arc<Self>,
        handle_id: u64,
        firmware_name: &str,
    ) -> Result<JobGuard, UpdaterError> {
        let mut slots = self.slots.lock();
        if slots.download.is_some() {
            return Err(UpdaterError::AlreadyInProgress("a download is".into()));
        }
        let cancel = CancellationToken::new();
        slots.download = Some(ActiveJob {
            handle_id,
            cancel: cancel.clone(),
        });
        metrics::gauge!("fwupdater_active_jobs", "kind" => "download").set(1.0);
        Ok(JobGuard {
            table: Arc::clone(self),
            kind: JobKind::Download,
            handle_id,
            firmware_name: firmware_name.to_string(),
            cancel,
            progress: Progress::new(),
        })
    }

    pub fn begin_flash(
        self: &Arc<Self>,
        handle_id: u64,
        firmware_name: &str,
    ) -> Result<JobGuard, UpdaterError> {
        let mut slots = self.slots.lock();
        if slots.download.is_some() {
            return Err(UpdaterError::AlreadyInProgress("a download is".into()));
        }
        if slots.flash.is_some() {
            return Err(UpdaterError::AlreadyInProgress("a flash is".into()));
        }
        let cancel = CancellationToken::new();
        slots.flash = Some(ActiveJob {
            handle_id,
            cancel: cancel.clone(),
        });
        metrics::gauge!("fwupdater_active_jobs", "kind" => "flash").set(1.0);
        Ok(JobGuard {
            table: Arc::clone(self),
            kind: JobKind::Flash,
            handle_id,
            firmware_name: firmware_name.to_string(),
            cancel,
            progress: Progress::new(),
        })
    }

    pub fn download_active(&self) -> bool {
        self.slots.lock().download.is_some()
    }

    /// Requests cancellation of every job owned by `handle_id`.
    ///
    /// The workers observe the token cooperatively and emit their terminal
    /// error signals; the slots free once the guards drop.
    pub fn cancel_for_handle(&self, handle_id: u64) -> usize {
        let slots = self.slots.lock();
        let mut cancelled = 0;
        for job in [&slots.download, &slots.flash].into_iter().flatten() {
            if job.handle_id == handle_id {
                debug!(handle_id, "cancelling job for unregistered handle");
                job.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn release(&self, kind: JobKind) {
        let mut slots = self.slots.lock();
        match kind {
            JobKind::Download => {
                slots.download = None;
                metrics::gauge!("fwupdater_active_jobs", "kind" => "download").set(0.0);
            }
            JobKind::Flash => {
                slots.flash = None;
                metrics::gauge!("fwupdater_active_jobs", "kind" => "flash").set(0.0);
            }
        }
    }
}

/// Exclusive claim on a job slot, held by the worker for the lifetime of
/// the job. Dropping it frees the slot; drop only after the terminal
/// signal is out.
pub struct JobGuard {
    table: Arc<JobTable>,
    kind: JobKind,
    pub handle_id: u64,
    pub firmware_name: String,
    pub cancel: CancellationToken,
    pub progress: Arc<Progress>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.table.release(self.kind);
    }
}

/// Background task that turns the shared progress counter into signal
/// emissions.
///
/// Emits when the percentage crosses a reporting boundary and at most once
/// per second otherwise. The emitted value is the highest crossed boundary
/// (raw percent rides along for the message); the terminal 100 is never
/// emitted here, it belongs to the worker's terminal signal.
pub struct ProgressMonitor {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    pub fn spawn<F>(progress: Arc<Progress>, job_cancel: CancellationToken, emit: F) -> Self
    where
        F: Fn(u8, u8) + Send + 'static,
    {
        let stop = CancellationToken::new();
        let monitor_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let mut last_boundary: Option<u8> = None;
            let mut last_raw: Option<u8> = None;
            let mut last_emit = Instant::now() - MONITOR_MIN_PERIOD;
            loop {
                tokio::select! {
                    () = monitor_stop.cancelled() => break,
                    () = job_cancel.cancelled() => break,
                    () = tokio::time::sleep(MONITOR_POLL) => {}
                }
                let raw = progress.get();
                if raw >= 100 {
                    continue;
                }
                let boundary = PROGRESS_BOUNDARIES
                    .iter()
                    .copied()
                    .filter(|b| *b <= raw)
                    .next_back()
                    .unwrap_or(0);
                let crossed = last_boundary != Some(boundary);
                let due = last_raw != Some(raw) && last_emit.elapsed() >= MONITOR_MIN_PERIOD;
                if crossed || due {
                    emit(boundary, raw);
                    last_boundary = Some(boundary);
                    last_raw = Some(raw);
                    last_emit = Instant::now();
                }
            }
        });
        ProgressMonitor { stop, handle }
    }

    /// Stops the monitor and waits for it to finish. Workers call this
    /// before emitting their terminal signal so no progress signal can
    /// follow it.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!(%err, "progress monitor task failed");
        }
    }
}
