// =============================================================================
// Scan State — per-program mutable controller
// =============================================================================
//
// One instance per program, created at process start and held for the
// process lifetime. Owns the running flag, stop request, the current run's
// cancellation token, its resume snapshot, and a status record exposed to
// callers of `get_status`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::resume::ResumeSnapshot;
use crate::types::ScanProgram;

/// The lifecycle phase of a program's most recent or in-progress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Idle,
    Running,
    RunningRetry,
    RunningMa,
    Stopping,
    Stopped,
    Completed,
    CompletedWithErrors,
    Paused,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::RunningRetry => "running-retry",
            RunStatus::RunningMa => "running-ma",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed-with-errors",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of `ScanState` suitable for the `get_status` external
/// interface — a fixed struct, not a free-form map.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub program: ScanProgram,
    pub running: bool,
    pub status: RunStatus,
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

struct Inner {
    status: RunStatus,
    total: usize,
    processed: usize,
    errors: usize,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    resume_snapshot: Option<ResumeSnapshot>,
    cancellation_token: Option<CancellationToken>,
}

impl Inner {
    fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            total: 0,
            processed: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
            last_failure_reason: None,
            resume_snapshot: None,
            cancellation_token: None,
        }
    }
}

/// Outcome of `begin_run`.
pub enum BeginRunResult {
    Started(CancellationToken),
    AlreadyRunning,
    /// `resume` was requested but the stored snapshot failed normalisation.
    NoResume,
}

pub struct ScanState {
    program: ScanProgram,
    running: AtomicBool,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    inner: RwLock<Inner>,
}

impl ScanState {
    pub fn new(program: ScanProgram) -> Arc<Self> {
        Arc::new(Self {
            program,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            inner: RwLock::new(Inner::idle()),
        })
    }

    pub fn program(&self) -> ScanProgram {
        self.program
    }

    /// Attempt to claim exclusive ownership of a run. `resume_snapshot` is
    /// the normalised snapshot already loaded by the caller, if any was
    /// requested and passed normalisation; `resume_requested` distinguishes
    /// "resume asked for but invalid" from "resume not asked for".
    pub fn begin_run(&self, resume_requested: bool, resume_snapshot: Option<ResumeSnapshot>) -> BeginRunResult {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return BeginRunResult::AlreadyRunning;
        }

        if resume_requested && resume_snapshot.is_none() {
            self.running.store(false, Ordering::SeqCst);
            return BeginRunResult::NoResume;
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);

        let token = CancellationToken::new();
        let mut inner = self.inner.write();
        inner.status = RunStatus::Running;
        inner.started_at = Some(Utc::now());
        inner.finished_at = None;
        inner.last_failure_reason = None;
        if let Some(snap) = resume_snapshot {
            inner.total = snap.total;
            inner.processed = snap.processed;
            inner.errors = snap.errors;
            inner.resume_snapshot = Some(snap);
        } else {
            inner.total = 0;
            inner.processed = 0;
            inner.errors = 0;
            inner.resume_snapshot = None;
        }
        inner.cancellation_token = Some(token.clone());

        BeginRunResult::Started(token)
    }

    /// Request that the current run stop. Returns whether a run was actually
    /// in progress to be stopped.
    pub fn request_stop(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.inner.write().status = RunStatus::Stopping;
        if let Some(token) = self.inner.read().cancellation_token.clone() {
            token.cancel();
        }
        true
    }

    pub fn request_pause(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: RunStatus) {
        self.inner.write().status = status;
    }

    pub fn set_totals(&self, total: usize) {
        self.inner.write().total = total;
    }

    /// Progress checkpoint: updates `processed`/`errors` and persists the
    /// snapshot's matching counters. Call on every `on_settled`.
    pub fn update_progress(&self, processed: usize, errors: usize) {
        let mut inner = self.inner.write();
        inner.processed = processed;
        inner.errors = errors;
        if let Some(snap) = inner.resume_snapshot.as_mut() {
            snap.processed = processed;
            snap.errors = errors;
            snap.next_index = processed;
        }
    }

    /// Persist a (possibly rewound) resume snapshot — called at every
    /// checkpoint and on stop/pause/failure.
    pub fn save_resume_state(&self, snapshot: Option<ResumeSnapshot>) {
        self.inner.write().resume_snapshot = snapshot;
    }

    pub fn resume_snapshot(&self) -> Option<ResumeSnapshot> {
        self.inner.read().resume_snapshot.clone()
    }

    pub fn can_resume(&self) -> bool {
        self.inner.read().resume_snapshot.is_some()
    }

    /// Mark the run stopped. The resume snapshot is preserved.
    pub fn mark_stopped(&self) {
        self.terminate(RunStatus::Stopped, None);
    }

    pub fn mark_paused(&self) {
        self.terminate(RunStatus::Paused, None);
    }

    /// Mark the run completed. `had_errors` selects between `Completed` and
    /// `CompletedWithErrors`; the resume snapshot is cleared.
    pub fn mark_completed(&self, had_errors: bool) {
        let status = if had_errors {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        let mut inner = self.inner.write();
        inner.status = status;
        inner.finished_at = Some(Utc::now());
        inner.resume_snapshot = None;
        inner.cancellation_token = None;
        drop(inner);
        self.running.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn mark_failed(&self, reason: String) {
        self.terminate(RunStatus::Failed, Some(reason));
    }

    fn terminate(&self, status: RunStatus, reason: Option<String>) {
        let mut inner = self.inner.write();
        inner.status = status;
        inner.finished_at = Some(Utc::now());
        inner.last_failure_reason = reason;
        inner.cancellation_token = None;
        drop(inner);
        self.running.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn get_status(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            program: self.program,
            running: self.running.load(Ordering::SeqCst),
            status: inner.status,
            total: inner.total,
            processed: inner.processed,
            errors: inner.errors,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    /// Drop the cancellation token reference once the run owning it has
    /// ended. Only one run is ever in flight per `ScanState`, so
    /// there is no identity check to make — the caller holds the only token
    /// that could still be live.
    pub fn cleanup(&self, _token: &CancellationToken) {
        self.inner.write().cancellation_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_run_rejects_a_second_concurrent_run() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        assert!(matches!(state.begin_run(false, None), BeginRunResult::Started(_)));
        assert!(matches!(state.begin_run(false, None), BeginRunResult::AlreadyRunning));
    }

    #[test]
    fn begin_run_with_invalid_resume_returns_no_resume_and_releases_the_slot() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        assert!(matches!(state.begin_run(true, None), BeginRunResult::NoResume));
        // The slot must have been released — a subsequent attempt can still start.
        assert!(matches!(state.begin_run(false, None), BeginRunResult::Started(_)));
    }

    #[test]
    fn request_stop_transitions_status_and_cancels_token() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        let token = match state.begin_run(false, None) {
            BeginRunResult::Started(t) => t,
            _ => panic!("expected started"),
        };
        assert!(state.request_stop());
        assert_eq!(state.get_status().status, RunStatus::Stopping);
        assert!(token.is_cancelled());
    }

    #[test]
    fn mark_completed_clears_resume_snapshot_and_releases_running_flag() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        state.begin_run(false, None);
        state.update_progress(5, 0);
        state.mark_completed(false);

        let status = state.get_status();
        assert_eq!(status.status, RunStatus::Completed);
        assert!(!status.running);
        assert!(!state.can_resume());
    }

    #[test]
    fn mark_completed_selects_completed_with_errors_when_errors_present() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        state.begin_run(false, None);
        state.mark_completed(true);
        assert_eq!(state.get_status().status, RunStatus::CompletedWithErrors);
    }

    #[test]
    fn mark_stopped_preserves_whatever_resume_snapshot_was_saved() {
        let state = ScanState::new(ScanProgram::FetchDaily);
        state.begin_run(false, None);
        let snap = crate::resume::ResumeSnapshot {
            program: ScanProgram::FetchDaily,
            source_interval: "1day".to_string(),
            as_of_trade_date: Some(chrono::NaiveDate::from_ymd_opt(2026, 7, 20).unwrap()),
            tickers: vec![],
            total: 10,
            next_index: 3,
            processed: 3,
            errors: 0,
            extra_per_program: Default::default(),
            lookback_days: None,
            last_published_trade_date: None,
        };
        state.save_resume_state(Some(snap));
        state.mark_stopped();
        assert!(state.can_resume());
        assert_eq!(state.get_status().status, RunStatus::Stopped);
    }
}
