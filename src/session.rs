use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ScanError;
use crate::storage::RunFiles;
use crate::supervisor::ProcessKiller;
use crate::types::{RateTier, UserId};

#[derive(Debug, Default)]
struct SessionState {
    files: Option<RunFiles>,
    ports: BTreeSet<u16>,
    rate: RateTier,
    active_scans: usize,
    processes: Vec<ProcessKiller>,
}

/// Per-user scan configuration and run bookkeeping.
///
/// The cancellation token is the only thing the command path and a running
/// scan both touch while the run is in flight.
#[derive(Debug)]
pub struct Session {
    user: UserId,
    state: Mutex<SessionState>,
    cancel: Mutex<CancellationToken>,
}

/// Point-in-time copy of a session for status displays.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user: UserId,
    pub input_file: Option<PathBuf>,
    pub result_file: Option<PathBuf>,
    pub ports: Vec<u16>,
    pub rate: RateTier,
    pub active_scans: usize,
    pub running_processes: usize,
    pub cancel_requested: bool,
}

impl Session {
    fn new(user: UserId) -> Self {
        Self {
            user,
            state: Mutex::new(SessionState::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn files(&self) -> Option<RunFiles> {
        self.state().files.clone()
    }

    pub fn set_files(&self, files: RunFiles) {
        self.state().files = Some(files);
    }

    /// Forget the current file references, returning them for deletion.
    pub fn take_files(&self) -> Option<RunFiles> {
        self.state().files.take()
    }

    /// Forget the file references only if they still point at `files`.
    pub fn clear_files_if(&self, files: &RunFiles) {
        let mut state = self.state();
        if state.files.as_ref() == Some(files) {
            state.files = None;
        }
    }

    pub fn ports(&self) -> BTreeSet<u16> {
        self.state().ports.clone()
    }

    pub fn set_ports(&self, ports: BTreeSet<u16>) {
        self.state().ports = ports;
    }

    pub fn rate(&self) -> RateTier {
        self.state().rate
    }

    pub fn set_rate(&self, rate: RateTier) {
        self.state().rate = rate;
    }

    pub fn active_scans(&self) -> usize {
        self.state().active_scans
    }

    /// Reserve a run slot, refusing once `limit` runs are active.
    pub fn increment_active(&self, limit: usize) -> Result<usize, ScanError> {
        let mut state = self.state();
        if state.active_scans >= limit {
            return Err(ScanError::ConcurrencyLimitExceeded { limit });
        }
        state.active_scans += 1;
        Ok(state.active_scans)
    }

    /// Release a run slot. Never goes below zero; the process list is emptied
    /// once nothing is running.
    pub fn decrement_active(&self) -> usize {
        let mut state = self.state();
        match state.active_scans.checked_sub(1) {
            Some(n) => state.active_scans = n,
            None => warn!(user = self.user, "active scan count already zero"),
        }
        if state.active_scans == 0 {
            state.processes.clear();
        }
        state.active_scans
    }

    pub fn register_process(&self, killer: ProcessKiller) {
        self.state().processes.push(killer);
    }

    pub fn unregister_process(&self, id: u64) {
        self.state().processes.retain(|p| p.id() != id);
    }

    pub fn running_processes(&self) -> usize {
        self.state().processes.len()
    }

    /// Token for a run about to start. Runs started before a reset share the old token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token().clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Flag every run of this session for cancellation and kill tracked processes.
    ///
    /// Returns `false` without doing anything when no scan is active.
    pub async fn request_cancel(&self) -> bool {
        if self.active_scans() == 0 {
            return false;
        }
        self.token().cancel();
        self.kill_all().await;
        true
    }

    /// Replace a fired token with a fresh one; a live token is left alone.
    pub fn clear_cancel(&self) {
        let mut token = self.token();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Best-effort kill of every tracked process.
    pub async fn kill_all(&self) {
        let killers: Vec<ProcessKiller> = self.state().processes.clone();
        for killer in killers {
            killer.kill().await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let cancel_requested = self.cancel_requested();
        let state = self.state();
        SessionSnapshot {
            user: self.user,
            input_file: state.files.as_ref().map(|f| f.input.clone()),
            result_file: state.files.as_ref().map(|f| f.result.clone()),
            ports: state.ports.iter().copied().collect(),
            rate: state.rate,
            active_scans: state.active_scans,
            running_processes: state.processes.len(),
            cancel_requested,
        }
    }
}

/// All sessions, keyed by user. Sessions are created on first use and live
/// until the process exits.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, user: UserId) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(user)
            .or_insert_with(|| Arc::new(Session::new(user)))
            .clone()
    }
}
