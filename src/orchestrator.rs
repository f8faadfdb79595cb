use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ScanError, TransportError};
use crate::parser::{parser_for, OutputParser};
use crate::ports::{engine_ports, parse_port_spec};
use crate::progress::{format_progress, ProgressReporter};
use crate::session::{Session, SessionRegistry};
use crate::storage::{FileStore, ResultLog, RunFiles};
use crate::supervisor::{ScanProcess, Supervisor};
use crate::targets::{parse_range_list, RangeEntry};
use crate::transport::Transport;
use crate::types::{Discovery, RateTier, RunOutcome, RunReport, UserId};

pub const INITIAL_PROGRESS: &str = "Initializing scan...";

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Drives scan runs for every user session.
///
/// Cheap to clone; all clones share the same sessions, engine settings and transport.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    sessions: SessionRegistry,
    store: FileStore,
    supervisor: Supervisor,
    parser: Arc<dyn OutputParser>,
    transport: Arc<dyn Transport>,
}

impl Orchestrator {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let parser = parser_for(config.engine.output);
        Self::with_parser(config, transport, parser)
    }

    pub fn with_parser(
        config: Config,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn OutputParser>,
    ) -> Self {
        let store = FileStore::new(config.files_dir.clone());
        let supervisor = Supervisor::new(config.engine.clone(), config.rates);
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: SessionRegistry::new(),
                store,
                supervisor,
                parser,
                transport,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn session(&self, user: UserId) -> Arc<Session> {
        self.inner.sessions.get_or_create(user)
    }

    /// Store and validate an uploaded range list, replacing any earlier upload.
    ///
    /// Returns the number of range entries. On rejection nothing is kept on disk.
    pub async fn accept_upload(&self, user: UserId, contents: &[u8]) -> Result<usize, ScanError> {
        let size = contents.len() as u64;
        let max = self.inner.config.max_file_size;
        if size > max {
            return Err(ScanError::FileTooLarge { size, max });
        }

        let session = self.session(user);
        self.cleanup_files(user).await;

        let files = self
            .inner
            .store
            .save_upload(user, contents)
            .await
            .map_err(ScanError::Storage)?;
        session.set_files(files.clone());

        let validated = std::str::from_utf8(contents)
            .map_err(|_| ScanError::InvalidRangeFormat("file is not valid UTF-8".to_string()))
            .and_then(parse_range_list);
        match validated {
            Ok(entries) => {
                info!(user, ranges = entries.len(), "range list accepted");
                Ok(entries.len())
            }
            Err(e) => {
                debug!(user, "range list rejected: {e}");
                session.clear_files_if(&files);
                self.inner.store.cleanup(&files).await;
                Err(e)
            }
        }
    }

    /// Drop the session's input and result files. Safe to call repeatedly.
    pub async fn cleanup_files(&self, user: UserId) {
        if let Some(files) = self.session(user).take_files() {
            self.inner.store.cleanup(&files).await;
        }
    }

    pub fn set_rate(&self, user: UserId, rate: RateTier) {
        self.session(user).set_rate(rate);
    }

    /// Validate a port spec and reserve a run slot for `user`.
    ///
    /// The returned ticket holds the slot; dropping it without launching
    /// releases the slot and performs the usual end-of-run cleanup.
    pub async fn start_scan(&self, user: UserId, spec: &str) -> Result<ScanTicket, ScanError> {
        let session = self.session(user);
        let files = session.files().ok_or(ScanError::NoInputFile)?;
        let ports = parse_port_spec(spec)?;
        debug_assert!(!ports.is_empty());

        session.increment_active(self.inner.config.max_concurrent_scans)?;
        let token = session.cancel_token();
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        let guard = RunGuard {
            session: session.clone(),
            store: self.inner.store.clone(),
            run_files: files.for_run(run_id),
            upload: files.clone(),
            token: token.clone(),
            removed: false,
        };
        session.set_ports(ports.clone());

        let content = tokio::fs::read_to_string(&files.input)
            .await
            .map_err(ScanError::Storage)?;
        let entries = parse_range_list(&content)?;

        Ok(ScanTicket {
            orchestrator: self.clone(),
            guard,
            entries,
            ports,
            rate: session.rate(),
            token,
        })
    }

    /// Ask every run of `user` to stop. False when nothing is running.
    pub async fn cancel(&self, user: UserId) -> bool {
        let requested = self.session(user).request_cancel().await;
        if requested {
            info!(user, "scan cancellation requested");
        }
        requested
    }
}

/// A reserved, not yet running scan.
pub struct ScanTicket {
    orchestrator: Orchestrator,
    guard: RunGuard,
    entries: Vec<RangeEntry>,
    ports: BTreeSet<u16>,
    rate: RateTier,
    token: CancellationToken,
}

impl fmt::Debug for ScanTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTicket")
            .field("user", &self.guard.session.user())
            .field("entries", &self.entries)
            .field("ports", &self.ports)
            .field("rate", &self.rate)
            .finish()
    }
}

impl ScanTicket {
    pub fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }

    pub fn ranges(&self) -> &[RangeEntry] {
        &self.entries
    }

    pub fn rate(&self) -> RateTier {
        self.rate
    }

    pub fn packets_per_second(&self) -> u64 {
        self.orchestrator.inner.config.rates.packets_per_second(self.rate)
    }

    /// Run on a background task.
    pub fn launch(self) -> JoinHandle<RunReport> {
        tokio::spawn(self.run())
    }

    /// Process every range in order until done, cancelled, timed out or failed.
    pub async fn run(self) -> RunReport {
        let ScanTicket {
            orchestrator,
            mut guard,
            entries,
            ports,
            rate,
            token,
        } = self;
        let inner = &orchestrator.inner;
        let session = guard.session.clone();
        let user = session.user();

        let started = Instant::now();
        let mut progress = ProgressReporter::start(
            inner.transport.clone(),
            user,
            INITIAL_PROGRESS,
            inner.config.progress_every_lines,
        )
        .await;
        let mut run = RunState {
            user,
            token,
            started,
            ports_str: engine_ports(&ports),
            log: ResultLog::new(guard.run_files.result.clone()),
            found: Vec::new(),
        };
        info!(user, ranges = entries.len(), ports = ports.len(), %rate, "scan started");

        let outcome = match inner
            .drive(&session, &entries, &ports, rate, &mut run, &mut progress)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(user, "scan error: {e}");
                progress
                    .update_if_changed(&format!("Error during scan: {e}"))
                    .await;
                RunOutcome::Failed(e.to_string())
            }
        };

        inner.deliver(&outcome, &run, &mut progress).await;
        info!(
            user,
            %outcome,
            found = run.found.len(),
            elapsed_secs = started.elapsed().as_secs(),
            "scan finished"
        );

        let RunState { log, found, .. } = run;
        drop(log);
        inner.store.cleanup(&guard.run_files).await;
        guard.removed = true;
        drop(guard);
        RunReport {
            outcome,
            discoveries: found,
        }
    }
}

/// Mutable bookkeeping of one run.
struct RunState {
    user: UserId,
    token: CancellationToken,
    started: Instant,
    ports_str: String,
    log: ResultLog,
    found: Vec<Discovery>,
}

/// Releases a run slot on every exit path, panics included.
struct RunGuard {
    session: Arc<Session>,
    store: FileStore,
    /// The session's upload as it was when the run was reserved.
    upload: RunFiles,
    /// Shared input plus this run's own result log.
    run_files: RunFiles,
    token: CancellationToken,
    /// Set once the files were removed on the async path.
    removed: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.session.decrement_active();
        if !self.removed {
            self.store.cleanup_blocking(&self.run_files);
        }
        self.session.clear_files_if(&self.upload);
        if self.token.is_cancelled() {
            self.session.clear_cancel();
        }
    }
}

impl Inner {
    async fn drive(
        &self,
        session: &Session,
        entries: &[RangeEntry],
        ports: &BTreeSet<u16>,
        rate: RateTier,
        run: &mut RunState,
        progress: &mut ProgressReporter,
    ) -> Result<RunOutcome, ScanError> {
        let timeout = self.config.scan_timeout();

        for entry in entries {
            if run.token.is_cancelled() {
                break;
            }
            if run.started.elapsed() > timeout {
                warn!(user = run.user, range = %entry, "scan timeout reached");
                progress
                    .update_if_changed("Scan timeout reached. Stopping...")
                    .await;
                return Ok(RunOutcome::TimedOut);
            }

            let range = entry.to_string();
            let mut process = self.supervisor.spawn(entry, ports, rate)?;
            session.register_process(process.killer());

            let pumped = self.pump(&mut process, &range, run, progress).await;
            session.unregister_process(process.id());
            if let Err(e) = pumped {
                process.kill().await;
                return Err(e);
            }

            let status = process.wait(&run.token).await?;
            if !status.success() && !run.token.is_cancelled() {
                warn!(user = run.user, %range, %status, "engine exited unsuccessfully");
            }
        }

        if run.token.is_cancelled() {
            session.kill_all().await;
            return Ok(RunOutcome::Cancelled);
        }
        Ok(RunOutcome::Completed)
    }

    /// Read one engine's output until EOF or cancellation.
    async fn pump(
        &self,
        process: &mut ScanProcess,
        range: &str,
        run: &mut RunState,
        progress: &mut ProgressReporter,
    ) -> Result<(), ScanError> {
        loop {
            let line = tokio::select! {
                biased;
                _ = run.token.cancelled() => {
                    debug!(user = run.user, range, "cancelled mid-range");
                    return Ok(());
                }
                line = process.read_line() => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };

            if let Some(discovery) = self.parser.parse_line(&line) {
                run.log.append(&discovery).await.map_err(ScanError::Storage)?;
                debug!(user = run.user, %discovery, "open port");
                run.found.push(discovery);
            }

            if progress.tick() {
                let text = format_progress(
                    run.started.elapsed(),
                    run.found.len(),
                    range,
                    &run.ports_str,
                );
                progress.update_if_changed(&text).await;
            }
        }
    }

    async fn deliver(&self, outcome: &RunOutcome, run: &RunState, progress: &mut ProgressReporter) {
        let user = run.user;
        let count = run.found.len();
        match outcome {
            RunOutcome::Completed | RunOutcome::TimedOut => {
                if count == 0 {
                    progress
                        .update_if_changed("Scan complete\nNo open ports found")
                        .await;
                } else {
                    let caption = format!("Scan complete\nFound {count} open ports");
                    let sent = self
                        .transport
                        .send_file(user, run.log.path(), "scan_results.txt", &caption)
                        .await;
                    log_delivery(user, sent);
                }
            }
            RunOutcome::Cancelled => {
                progress
                    .update_if_changed("Scan cancelled. Sending partial results...")
                    .await;
                if count == 0 {
                    let sent = self
                        .transport
                        .send_text(user, "Scan cancelled. No results to display.")
                        .await;
                    log_delivery(user, sent.map(|_| ()));
                } else {
                    let caption = format!("Scan cancelled.\nFound {count} open ports so far.");
                    let sent = self
                        .transport
                        .send_file(user, run.log.path(), "partial_scan_results.txt", &caption)
                        .await;
                    log_delivery(user, sent);
                }
            }
            RunOutcome::Failed(_) => {}
        }
    }
}

fn log_delivery(user: UserId, sent: Result<(), TransportError>) {
    if let Err(e) = sent {
        warn!(user, "failed to deliver scan result: {e}");
    }
}
