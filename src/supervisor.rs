use std::collections::BTreeSet;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EngineConfig, RateTable};
use crate::error::ScanError;
use crate::ports::engine_ports;
use crate::targets::RangeEntry;
use crate::types::RateTier;

const STDERR_DRAIN: Duration = Duration::from_secs(1);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Builds and launches one engine invocation per range entry.
#[derive(Debug, Clone)]
pub struct Supervisor {
    engine: EngineConfig,
    rates: RateTable,
}

impl Supervisor {
    pub fn new(engine: EngineConfig, rates: RateTable) -> Self {
        Self { engine, rates }
    }

    /// `<engine> -p<ports> --rate=<N> [extra args] <range>`
    pub fn build_command(
        &self,
        range: &RangeEntry,
        ports: &BTreeSet<u16>,
        rate: RateTier,
    ) -> Result<Command, ScanError> {
        let (program, leading) = self.engine.command.split_first().ok_or_else(|| {
            ScanError::SpawnFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "engine command is empty",
            ))
        })?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(format!("-p{}", engine_ports(ports)))
            .arg(format!("--rate={}", self.rates.packets_per_second(rate)))
            .args(&self.engine.extra_args)
            .arg(range.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Launch the engine for exactly one range. No retry on failure.
    pub fn spawn(
        &self,
        range: &RangeEntry,
        ports: &BTreeSet<u16>,
        rate: RateTier,
    ) -> Result<ScanProcess, ScanError> {
        let mut child = self
            .build_command(range, ports, rate)?
            .spawn()
            .map_err(ScanError::SpawnFailure)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ScanError::SpawnFailure(std::io::Error::other("engine stdout was not captured"))
        })?;
        let stderr_task = child.stderr.take().map(|stderr| {
            let range = range.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%range, "engine stderr: {line}");
                }
            })
        });

        let id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, pid = child.id(), %range, "engine started");
        Ok(ScanProcess {
            id,
            child: Arc::new(Mutex::new(child)),
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
        })
    }
}

/// A running engine process with its stdout exposed as a line stream.
#[derive(Debug)]
pub struct ScanProcess {
    id: u64,
    child: Arc<Mutex<Child>>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ScanProcess {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next stdout line, `None` at EOF. Cancel-safe.
    pub async fn read_line(&mut self) -> Result<Option<String>, ScanError> {
        self.stdout.next_line().await.map_err(ScanError::EngineIo)
    }

    /// Handle that can kill this process from another task.
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            id: self.id,
            child: self.child.clone(),
        }
    }

    pub async fn kill(&self) {
        self.killer().kill().await;
    }

    /// Wait for exit. If `cancel` fires first the process is killed and then reaped.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, ScanError> {
        let status = {
            let mut child = self.child.lock().await;
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };
            match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(id = self.id, "kill before reap: {e}");
                    }
                    child.wait().await
                }
            }
        };
        if let Some(task) = self.stderr_task.take() {
            // A surviving grandchild can hold stderr open; don't wait on it for long.
            let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
        }
        status.map_err(ScanError::EngineIo)
    }
}

/// Clonable kill switch for a tracked process. Killing is idempotent.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    id: u64,
    child: Arc<Mutex<Child>>,
}

impl ProcessKiller {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = child.start_kill() {
                    warn!(id = self.id, "failed to kill engine process: {e}");
                }
            }
            Err(e) => debug!(id = self.id, "engine already gone: {e}"),
        }
    }
}
