#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use scan_relay_rs::config::Config;
use scan_relay_rs::orchestrator::Orchestrator;
use scan_relay_rs::transport::MemoryTransport;
use tempfile::TempDir;

/// Scratch directory plus an orchestrator whose engine is `sh <script>`.
///
/// The script receives the usual engine arguments; the range is the last one.
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<MemoryTransport>,
    pub orchestrator: Orchestrator,
}

pub fn harness(script: &str, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-engine.sh");
    std::fs::write(&script_path, script).expect("write script");

    let mut config = Config::default();
    config.files_dir = dir.path().join("files");
    config.engine.command = vec!["sh".to_string(), script_path.display().to_string()];
    tweak(&mut config);

    let transport = Arc::new(MemoryTransport::new());
    let orchestrator = Orchestrator::new(config, transport.clone());
    Harness {
        dir,
        transport,
        orchestrator,
    }
}

/// Poll `cond` every 20ms for up to 5s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

pub const LAST_ARG: &str = "for range; do :; done\n";
