#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{harness, wait_until, LAST_ARG};
use scan_relay_rs::config::{Config, EngineOutput};
use scan_relay_rs::error::{ScanError, TransportError};
use scan_relay_rs::orchestrator::Orchestrator;
use scan_relay_rs::transport::{MemoryTransport, Outbound, Transport};
use scan_relay_rs::types::{MessageId, RunOutcome, UserId};

const USER: UserId = 1001;

fn delivered_files(t: &MemoryTransport, user: UserId) -> Vec<(String, String, String)> {
    t.messages(user)
        .into_iter()
        .filter_map(|m| match m {
            Outbound::File {
                file_name,
                caption,
                contents,
            } => Some((file_name, caption, contents)),
            Outbound::Text { .. } => None,
        })
        .collect()
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[tokio::test]
async fn single_range_run_reports_both_discoveries() {
    let script = format!(
        "{LAST_ARG}\
         echo \"$@\" > \"$(dirname \"$0\")/args.txt\"\n\
         echo \"Starting masscan 1.3.2\"\n\
         echo \"Discovered open port 22/tcp on 10.0.0.1\"\n\
         echo \"Discovered open port 80/tcp on 10.0.0.2\"\n"
    );
    let h = harness(&script, |_| {});

    assert_eq!(h.orchestrator.accept_upload(USER, b"10.0.0.0/30\n").await.unwrap(), 1);
    let ticket = h.orchestrator.start_scan(USER, "80,22").await.unwrap();
    let report = ticket.launch().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let found: Vec<String> = report.discoveries.iter().map(ToString::to_string).collect();
    assert_eq!(found, vec!["10.0.0.1:22", "10.0.0.2:80"]);

    let args = std::fs::read_to_string(h.dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), "-p22,80 --rate=10000 10.0.0.0/30");

    let files = delivered_files(&h.transport, USER);
    assert_eq!(files.len(), 1);
    let (name, caption, contents) = &files[0];
    assert_eq!(name, "scan_results.txt");
    assert!(caption.contains("Found 2 open ports"));
    assert_eq!(contents, "10.0.0.1:22\n10.0.0.2:80\n");

    let snap = h.orchestrator.session(USER).snapshot();
    assert_eq!(snap.active_scans, 0);
    assert_eq!(snap.running_processes, 0);
    assert!(snap.input_file.is_none());
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn discoveries_keep_engine_order() {
    let script = "echo \"Discovered open port 80/tcp on 10.0.0.5\"\n\
                  echo \"Discovered open port 22/tcp on 10.0.0.5\"\n\
                  echo \"Discovered open port 443/tcp on 10.0.0.5\"\n";
    let h = harness(script, |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.5\n").await.unwrap();
    let report = h.orchestrator.start_scan(USER, "22,80,443").await.unwrap().run().await;

    let ports: Vec<u16> = report.discoveries.iter().map(|d| d.port).collect();
    assert_eq!(ports, vec![80, 22, 443]);
    let (_, _, contents) = &delivered_files(&h.transport, USER)[0];
    assert_eq!(contents, "10.0.0.5:80\n10.0.0.5:22\n10.0.0.5:443\n");
}

#[tokio::test]
async fn ranges_run_in_file_order() {
    let script = format!("{LAST_ARG}echo \"Discovered open port 22/tcp on $range\"\n");
    let h = harness(&script, |_| {});
    h.orchestrator
        .accept_upload(USER, b"10.0.0.3\n\n10.0.0.1\n10.0.0.2\n")
        .await
        .unwrap();
    let report = h.orchestrator.start_scan(USER, "22").await.unwrap().run().await;

    let found: Vec<String> = report.discoveries.iter().map(ToString::to_string).collect();
    assert_eq!(found, vec!["10.0.0.3:22", "10.0.0.1:22", "10.0.0.2:22"]);
}

#[tokio::test]
async fn empty_upload_is_rejected_without_leftovers() {
    let h = harness("true\n", |_| {});
    let err = h.orchestrator.accept_upload(USER, b"").await.unwrap_err();
    assert!(matches!(err, ScanError::EmptyFile));

    assert!(h.orchestrator.session(USER).files().is_none());
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
    assert!(matches!(
        h.orchestrator.start_scan(USER, "80").await.unwrap_err(),
        ScanError::NoInputFile
    ));
}

#[tokio::test]
async fn invalid_line_discards_the_upload() {
    let h = harness("true\n", |_| {});
    let err = h
        .orchestrator
        .accept_upload(USER, b"10.0.0.1\nnot a range\n")
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidRangeFormat(_)));
    assert!(h.orchestrator.session(USER).files().is_none());
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let h = harness("true\n", |cfg| cfg.max_file_size = 8);
    let err = h.orchestrator.accept_upload(USER, b"10.0.0.1/32\n").await.unwrap_err();
    assert!(matches!(err, ScanError::FileTooLarge { size: 12, max: 8 }));
}

#[tokio::test]
async fn new_upload_discards_the_previous_one() {
    let h = harness("true\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    let first = h.orchestrator.session(USER).files().unwrap();
    // Uploads are named by second; make sure the second one gets a new name.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.orchestrator.accept_upload(USER, b"10.0.0.2\n").await.unwrap();
    let second = h.orchestrator.session(USER).files().unwrap();

    assert_ne!(first, second);
    assert!(!first.input.exists());
    assert!(second.input.exists());
}

#[tokio::test]
async fn cleanup_twice_is_harmless() {
    let h = harness("true\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    h.orchestrator.cleanup_files(USER).await;
    h.orchestrator.cleanup_files(USER).await;
    assert!(h.orchestrator.session(USER).files().is_none());
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn bad_port_spec_does_not_reserve_a_slot() {
    let h = harness("true\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    for spec in ["80,70000", "", "80,"] {
        assert!(matches!(
            h.orchestrator.start_scan(USER, spec).await.unwrap_err(),
            ScanError::InvalidPortFormat(_)
        ));
    }
    let session = h.orchestrator.session(USER);
    assert_eq!(session.active_scans(), 0);
    assert!(session.files().is_some());
}

#[tokio::test]
async fn concurrency_ceiling_rejects_the_extra_request() {
    let h = harness("while :; do sleep 0.1; done\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..3 {
        runs.push(h.orchestrator.start_scan(USER, "80").await.unwrap().launch());
    }
    let err = h.orchestrator.start_scan(USER, "80").await.unwrap_err();
    assert!(matches!(err, ScanError::ConcurrencyLimitExceeded { limit: 3 }));
    assert_eq!(h.orchestrator.session(USER).active_scans(), 3);

    let session = h.orchestrator.session(USER);
    wait_until(|| session.running_processes() == 3).await;
    assert!(h.orchestrator.cancel(USER).await);

    for run in runs {
        let report = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("run stopped")
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }
    let snap = session.snapshot();
    assert_eq!(snap.active_scans, 0);
    assert_eq!(snap.running_processes, 0);
    assert!(!snap.cancel_requested);
}

#[tokio::test]
async fn dropped_ticket_releases_its_slot_and_files() {
    let h = harness("true\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    let ticket = h.orchestrator.start_scan(USER, "80").await.unwrap();
    assert_eq!(h.orchestrator.session(USER).active_scans(), 1);

    drop(ticket);
    let session = h.orchestrator.session(USER);
    assert_eq!(session.active_scans(), 0);
    assert!(session.files().is_none());
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn concurrent_runs_keep_separate_result_files() {
    let script = "port=${1#-p}\n\
                  echo \"Discovered open port $port/tcp on 10.0.0.1\"\n\
                  sleep 1\n";
    let h = harness(script, |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();

    let first = h.orchestrator.start_scan(USER, "22").await.unwrap();
    let second = h.orchestrator.start_scan(USER, "80").await.unwrap();
    let (a, b) = tokio::join!(first.launch(), second.launch());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.outcome, RunOutcome::Completed);
    assert_eq!(b.outcome, RunOutcome::Completed);
    assert_eq!(a.discoveries.len(), 1);
    assert_eq!(b.discoveries.len(), 1);

    let mut files = delivered_files(&h.transport, USER);
    files.sort_by(|x, y| x.2.cmp(&y.2));
    assert_eq!(files.len(), 2);
    for (name, caption, _) in &files {
        assert_eq!(name, "scan_results.txt");
        assert_eq!(caption, "Scan complete\nFound 1 open ports");
    }
    assert_eq!(files[0].2, "10.0.0.1:22\n");
    assert_eq!(files[1].2, "10.0.0.1:80\n");

    assert_eq!(h.orchestrator.session(USER).active_scans(), 0);
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn cancel_stops_an_endless_engine() {
    let h = harness("while :; do echo \"rate: 0.00-kpps, 0.00% done\"; done\n", |_| {});
    h.orchestrator.accept_upload(USER, b"10.0.0.0/8\n").await.unwrap();
    let run = h.orchestrator.start_scan(USER, "80").await.unwrap().launch();

    let session = h.orchestrator.session(USER);
    wait_until(|| session.running_processes() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel(USER).await);

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation observed")
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.discoveries.is_empty());

    let texts = h.transport.texts(USER);
    assert!(texts.contains(&"Scan cancelled. Sending partial results...".to_string()));
    assert!(texts.contains(&"Scan cancelled. No results to display.".to_string()));
    assert!(!session.cancel_requested());
}

#[tokio::test]
async fn cancel_after_first_discovery_delivers_partial_results() {
    let script = "echo \"Discovered open port 22/tcp on 10.0.0.1\"\n\
                  while :; do echo \"rate: 0.10-kpps\"; sleep 0.05; done\n";
    let h = harness(script, |cfg| cfg.progress_every_lines = 1);
    h.orchestrator
        .accept_upload(USER, b"10.0.0.0/30\n10.0.1.0/30\n")
        .await
        .unwrap();
    let run = h.orchestrator.start_scan(USER, "22").await.unwrap().launch();

    wait_until(|| {
        h.transport
            .texts(USER)
            .iter()
            .any(|t| t.contains("IPs found: 1"))
    })
    .await;
    assert!(h.orchestrator.cancel(USER).await);

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation observed")
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.discoveries.len(), 1);

    let files = delivered_files(&h.transport, USER);
    assert_eq!(files.len(), 1);
    let (name, caption, contents) = &files[0];
    assert_eq!(name, "partial_scan_results.txt");
    assert_eq!(caption, "Scan cancelled.\nFound 1 open ports so far.");
    assert_eq!(contents, "10.0.0.1:22\n");
    assert!(dir_is_empty(&h.orchestrator.config().files_dir));
}

#[tokio::test]
async fn timeout_stops_before_the_next_range_and_keeps_results() {
    let script = format!("{LAST_ARG}sleep 2\necho \"Discovered open port 22/tcp on $range\"\n");
    let h = harness(&script, |cfg| cfg.scan_timeout_secs = 1);
    h.orchestrator
        .accept_upload(USER, b"10.0.0.1\n10.0.0.2\n")
        .await
        .unwrap();
    let report = h.orchestrator.start_scan(USER, "22").await.unwrap().run().await;

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    let found: Vec<String> = report.discoveries.iter().map(ToString::to_string).collect();
    assert_eq!(found, vec!["10.0.0.1:22"]);
    assert!(h
        .transport
        .texts(USER)
        .contains(&"Scan timeout reached. Stopping...".to_string()));
    let (name, caption, _) = &delivered_files(&h.transport, USER)[0];
    assert_eq!(name, "scan_results.txt");
    assert_eq!(caption, "Scan complete\nFound 1 open ports");
}

#[tokio::test]
async fn spawn_failure_fails_the_run_and_cleans_up() {
    let h = harness("true\n", |cfg| {
        cfg.engine.command = vec!["/definitely/not/a/scanner".to_string()];
    });
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n10.0.0.2\n").await.unwrap();
    let report = h.orchestrator.start_scan(USER, "80").await.unwrap().run().await;

    match &report.outcome {
        RunOutcome::Failed(msg) => assert!(msg.starts_with("failed to start scan engine")),
        other => panic!("unexpected outcome {other:?}"),
    }
    let texts = h.transport.texts(USER);
    assert!(texts.iter().any(|t| t.starts_with("Error during scan: failed to start scan engine")));

    let snap = h.orchestrator.session(USER).snapshot();
    assert_eq!(snap.active_scans, 0);
    assert!(snap.input_file.is_none());
}

#[tokio::test]
async fn quiet_engine_reports_no_open_ports() {
    let h = harness("echo one\necho two\necho three\n", |cfg| cfg.progress_every_lines = 1);
    h.orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    let report = h.orchestrator.start_scan(USER, "80").await.unwrap().run().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(delivered_files(&h.transport, USER).is_empty());
    assert_eq!(
        h.transport.texts(USER),
        vec!["Scan complete\nNo open ports found".to_string()]
    );
}

#[tokio::test]
async fn ndjson_engine_output_is_understood() {
    let script = "echo '{\"ip\": \"10.0.0.9\", \"port\": 8080, \"proto\": \"tcp\", \"data\": {\"status\": \"open\"}}'\n";
    let h = harness(script, |cfg| cfg.engine.output = EngineOutput::Ndjson);
    h.orchestrator.accept_upload(USER, b"10.0.0.9\n").await.unwrap();
    let report = h.orchestrator.start_scan(USER, "8080").await.unwrap().run().await;
    assert_eq!(report.discoveries.len(), 1);
    assert_eq!(report.discoveries[0].to_string(), "10.0.0.9:8080");
}

/// Accepts new messages but refuses every edit and file upload.
#[derive(Debug, Default)]
struct GrumpyTransport {
    inner: MemoryTransport,
}

#[async_trait]
impl Transport for GrumpyTransport {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageId, TransportError> {
        self.inner.send_text(user, text).await
    }

    async fn edit_text(&self, _: UserId, _: MessageId, _: &str) -> Result<(), TransportError> {
        Err(TransportError("message is not modified".to_string()))
    }

    async fn send_file(&self, _: UserId, _: &Path, _: &str, _: &str) -> Result<(), TransportError> {
        Err(TransportError("upload refused".to_string()))
    }
}

#[tokio::test]
async fn delivery_failures_never_abort_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("engine.sh");
    std::fs::write(
        &script,
        "i=0\nwhile [ $i -lt 25 ]; do echo \"noise $i\"; i=$((i+1)); done\n\
         echo \"Discovered open port 443/tcp on 10.0.0.1\"\n",
    )
    .unwrap();
    let mut config = Config::default();
    config.files_dir = dir.path().join("files");
    config.engine.command = vec!["sh".to_string(), script.display().to_string()];
    config.progress_every_lines = 1;

    let transport = Arc::new(GrumpyTransport::default());
    let orchestrator = Orchestrator::new(config, transport.clone());
    orchestrator.accept_upload(USER, b"10.0.0.1\n").await.unwrap();
    let report = orchestrator.start_scan(USER, "443").await.unwrap().run().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.discoveries.len(), 1);
    assert_eq!(orchestrator.session(USER).active_scans(), 0);
}
