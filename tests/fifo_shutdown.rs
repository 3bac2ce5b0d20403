#![cfg(unix)]

use log_shim::input::open_path;
use log_shim::options::FileOptions;
use log_shim::{Config, FileDestination, Pipeline, PipelineState, Source};
use std::io::Write;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn runtime_exits_while_the_container_still_holds_the_pipe() {
    let dir = TempDir::new().unwrap();
    let fifo = dir.path().join("stdout");
    let status = std::process::Command::new("mkfifo")
        .arg(&fifo)
        .status()
        .unwrap();
    assert!(status.success());
    let output = dir.path().join("out.log");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let (report, state, writer) = runtime.block_on(async {
        let reader = open_path(&fifo).await.unwrap();
        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();
        writer.write_all(b"hello\n").unwrap();

        let destination = FileDestination::new(FileOptions {
            path: output.clone(),
        })
        .unwrap();
        let pipeline = Pipeline::new(Config::default(), destination)
            .unwrap()
            .with_source(Source::Stdout, reader);
        let state = pipeline.state();

        let report = pipeline
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        (report, state, writer)
    });

    assert_eq!(*state.borrow(), PipelineState::Stopped);
    assert_eq!(report.stats.records_forwarded, 1);
    assert_eq!(report.stats.delivery.records_delivered, 1);

    // The writer is still open, so a read parked on the blocking pool would
    // keep the runtime from shutting down
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        drop(runtime);
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "runtime shutdown blocked on the open pipe"
    );
    drop(writer);

    let contents = std::fs::read_to_string(&output).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"message\":\"hello\""));
}
