use std::io::Write;
use std::path::Path;
use std::time::Duration;

use linetrack::{channel, Config, StatusLedger, Tailer};
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TIMEOUT_5_SEC: Duration = Duration::from_secs(5);

fn config(logdir: &Path, status_file: &Path) -> Config {
    Config::new(logdir.to_str().unwrap())
        .with_file_pattern("*.log")
        .with_status_file(status_file)
        .with_idle_pause(Duration::from_millis(10))
}

async fn wait_for_offset(ledger: &StatusLedger, path: &Path, offset: u64) {
    timeout(TIMEOUT_5_SEC, async {
        while ledger.last_offset(path) != offset {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
pub async fn test_restart_resumes_from_ledger() {
    let statedir = tempdir().unwrap();
    let status_file = statedir.path().join("status");
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().canonicalize().unwrap().join("foo.log");
    std::fs::write(&logfile, b"foo\nbar\n").unwrap();

    // First run reads everything that is there.
    let tailer = Tailer::new(config(logdir.path(), &status_file)).unwrap();
    let ledger = tailer.ledger();
    let (sink, mut lines) = channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(tailer.run(sink, async move {
        let _ = stop_rx.await;
    }));

    for expected in ["foo", "bar"] {
        let line = timeout(TIMEOUT_5_SEC, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.source(), logfile.as_path());
        assert_eq!(line.line(), expected);
    }
    wait_for_offset(&ledger, &logfile, 8).await;

    stop_tx.send(()).unwrap();
    timeout(TIMEOUT_5_SEC, run).await.unwrap().unwrap().unwrap();

    let contents = std::fs::read_to_string(&status_file).unwrap();
    let fields = contents.trim_end().split('\t').collect::<Vec<_>>();
    assert_eq!(fields.len(), 4);
    assert_eq!(fields[2], logfile.to_str().unwrap());
    assert_eq!(fields[3], "8");

    // More lines arrive while nobody is watching.
    let mut file = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
    file.write_all(b"baz\n").unwrap();
    drop(file);

    // Second run only sees what is new.
    let tailer = Tailer::new(config(logdir.path(), &status_file)).unwrap();
    let ledger = tailer.ledger();
    assert_eq!(ledger.last_offset(&logfile), 8);
    let (sink, mut lines) = channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(tailer.run(sink, async move {
        let _ = stop_rx.await;
    }));

    let line = timeout(TIMEOUT_5_SEC, lines.next_line()).await.unwrap().unwrap();
    assert_eq!(line.line(), "baz");
    wait_for_offset(&ledger, &logfile, 12).await;

    stop_tx.send(()).unwrap();
    timeout(TIMEOUT_5_SEC, run).await.unwrap().unwrap().unwrap();
    assert!(timeout(Duration::from_millis(100), lines.next_line())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
pub async fn test_corrupt_ledger_is_fatal() {
    let statedir = tempdir().unwrap();
    let status_file = statedir.path().join("status");
    std::fs::write(&status_file, "not\ta\tvalid\tline\n").unwrap();
    let logdir = tempdir().unwrap();

    let err = Tailer::new(config(logdir.path(), &status_file)).unwrap_err();
    assert!(matches!(err, linetrack::Error::Ledger { .. }));
}
