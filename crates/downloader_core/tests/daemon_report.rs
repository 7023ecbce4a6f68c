use downloader_core::{apply_daemon_report, DaemonReport, Engine, JobEntry, JobId, JobStatus};
use pretty_assertions::assert_eq;

fn queued() -> JobEntry {
    JobEntry::submitted(
        JobId::new("gid1"),
        Engine::Rpc,
        "direct_url",
        "https://example.com/a.flac",
        "a.flac",
        0,
    )
}

fn report(state: &str) -> DaemonReport {
    DaemonReport {
        state: state.to_string(),
        total_length: 1000,
        completed_length: 250,
        download_speed: 512,
        error_message: String::new(),
        files: vec!["/downloads/a.flac".to_string()],
    }
}

#[test]
fn active_report_updates_progress_and_file() {
    let mut entry = queued();
    let status = apply_daemon_report(&mut entry, &report("active")).unwrap();

    assert_eq!(status, JobStatus::Active);
    assert_eq!(entry.progress(), 25.0);
    assert_eq!(entry.speed, 512);
    assert_eq!(entry.total_size, 1000);
    assert_eq!(entry.title, "a.flac");
    assert!(entry.output_path.ends_with("a.flac"));
}

#[test]
fn unknown_total_means_zero_progress() {
    let mut entry = queued();
    let mut waiting = report("waiting");
    waiting.total_length = 0;
    waiting.completed_length = 0;
    waiting.files.clear();

    apply_daemon_report(&mut entry, &waiting).unwrap();
    assert_eq!(entry.progress(), 0.0);
    assert_eq!(entry.status(), JobStatus::Active);
    assert_eq!(entry.title, "a.flac");
}

#[test]
fn queued_entry_can_complete_in_one_report() {
    let mut entry = queued();
    let mut done = report("complete");
    done.completed_length = 1000;

    assert_eq!(apply_daemon_report(&mut entry, &done).unwrap(), JobStatus::Complete);
    assert_eq!(entry.progress(), 100.0);
    assert_eq!(entry.speed, 0);
}

#[test]
fn paused_report_stops_rate() {
    let mut entry = queued();
    apply_daemon_report(&mut entry, &report("paused")).unwrap();
    assert_eq!(entry.status(), JobStatus::Paused);
    assert_eq!(entry.speed, 0);

    apply_daemon_report(&mut entry, &report("active")).unwrap();
    assert_eq!(entry.status(), JobStatus::Active);
}

#[test]
fn error_report_carries_daemon_message() {
    let mut entry = queued();
    let mut failed = report("error");
    failed.error_message = "Resource not found".to_string();

    apply_daemon_report(&mut entry, &failed).unwrap();
    assert_eq!(entry.status(), JobStatus::Error);
    assert_eq!(entry.error_message, "Resource not found");
}

#[test]
fn terminal_entries_ignore_reports() {
    let mut entry = queued();
    entry.fail("Cancelled").unwrap();
    let status = apply_daemon_report(&mut entry, &report("active")).unwrap();
    assert_eq!(status, JobStatus::Error);
    assert_eq!(entry.progress(), 0.0);
}
