use downloader_core::{Engine, JobEntry, JobId, JobQueue, JobStatus, QueueError};
use pretty_assertions::assert_eq;

fn entry(id: &str) -> JobEntry {
    JobEntry::submitted(
        JobId::new(id),
        Engine::Rpc,
        "direct_url",
        format!("https://example.com/{id}.mp3"),
        "",
        0,
    )
}

#[test]
fn duplicate_ids_are_rejected() {
    let mut queue = JobQueue::new();
    queue.insert(entry("a")).unwrap();

    let err = queue.insert(entry("a")).unwrap_err();
    assert_eq!(err, QueueError::DuplicateId(JobId::new("a")));
    assert_eq!(queue.len(), 1);
}

#[test]
fn from_history_drops_colliding_ids() {
    let mut first = entry("h");
    first.complete(None).unwrap();
    let mut second = entry("h");
    second.fail("x").unwrap();

    let queue = JobQueue::from_history(vec![first, second]);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.entries()[0].status(), JobStatus::Complete);
}

#[test]
fn live_entries_exclude_terminal_ones() {
    let mut queue = JobQueue::new();
    queue.insert(entry("live")).unwrap();
    let mut done = entry("done");
    done.complete(None).unwrap();
    queue.insert(done).unwrap();

    let live: Vec<String> = queue.live_mut().map(|e| e.id.to_string()).collect();
    assert_eq!(live, vec!["live".to_string()]);
    assert!(queue.has_live());
    assert_eq!(queue.terminal_entries().len(), 1);
}

#[test]
fn clear_finished_keeps_live_entries() {
    let mut queue = JobQueue::new();
    queue.insert(entry("a")).unwrap();
    let mut b = entry("b");
    b.fail("nope").unwrap();
    queue.insert(b).unwrap();
    let mut c = entry("c");
    c.complete(None).unwrap();
    queue.insert(c).unwrap();

    assert_eq!(queue.clear_finished(), 2);
    assert_eq!(queue.len(), 1);
    assert!(queue.contains(&JobId::new("a")));
}

#[test]
fn interrupt_live_fails_only_live_entries() {
    let mut queue = JobQueue::new();
    queue.insert(entry("queued")).unwrap();
    let mut paused = entry("paused");
    paused.advance(JobStatus::Paused).unwrap();
    queue.insert(paused).unwrap();
    let mut done = entry("done");
    done.complete(None).unwrap();
    queue.insert(done).unwrap();

    let interrupted = queue.interrupt_live("Interrupted (host shut down)").unwrap();
    assert_eq!(interrupted, vec![JobId::new("queued"), JobId::new("paused")]);
    assert!(!queue.has_live());

    let done = queue.get(&JobId::new("done")).unwrap();
    assert_eq!(done.status(), JobStatus::Complete);
    assert!(done.error_message.is_empty());
    let paused = queue.get(&JobId::new("paused")).unwrap();
    assert_eq!(paused.error_message, "Interrupted (host shut down)");
}

#[test]
fn remove_returns_the_entry() {
    let mut queue = JobQueue::new();
    queue.insert(entry("a")).unwrap();
    assert_eq!(queue.remove(&JobId::new("a")).map(|e| e.id), Some(JobId::new("a")));
    assert!(queue.remove(&JobId::new("a")).is_none());
    assert!(queue.is_empty());
}
