use std::fs;

use downloader_engine::{ensure_output_dir, AtomicFileWriter, PersistError};
use tempfile::TempDir;

#[test]
fn creates_missing_output_dir() {
    let temp = TempDir::new().unwrap();
    let new_dir = temp.path().join("music").join("incoming");
    assert!(!new_dir.exists());
    ensure_output_dir(&new_dir).unwrap();
    assert!(new_dir.is_dir());
}

#[test]
fn atomic_write_replaces_existing_content() {
    let temp = TempDir::new().unwrap();
    let writer = AtomicFileWriter::new(temp.path().to_path_buf());

    let first = writer.write("history.ron", "old").unwrap();
    let second = writer.write("history.ron", b"new".as_slice()).unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read_to_string(&second).unwrap(), "new");

    let leftovers = fs::read_dir(temp.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[test]
fn for_target_splits_directory_and_name() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("state").join("history.ron");

    let (writer, filename) = AtomicFileWriter::for_target(&target).unwrap();
    assert_eq!(filename, "history.ron");
    assert_eq!(writer.write(&filename, "x").unwrap(), target);
}

#[test]
fn no_partial_file_when_directory_is_a_file() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("not_a_dir");
    fs::write(&file_path, "x").unwrap();

    let writer = AtomicFileWriter::new(file_path.clone());
    let result = writer.write("history.ron", "data");
    assert!(matches!(result, Err(PersistError::OutputDir(_))));
    assert!(!file_path.with_file_name("history.ron").exists());
}
