//! Start/stop/flush behaviour of event streams over the emulated service

mod common;

use common::{collect_items, emulated_stream, path_of, CREATED_FILE, TIMEOUT};
use fsevents_watcher::dispatch::registry;
use fsevents_watcher::{
    CreateFlags, EmulatedService, Error, EventFlags, EventStream, NativeService, Status, StreamConfig,
    MAX_WATCHED_PATHS,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_start_delivers_recorded_changes() {
    let temp_dir = TempDir::new().unwrap();
    let (service, stream) =
        emulated_stream(temp_dir.path(), |c| c.with_flags(CreateFlags::FILE_EVENTS));
    let rx = stream.events();

    stream.start().unwrap();
    assert_eq!(stream.status(), Status::Started);

    let id = service.record(temp_dir.path().join("a.txt"), CREATED_FILE);
    let events = collect_items(&rx, 1);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, path_of(temp_dir.path(), "a.txt"));
    assert_eq!(events[0].flags, CREATED_FILE);
    assert_eq!(events[0].id, id);
    assert_eq!(stream.event_id(), id);
    assert_eq!(stream.latest_event_id(), id);

    stream.stop();
}

#[test]
fn test_changes_outside_the_watch_are_not_reported() {
    let temp_dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let (service, stream) =
        emulated_stream(temp_dir.path(), |c| c.with_flags(CreateFlags::FILE_EVENTS));
    let rx = stream.events();
    stream.start().unwrap();

    service.record(other.path().join("x"), CREATED_FILE);
    service.record(temp_dir.path().join("y"), CREATED_FILE);

    let events = collect_items(&rx, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, path_of(temp_dir.path(), "y"));
    stream.stop();
}

#[test]
fn test_directory_level_stream_reports_parent() {
    let temp_dir = TempDir::new().unwrap();
    let (service, stream) = emulated_stream(temp_dir.path(), |c| c);
    let rx = stream.events();
    stream.start().unwrap();

    service.record(temp_dir.path().join("sub").join("f"), CREATED_FILE);

    let events = collect_items(&rx, 1);
    assert_eq!(events[0].path, path_of(temp_dir.path(), "sub"));
    assert!(!events[0].flags.has(EventFlags::ITEM_CREATED));
    stream.stop();
}

#[test]
fn test_stop_is_idempotent_and_closes_the_channel() {
    let temp_dir = TempDir::new().unwrap();
    let (_service, stream) = emulated_stream(temp_dir.path(), |c| c);

    // Never started
    stream.stop();
    assert_eq!(stream.status(), Status::Idle);

    let rx = stream.events();
    stream.start().unwrap();
    let handle = stream.handle().unwrap();
    assert!(registry().contains(handle));

    stream.stop();
    stream.stop();

    assert_eq!(stream.status(), Status::Stopped);
    assert!(stream.handle().is_none());
    assert!(!registry().contains(handle));
    assert!(rx.recv_timeout(TIMEOUT).is_err());
}

#[test]
fn test_state_errors() {
    let temp_dir = TempDir::new().unwrap();
    let (_service, stream) = emulated_stream(temp_dir.path(), |c| c);

    assert!(matches!(stream.resume(), Err(Error::NotStopped)));

    stream.start().unwrap();
    assert!(matches!(stream.start(), Err(Error::AlreadyStarted)));
    assert!(matches!(stream.resume(), Err(Error::NotStopped)));

    stream.stop();
    stream.resume().unwrap();
    assert_eq!(stream.status(), Status::Started);
    stream.stop();
}

#[test]
fn test_watch_limit_leaves_no_handle() {
    let service = Arc::new(EmulatedService::new());
    let paths: Vec<String> = (0..=MAX_WATCHED_PATHS)
        .map(|i| format!("/tmp/fsevents-limit/{}", i))
        .collect();
    let stream = EventStream::new(StreamConfig::new(paths), service.clone());

    match stream.start() {
        Err(Error::WatchLimitExceeded { requested, limit }) => {
            assert_eq!(requested, MAX_WATCHED_PATHS + 1);
            assert_eq!(limit, MAX_WATCHED_PATHS);
        }
        other => panic!("expected WatchLimitExceeded, got {:?}", other),
    }
    assert_eq!(service.opened_count(), 0);
    assert_eq!(stream.status(), Status::Idle);
    assert!(stream.handle().is_none());
}

#[test]
fn test_native_rejection_leaves_no_handle() {
    let service = Arc::new(EmulatedService::with_capacity(3));

    let first = EventStream::new(StreamConfig::new(["/tmp/cap/a", "/tmp/cap/b"]), service.clone());
    first.start().unwrap();

    let second = EventStream::new(StreamConfig::new(["/tmp/cap/c", "/tmp/cap/d"]), service.clone());
    let err = second.start().unwrap_err();
    assert!(err.is_watch_limit(), "unexpected error: {}", err);
    assert_eq!(second.status(), Status::Idle);
    assert!(second.handle().is_none());

    assert_eq!(service.opened_count(), 2);
    let rejected = service.last_opened().unwrap();
    assert_ne!(first.handle(), Some(rejected));
    assert!(registry().contains(first.handle().unwrap()));
    assert!(!registry().contains(rejected));

    // Capacity frees up once the first stream stops
    first.stop();
    second.start().unwrap();
    second.stop();
}

#[test]
fn test_no_valid_paths() {
    let service = Arc::new(EmulatedService::new());
    let stream = EventStream::new(StreamConfig::new([""]), service.clone());

    assert!(matches!(stream.start(), Err(Error::NoPaths)));
    let errors = stream.take_path_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::PathResolution { .. }));
    assert_eq!(service.opened_count(), 0);
}

#[test]
fn test_failed_start_keeps_the_checkpoint() {
    let service = Arc::new(EmulatedService::with_capacity(1));
    service.record("/tmp/keep/x", CREATED_FILE);
    service.record("/tmp/keep/y", CREATED_FILE);

    let holder = EventStream::new(StreamConfig::new(["/tmp/keep/a"]), service.clone());
    holder.start().unwrap();

    let stream = EventStream::new(StreamConfig::new(["/tmp/keep/b"]), service.clone());
    stream.set_event_id(1);
    assert!(stream.start().unwrap_err().is_watch_limit());
    assert_eq!(stream.event_id(), 1);

    holder.stop();
    stream.start().unwrap();
    assert_eq!(stream.event_id(), service.current_event_id());
    stream.stop();
}

#[test]
fn test_bad_paths_are_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().to_string_lossy().into_owned();
    let service = Arc::new(EmulatedService::new());
    let stream = EventStream::new(
        StreamConfig::new([root.clone(), "bad\0path".to_string(), root.clone()]),
        service,
    );

    stream.start().unwrap();
    assert_eq!(stream.paths(), vec![root]);
    assert_eq!(stream.take_path_errors().len(), 1);
    assert!(stream.take_path_errors().is_empty());
    stream.stop();
}

#[test]
fn test_flush_sync_delivers_held_events() {
    let temp_dir = TempDir::new().unwrap();
    let (service, stream) = emulated_stream(temp_dir.path(), |c| {
        c.with_flags(CreateFlags::FILE_EVENTS)
            .with_latency(Duration::from_secs(30))
    });
    let rx = stream.events();
    stream.start().unwrap();

    service.record(temp_dir.path().join("a"), CREATED_FILE);
    service.record(temp_dir.path().join("a"), EventFlags::ITEM_MODIFIED | EventFlags::ITEM_IS_FILE);

    // Held for the latency window
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let consumer = thread::spawn(move || rx.recv_timeout(TIMEOUT));
    stream.flush(true);
    let batch = consumer.join().unwrap().unwrap();

    // Coalesced into one record per path
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].flags, CREATED_FILE | EventFlags::ITEM_MODIFIED);
    stream.stop();
}

#[test]
fn test_flush_on_idle_stream_is_a_noop() {
    let temp_dir = TempDir::new().unwrap();
    let (_service, stream) = emulated_stream(temp_dir.path(), |c| c);
    stream.flush(true);
    stream.flush(false);
    assert_eq!(stream.status(), Status::Idle);
}

#[test]
fn test_stop_unblocks_pending_delivery() {
    let temp_dir = TempDir::new().unwrap();
    let (service, stream) =
        emulated_stream(temp_dir.path(), |c| c.with_flags(CreateFlags::FILE_EVENTS));
    let _rx = stream.events();
    stream.start().unwrap();

    // Nobody receives; the loop thread blocks handing this over
    service.record(temp_dir.path().join("a"), CREATED_FILE);
    thread::sleep(Duration::from_millis(100));

    stream.stop();
    assert_eq!(stream.status(), Status::Stopped);
}

#[test]
fn test_drop_stops_a_started_stream() {
    let temp_dir = TempDir::new().unwrap();
    let (service, stream) = emulated_stream(temp_dir.path(), |c| c);
    stream.start().unwrap();
    let handle = stream.handle().unwrap();

    drop(stream);

    assert!(!registry().contains(handle));
    assert_eq!(service.active_paths(), 0);
}

#[test]
fn test_streams_on_one_service_are_independent() {
    let temp_dir = TempDir::new().unwrap();
    let service = Arc::new(EmulatedService::new());
    let config = StreamConfig::new([temp_dir.path().to_string_lossy()])
        .with_flags(CreateFlags::FILE_EVENTS);

    let first = EventStream::new(config.clone(), service.clone());
    let second = EventStream::new(config, service.clone());
    let (rx1, rx2) = (first.events(), second.events());
    first.start().unwrap();
    second.start().unwrap();
    assert_ne!(first.handle(), second.handle());

    service.record(temp_dir.path().join("shared"), CREATED_FILE);
    assert_eq!(collect_items(&rx1, 1).len(), 1);
    assert_eq!(collect_items(&rx2, 1).len(), 1);

    first.stop();
    service.record(temp_dir.path().join("later"), CREATED_FILE);
    let events = collect_items(&rx2, 1);
    assert_eq!(events[0].path, common::path_of(temp_dir.path(), "later"));
    second.stop();
}
