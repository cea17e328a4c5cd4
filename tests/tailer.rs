use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use file_tailer::{
    Fingerprinter, InitialPosition, JsonPositionStore, MemoryPositionStore, PositionStore,
    TailerBuilder, TailerHandle, TailerListener,
};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Event {
    Line(String),
    NotFound,
    Rotated,
    Error(String),
}

struct ChannelListener {
    events: Sender<Event>,
}

impl TailerListener for ChannelListener {
    fn line(&mut self, line: &[u8]) {
        let _ = self
            .events
            .send(Event::Line(String::from_utf8_lossy(line).into_owned()));
    }

    fn file_not_found(&mut self) {
        let _ = self.events.send(Event::NotFound);
    }

    fn file_rotated(&mut self) {
        let _ = self.events.send(Event::Rotated);
    }

    fn error(&mut self, error: &io::Error) {
        let _ = self.events.send(Event::Error(error.to_string()));
    }
}

fn start_tailer(
    path: &Path,
    store: Arc<dyn PositionStore>,
    fingerprint_bytes: usize,
    initial_position: InitialPosition,
) -> (TailerHandle, Receiver<Event>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let tailer = TailerBuilder::new()
        .file(path)
        .position_store(store)
        .listener(ChannelListener { events: tx })
        .read_interval(Duration::from_millis(20))
        .initial_position(initial_position)
        .fingerprint_bytes(fingerprint_bytes)
        .build()
        .unwrap();
    let handle = tailer.handle().clone();
    let join = thread::spawn(move || tailer.run());
    (handle, rx, join)
}

/// Next event, skipping the not-found notifications that repeat while a
/// path is briefly absent.
fn next_interesting(rx: &Receiver<Event>) -> Event {
    loop {
        match rx.recv_timeout(TIMEOUT) {
            Ok(Event::NotFound) => continue,
            Ok(event) => return event,
            Err(err) => panic!("timed out waiting for an event: {err}"),
        }
    }
}

fn expect_line(rx: &Receiver<Event>, expected: &str) {
    match next_interesting(rx) {
        Event::Line(line) => assert_eq!(line, expected),
        other => panic!("expected line {expected:?}, got {other:?}"),
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within deadline");
}

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn plain_append() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"a\nb\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store.clone(), 4, InitialPosition::Beginning);

    expect_line(&rx, "a");
    expect_line(&rx, "b");

    let fingerprint = Fingerprinter::new(4).fingerprint(&path).unwrap().unwrap();
    wait_for(|| store.get(&fingerprint) == Some(4));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn crlf_and_bare_cr_separators() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"x\r\ny\rz\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store, 512, InitialPosition::Beginning);

    expect_line(&rx, "x");
    expect_line(&rx, "y");
    expect_line(&rx, "z");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn rename_recreate_rotation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"old1\nold2\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store.clone(), 5, InitialPosition::Beginning);

    expect_line(&rx, "old1");
    expect_line(&rx, "old2");

    fs::rename(&path, dir.path().join("app.log.1")).unwrap();
    fs::write(&path, b"new1\n").unwrap();

    assert_eq!(next_interesting(&rx), Event::Rotated);
    expect_line(&rx, "new1");

    // The store is now keyed by the replacement's fingerprint.
    let fingerprint = Fingerprinter::new(5).fingerprint(&path).unwrap().unwrap();
    wait_for(|| store.get(&fingerprint) == Some(5));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn same_length_rotation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"AAAAA\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store.clone(), 6, InitialPosition::Beginning);

    expect_line(&rx, "AAAAA");
    let old_fingerprint = Fingerprinter::new(6).fingerprint(&path).unwrap().unwrap();
    wait_for(|| store.get(&old_fingerprint) == Some(6));

    // Atomically replace with equally long content carrying a later
    // modification time.
    thread::sleep(Duration::from_millis(50));
    let staged = dir.path().join("app.log.new");
    fs::write(&staged, b"BBBBB\n").unwrap();
    fs::rename(&staged, &path).unwrap();

    assert_eq!(next_interesting(&rx), Event::Rotated);
    expect_line(&rx, "BBBBB");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn missing_file_at_start() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store, 512, InitialPosition::Beginning);

    // The very first open attempt fails, so a not-found notification lands
    // within one trigger interval.
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::NotFound);

    fs::write(&path, b"hello\n").unwrap();
    assert_eq!(next_interesting(&rx), Event::Line("hello".into()));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn restart_resumes_from_checkpoint() {
    let dir = tempdir().unwrap();
    let data_dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"line1\n").unwrap();

    let fingerprint = Fingerprinter::new(6).fingerprint(&path).unwrap().unwrap();

    // First session consumes and checkpoints line1, then stops.
    {
        let store = Arc::new(JsonPositionStore::open(data_dir.path()).unwrap());
        let (handle, rx, join) =
            start_tailer(&path, store.clone(), 6, InitialPosition::Beginning);
        expect_line(&rx, "line1");
        wait_for(|| store.get(&fingerprint) == Some(6));
        handle.stop();
        join.join().unwrap();
    }

    append(&path, b"line2\n");

    // A fresh instance against the same path and store picks up after the
    // checkpoint: line1 is never replayed.
    {
        let store = Arc::new(JsonPositionStore::open(data_dir.path()).unwrap());
        assert_eq!(store.get(&fingerprint), Some(6));

        let (handle, rx, join) =
            start_tailer(&path, store.clone(), 6, InitialPosition::Beginning);
        expect_line(&rx, "line2");
        wait_for(|| store.get(&fingerprint) == Some(12));
        handle.stop();
        join.join().unwrap();

        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, Event::Line("line1".into()));
        }
    }
}

#[test]
fn initial_position_end_skips_existing_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"skipped\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store, 512, InitialPosition::End);

    // Give the tailer time to seat itself at the end before appending.
    thread::sleep(Duration::from_millis(200));
    append(&path, b"fresh\n");

    assert_eq!(next_interesting(&rx), Event::Line("fresh".into()));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn stop_terminates_promptly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"x\n").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store, 512, InitialPosition::Beginning);
    expect_line(&rx, "x");

    handle.stop();
    join.join().unwrap();
    assert!(!handle.is_running());
}

#[test]
fn lines_are_delivered_in_order_as_the_file_grows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"").unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    let (handle, rx, join) = start_tailer(&path, store, 512, InitialPosition::Beginning);

    let n = 25;
    for i in 0..n {
        append(&path, format!("hello {}\n", i).as_bytes());
    }

    for i in 0..n {
        expect_line(&rx, &format!("hello {}", i));
    }

    handle.stop();
    join.join().unwrap();
}
