//! Logging initialization and the rolling file sink.
//!
//! The level is controlled by the `RUST_LOG` environment variable and
//! defaults to `info`:
//!
//! ```bash
//! RUST_LOG=debug etude
//! RUST_LOG=etude_core=debug,warn etude
//! ```
//!
//! With a log directory configured, lines go to `<dir>/YYYY_MM_DD.log`
//! through a bounded queue drained by a background thread. A new file is
//! started each day and every [`MAX_LINES`] lines (`YYYY_MM_DD-<n>.log`).
//! Dropping the [`LogGuard`] returned by [`init_logging_to`] drains the queue
//! and joins the thread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const MAX_LINES: usize = 50_000;

/// Install a stdout subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install a subscriber that writes plain lines into `log`. Keep the guard
/// alive until the process is done logging.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging_to(log: RollingLog) -> LogGuard {
    let guard = LogGuard {
        log: Some(log.clone()),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(log),
        )
        .init();
    guard
}

struct Sink {
    dir: PathBuf,
    file: BufWriter<File>,
    day: NaiveDate,
    lines: usize,
    max_lines: usize,
}

impl Sink {
    fn open(dir: &Path, max_lines: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let day = Local::now().date_naive();
        let file = open_append(&dir.join(file_name(day, 0)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            day,
            lines: 0,
            max_lines,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let today = Local::now().date_naive();
        if today != self.day {
            self.rotate(today, 0)?;
            self.lines = 0;
        } else if self.lines > 0 && self.lines % self.max_lines == 0 {
            self.rotate(today, self.lines / self.max_lines)?;
        }
        self.file.write_all(line)?;
        self.lines += 1;
        Ok(())
    }

    fn rotate(&mut self, day: NaiveDate, part: usize) -> io::Result<()> {
        self.file.flush()?;
        self.file = open_append(&self.dir.join(file_name(day, part)))?;
        self.day = day;
        Ok(())
    }
}

fn file_name(day: NaiveDate, part: usize) -> String {
    let stem = day.format("%Y_%m_%d");
    if part == 0 {
        format!("{stem}.log")
    } else {
        format!("{stem}-{part}.log")
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

struct Inner {
    sink: Mutex<Sink>,
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn sink(&self) -> MutexGuard<'_, Sink> {
        lock(&self.sink)
    }

    fn write_sync(&self, line: &[u8]) {
        let mut sink = self.sink();
        // nowhere left to report a failing log write
        let _ = sink.write_line(line);
        let _ = sink.file.flush();
    }

    fn submit(&self, line: Vec<u8>) {
        let line = match &*lock(&self.queue) {
            Some(tx) => match tx.try_send(line) {
                Ok(()) => return,
                Err(TrySendError::Full(line)) | Err(TrySendError::Disconnected(line)) => line,
            },
            None => line,
        };
        self.write_sync(&line);
    }
}

/// Rolling file sink usable as a `tracing_subscriber` writer.
///
/// With a queue capacity above zero, lines are handed to a background
/// `etude-log` thread; when the queue is full the caller writes the line
/// itself under the sink lock. A capacity of zero writes synchronously, as
/// does every writer after [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct RollingLog {
    inner: Arc<Inner>,
}

impl RollingLog {
    pub fn new(dir: &Path, queue: usize) -> io::Result<Self> {
        Self::with_max_lines(dir, queue, MAX_LINES)
    }

    pub fn with_max_lines(dir: &Path, queue: usize, max_lines: usize) -> io::Result<Self> {
        let sink = Mutex::new(Sink::open(dir, max_lines.max(1))?);

        let inner = Arc::new(Inner {
            sink,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        });
        if queue == 0 {
            return Ok(Self { inner });
        }

        let (tx, rx) = mpsc::sync_channel(queue);
        let weak = Arc::downgrade(&inner);
        let worker = thread::Builder::new()
            .name("etude-log".to_string())
            .spawn(move || flush_loop(rx, weak))?;
        *lock(&inner.queue) = Some(tx);
        *lock(&inner.worker) = Some(worker);
        Ok(Self { inner })
    }

    /// Write one line, bypassing the queue.
    pub fn write_line(&self, line: &[u8]) {
        self.inner.write_sync(line);
    }

    /// Push buffered bytes of the current file to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.sink().file.flush()
    }

    /// Close the queue, wait for the background thread to write out what is
    /// still queued, then flush. Later lines are written synchronously.
    pub fn shutdown(&self) -> io::Result<()> {
        drop(lock(&self.inner.queue).take());
        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                return Err(io::Error::other("log thread panicked"));
            }
        }
        self.flush()
    }
}

/// Drains and joins the background log thread when dropped.
#[must_use = "queued log lines are lost if the guard is dropped early"]
pub struct LogGuard {
    log: Option<RollingLog>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(log) = self.log.take() {
            if let Err(e) = log.shutdown() {
                eprintln!("etude: failed to flush log: {e}");
            }
        }
    }
}

fn flush_loop(rx: Receiver<Vec<u8>>, inner: std::sync::Weak<Inner>) {
    while let Ok(line) = rx.recv() {
        let Some(inner) = inner.upgrade() else { break };
        let mut sink = inner.sink();
        let _ = sink.write_line(&line);
        while let Ok(line) = rx.try_recv() {
            let _ = sink.write_line(&line);
        }
        let _ = sink.file.flush();
    }
}

/// One formatted event; submitted as a single line when dropped.
pub struct LogWriter {
    inner: Arc<Inner>,
    buf: Vec<u8>,
}

impl Write for LogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.inner.submit(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for RollingLog {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: Arc::clone(&self.inner),
            buf: Vec::with_capacity(256),
        }
    }
}
