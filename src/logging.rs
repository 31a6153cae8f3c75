//! Process-wide logging setup.
//!
//! Every line reads `[YYYY-mm-dd HH:MM:SS] [pid-tid] [LEVEL] message`, in
//! local time with the OS thread id. Events are split by severity into three
//! file sinks:
//!
//! | sink           | levels       | source location |
//! |----------------|--------------|-----------------|
//! | `trace_debug`  | TRACE, DEBUG | yes             |
//! | `info_warning` | INFO, WARN   | no              |
//! | `error_fatal`  | ERROR        | no              |
//!
//! Each sink appends to `<dir>/echo_server.<sink>.<YYYYmmdd.HHMM>.<n>.log`,
//! rotates at 1 GiB, and moves rotated files into `<dir>/<sink>/`, which is
//! pruned oldest first to stay under 20 GiB. Backend failures never stop the
//! server: they are reported once on stderr and the sink retries on the next
//! event.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self as tfmt, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Active file size that triggers a rotation.
pub const ROTATION_SIZE: u64 = 1024 * 1024 * 1024;

/// Total size allowed for one sink's rotated files.
pub const ARCHIVE_LIMIT: u64 = 20 * 1024 * 1024 * 1024;

const FILE_PREFIX: &str = "echo_server";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the level; otherwise INFO and above are kept, or
/// everything with `debug`.
pub fn init(debug: bool, dir: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "trace" } else { "info" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(sink_layer(dir, Sink::TraceDebug))
        .with(sink_layer(dir, Sink::InfoWarning))
        .with(sink_layer(dir, Sink::ErrorFatal))
        .init();
}

fn sink_layer<S>(dir: &Path, sink: Sink) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tfmt::layer()
        .with_writer(RotatingFile::new(dir, sink))
        .with_ansi(false)
        .event_format(LineFormat {
            location: sink.with_location(),
        })
        .with_filter(filter_fn(move |meta| sink.accepts(meta.level())))
}

/// Severity-routed log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    TraceDebug,
    InfoWarning,
    ErrorFatal,
}

impl Sink {
    pub fn name(&self) -> &'static str {
        match self {
            Sink::TraceDebug => "trace_debug",
            Sink::InfoWarning => "info_warning",
            Sink::ErrorFatal => "error_fatal",
        }
    }

    pub fn accepts(&self, level: &Level) -> bool {
        match self {
            Sink::TraceDebug => *level == Level::TRACE || *level == Level::DEBUG,
            Sink::InfoWarning => *level == Level::INFO || *level == Level::WARN,
            Sink::ErrorFatal => *level == Level::ERROR,
        }
    }

    fn with_location(&self) -> bool {
        matches!(self, Sink::TraceDebug)
    }
}

/// `[time] [pid-tid] [LEVEL] file:line message fields`.
struct LineFormat {
    location: bool,
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "[{}] [{}-{}] [{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id(),
            os_thread_id(),
            meta.level()
        )?;
        if self.location {
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                write!(writer, "{}:{} ", file, line)?;
            }
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn os_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
fn os_thread_id() -> u64 {
    0
}

/// Size-rotated, append-only log file for one sink.
#[derive(Clone)]
pub struct RotatingFile {
    state: Arc<Mutex<FileState>>,
}

struct FileState {
    dir: PathBuf,
    sink: Sink,
    rotation_size: u64,
    archive_limit: u64,
    file: Option<(File, PathBuf)>,
    written: u64,
    next_seq: u64,
    failing: bool,
}

impl RotatingFile {
    pub fn new(dir: &Path, sink: Sink) -> Self {
        Self::with_limits(dir, sink, ROTATION_SIZE, ARCHIVE_LIMIT)
    }

    pub fn with_limits(dir: &Path, sink: Sink, rotation_size: u64, archive_limit: u64) -> Self {
        let next_seq = scan_next_seq(dir, sink);
        Self {
            state: Arc::new(Mutex::new(FileState {
                dir: dir.to_path_buf(),
                sink,
                rotation_size,
                archive_limit,
                file: None,
                written: 0,
                next_seq,
                failing: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if let Err(e) = state.write_line(buf) {
            state.report(&e);
        }
        // A failed backend drops the line instead of failing the caller.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.lock().file {
            Some((file, _)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl FileState {
    fn write_line(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.file.is_some() && self.written + buf.len() as u64 > self.rotation_size {
            self.rotate()?;
        }
        if self.file.is_none() {
            self.open()?;
        }
        if let Some((file, _)) = &mut self.file {
            file.write_all(buf)?;
            file.flush()?;
            self.written += buf.len() as u64;
        }
        self.failing = false;
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}.{}.{}.{}.log",
            FILE_PREFIX,
            self.sink.name(),
            Local::now().format("%Y%m%d.%H%M"),
            self.next_seq
        );
        let path = self.dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.written = file.metadata()?.len();
        self.next_seq += 1;
        self.file = Some((file, path));
        Ok(())
    }

    /// Move the active file into the archive and prune it.
    fn rotate(&mut self) -> io::Result<()> {
        let Some((file, path)) = self.file.take() else {
            return Ok(());
        };
        drop(file);
        self.written = 0;

        let archive = self.archive_dir();
        fs::create_dir_all(&archive)?;
        if let Some(name) = path.file_name() {
            fs::rename(&path, archive.join(name))?;
        }
        prune(&archive, self.archive_limit)
    }

    fn archive_dir(&self) -> PathBuf {
        self.dir.join(self.sink.name())
    }

    fn report(&mut self, err: &io::Error) {
        if !self.failing {
            eprintln!(
                "log sink '{}' in {} unavailable: {}",
                self.sink.name(),
                self.dir.display(),
                err
            );
            self.failing = true;
        }
        self.file = None;
    }
}

/// Delete the oldest files in `dir` until their total size fits `limit`.
fn prune(dir: &Path, limit: u64) -> io::Result<()> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            files.push((meta.modified()?, meta.len(), entry.path()));
        }
    }
    files.sort();

    let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
    for (_, len, path) in files {
        if total <= limit {
            break;
        }
        fs::remove_file(&path)?;
        total -= len;
    }
    Ok(())
}

/// Sequence number following the highest one already on disk for `sink`.
fn scan_next_seq(dir: &Path, sink: Sink) -> u64 {
    let prefix = format!("{}.{}.", FILE_PREFIX, sink.name());
    [dir.to_path_buf(), dir.join(sink.name())]
        .iter()
        .filter_map(|d| fs::read_dir(d).ok())
        .flat_map(|entries| entries.filter_map(Result::ok))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| parse_seq(&name, &prefix))
        .max()
        .map_or(0, |seq| seq + 1)
}

fn parse_seq(name: &str, prefix: &str) -> Option<u64> {
    let stem = name.strip_prefix(prefix)?.strip_suffix(".log")?;
    stem.rsplit('.').next()?.parse().ok()
}
