use core::{fmt, str::FromStr};

use alloc::{boxed::Box, string::String};
use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

use crate::{config::env_value, platform::FileWriter};

pub const LOG_LEVEL_ENV: &str = "TLSBOOT_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Install the logger, with the level taken from `TLSBOOT_LOG_LEVEL` in `envp`. Records are
/// tagged with the file name of `program`, usually `argv[0]`.
///
/// Must only run once the thread pointer is installed: `log` itself is TLS free, but the
/// endpoint lock and allocations are not meant for the pre-TLS window.
pub fn init<'a, I>(program: Option<&str>, envp: I)
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut logger = TlsLogger::new();
    if let Some(program) = program {
        logger = logger.with_process_name(String::from(program_name(program)));
    }
    if let Some(level) = level_from_env(envp) {
        logger = logger.with_output(OutputBuilder::stderr().with_filter(level).build());
    }
    if logger.enable().is_err() {
        log::debug!("logger already initialized");
    }
}

/// The last path component of `path`.
pub fn program_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn level_from_env<'a, I>(envp: I) -> Option<LevelFilter>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let raw = env_value(envp, LOG_LEVEL_ENV)?;
    LevelFilter::from_str(core::str::from_utf8(raw).ok()?).ok()
}

/// An output that will be logged to, usually stderr.
pub struct Output {
    endpoint: Mutex<Box<dyn fmt::Write + Send + 'static>>,
    filter: LevelFilter,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Output")
            .field("endpoint", &"opaque")
            .field("filter", &self.filter)
            .finish()
    }
}

impl Default for Output {
    fn default() -> Self {
        OutputBuilder::stderr().build()
    }
}

pub struct OutputBuilder {
    endpoint: Box<dyn fmt::Write + Send + 'static>,
    filter: Option<LevelFilter>,
}
impl OutputBuilder {
    pub fn stderr() -> Self {
        Self::with_endpoint(FileWriter::new(crate::platform::STDERR_FILENO))
    }

    pub fn with_endpoint<T>(endpoint: T) -> Self
    where
        T: fmt::Write + Send + 'static,
    {
        Self {
            endpoint: Box::new(endpoint),
            filter: None,
        }
    }
    pub fn with_filter(mut self, filter: LevelFilter) -> Self {
        self.filter = Some(filter);
        self
    }
    pub fn build(self) -> Output {
        Output {
            endpoint: Mutex::new(self.endpoint),
            filter: self.filter.unwrap_or(DEFAULT_LOG_LEVEL),
        }
    }
}

#[derive(Debug, Default)]
pub struct TlsLogger {
    output: Output,
    process_name: Option<String>,
}

impl TlsLogger {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }
    pub fn with_process_name(mut self, name: String) -> Self {
        self.process_name = Some(name);
        self
    }
    pub fn filter(&self) -> LevelFilter {
        self.output.filter
    }
    pub fn enable(self) -> Result<&'static Self, log::SetLoggerError> {
        let leak = Box::leak(Box::new(self));
        log::set_logger(leak)?;
        log::set_max_level(leak.output.filter);
        Ok(leak)
    }
    fn write_record<W: fmt::Write + ?Sized>(
        record: &Record,
        process_name: Option<&str>,
        writer: &mut W,
    ) -> fmt::Result {
        let target = record.module_path().unwrap_or(record.target());
        let level = record.level();
        let message = record.args();

        let process_name = process_name.unwrap_or("");
        let line = &LineFmt(record.line());
        writeln!(writer, "[{process_name}@{target}{line} {level}] {message}")
    }
}

impl log::Log for TlsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.output.filter
    }
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut endpoint = self.output.endpoint.lock();
            let _ = Self::write_record(record, self.process_name.as_deref(), endpoint.as_mut());
        }
    }
    fn flush(&self) {}
}

struct LineFmt(Option<u32>);
impl fmt::Display for LineFmt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(line) = self.0 {
            write!(f, ":{line}")
        } else {
            Ok(())
        }
    }
}
