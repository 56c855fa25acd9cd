use crate::bus::EngineEvent;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use lazy_static::lazy_static;
use partmig_metastore::log_writer::LogWriter;
use partmig_metastore::logs::StoredLogEntry;
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log line. Message and context are already masked.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub session_id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub context: Option<String>,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            self.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.component,
            self.message
        )
    }
}

lazy_static! {
    static ref KEY_VALUE_SECRET: Regex = Regex::new(
        r"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key)\b\s*[=:]\s*[^\s,;&]+"
    )
    .unwrap();
    static ref BEARER_TOKEN: Regex = Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/\-]+=*").unwrap();
    static ref URL_USERINFO: Regex = Regex::new(r"(://[^:/@\s]+:)[^@\s]+@").unwrap();
}

/// Strips credential-looking substrings before a line reaches any sink.
pub fn mask_secrets(input: &str) -> String {
    let masked = KEY_VALUE_SECRET.replace_all(input, "$1=***");
    let masked = BEARER_TOKEN.replace_all(&masked, "bearer ***");
    URL_USERINFO.replace_all(&masked, "$1***@").into_owned()
}

/// Where masked log lines end up. Appends must not block the worker.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &LogLine);
}

/// Session-scoped logger fanning out to every configured sink.
pub struct SessionLogger {
    session_id: Uuid,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl SessionLogger {
    pub fn new(session_id: Uuid, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { session_id, sinks }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn log(&self, level: LogLevel, component: &str, message: impl Into<String>) {
        self.log_with_context(level, component, message, None);
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: &str,
        message: impl Into<String>,
        context: Option<String>,
    ) {
        let line = LogLine {
            session_id: self.session_id,
            ts: Utc::now(),
            level,
            component: component.to_string(),
            message: mask_secrets(&message.into()),
            context: context.map(|c| mask_secrets(&c)),
        };
        for sink in &self.sinks {
            sink.append(&line);
        }
    }

    pub fn debug(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, component, message);
    }

    pub fn info(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, component, message);
    }

    pub fn success(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Success, component, message);
    }

    pub fn warning(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, component, message);
    }

    pub fn error(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, component, message);
    }
}

/// Daily rotated text file under the per-user log directory.
pub struct FileSink {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, std::fs::File)>>,
}

impl FileSink {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            current: Mutex::new(None),
        }
    }
}

impl LogSink for FileSink {
    fn append(&self, line: &LogLine) {
        let date = line.ts.date_naive();
        let mut guard = self.current.lock().unwrap();
        let reopen = !matches!(&*guard, Some((open_date, _)) if *open_date == date);
        if reopen {
            let path = self.dir.join(format!("migration_{}.log", date.format("%Y%m%d")));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some((date, file)),
                Err(e) => {
                    eprintln!("opening log file {}: {e}", path.display());
                    return;
                }
            }
        }
        if let Some((_, file)) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{}", line.render()) {
                eprintln!("writing log file: {e}");
            }
        }
    }
}

/// Feeds the metadata store's `logs` table through the bounded background
/// writer.
pub struct StoreSink {
    writer: Arc<LogWriter>,
}

impl StoreSink {
    pub fn new(writer: Arc<LogWriter>) -> Self {
        Self { writer }
    }
}

impl LogSink for StoreSink {
    fn append(&self, line: &LogLine) {
        self.writer.enqueue(StoredLogEntry {
            run_session_id: line.session_id.to_string(),
            ts: line.ts,
            level: line.level.as_str().to_string(),
            component: line.component.clone(),
            message: line.message.clone(),
            context: line.context.clone(),
        });
    }
}

/// Forwards lines to the observer's event channel.
pub struct BusSink {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl BusSink {
    pub fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { sender }
    }
}

impl LogSink for BusSink {
    fn append(&self, line: &LogLine) {
        let _ = self.sender.send(EngineEvent::Log(line.clone()));
    }
}

