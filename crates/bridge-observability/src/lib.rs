use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "bridge-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncComponent {
    Subscription,
    Reconciler,
    Refetcher,
    Reconnect,
    Engine,
}

impl SyncComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncComponent::Subscription => "subscription",
            SyncComponent::Reconciler => "reconciler",
            SyncComponent::Refetcher => "refetcher",
            SyncComponent::Reconnect => "reconnect",
            SyncComponent::Engine => "engine",
        }
    }
}

/// A structured lifecycle event. Empty fields are logged as empty strings so
/// the JSONL output keeps a stable shape.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncEvent<'a> {
    pub event: &'a str,
    pub component: SyncComponent,
    pub environment_id: Option<&'a str>,
    pub tab_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> SyncEvent<'a> {
    pub fn new(component: SyncComponent, event: &'a str) -> Self {
        Self {
            event,
            component,
            environment_id: None,
            tab_id: None,
            session_id: None,
            request_id: None,
            event_type: None,
            status: None,
            detail: None,
        }
    }

    pub fn environment(mut self, environment_id: &'a str) -> Self {
        self.environment_id = Some(environment_id);
        self
    }

    pub fn tab(mut self, tab_id: &'a str) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn session(mut self, session_id: &'a str) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn request(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn event_type(mut self, event_type: &'a str) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! emit_at {
    ($macro:ident, $event:expr) => {
        tracing::$macro!(
            target: "bridge.sync",
            component = $event.component.as_str(),
            event = $event.event,
            environment_id = $event.environment_id.unwrap_or(""),
            tab_id = $event.tab_id.unwrap_or(""),
            session_id = $event.session_id.unwrap_or(""),
            request_id = $event.request_id.unwrap_or(""),
            event_type = $event.event_type.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "sync_event"
        )
    };
}

pub fn emit_event(level: Level, event: SyncEvent<'_>) {
    match level {
        Level::ERROR => emit_at!(error, event),
        Level::WARN => emit_at!(warn, event),
        Level::DEBUG | Level::TRACE => emit_at!(debug, event),
        _ => emit_at!(info, event),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for daily JSONL files. Console-only when unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> u64 {
    7
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            logs_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

pub struct LoggingInitInfo {
    pub logs_dir: Option<PathBuf>,
    pub level: String,
    pub initialized_at: DateTime<Utc>,
    /// Keeps the non-blocking file writer alive; dropping it flushes and stops file logging.
    pub guard: Option<WorkerGuard>,
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingInitInfo> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let mut guard = None;
    let file_layer = match &config.logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            cleanup_old_jsonl(dir, config.retention_days)?;
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("jsonl")
                .build(dir)?;
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_current_span(false)
                    .with_span_list(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(LoggingInitInfo {
        logs_dir: config.logs_dir.clone(),
        level: config.level.clone(),
        initialized_at: Utc::now(),
        guard,
    })
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
    let prefix = format!("{}.", LOG_FILE_PREFIX);

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date) = log_file_date(name, &prefix) else {
            continue;
        };
        if date < cutoff {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

// expected: bridge-sync.YYYY-MM-DD.jsonl
fn log_file_date(name: &str, prefix: &str) -> Option<chrono::NaiveDate> {
    let date_part = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
