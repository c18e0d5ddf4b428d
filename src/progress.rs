//! Indexing progress reporting.
//!
//! The reconciler emits [`IndexProgressEvent`]s while it scans and applies
//! a delta. Progress goes to **stderr** so stdout stays parseable.

use std::io::Write;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub enum IndexProgressEvent {
    /// Walking the container's roots. Total unknown.
    Scanning { container: String },
    /// Applying the delta: `n` of `total` documents handled.
    Applying {
        container: String,
        n: u64,
        total: u64,
        path: PathBuf,
    },
    /// Pass over.
    Finished {
        container: String,
        changed: u64,
        cancelled: bool,
    },
}

/// Receives progress events. Called from the indexing task.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly lines: `index work  applying  1,234 / 5,000  /path/to/file`.
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Scanning { container } => {
                format!("index {}  scanning...\n", container)
            }
            IndexProgressEvent::Applying {
                container,
                n,
                total,
                path,
            } => format!(
                "index {}  applying  {} / {}  {}\n",
                container,
                format_number(*n),
                format_number(*total),
                path.display()
            ),
            IndexProgressEvent::Finished {
                container,
                changed,
                cancelled,
            } => format!(
                "index {}  {}  {} changed\n",
                container,
                if *cancelled { "cancelled" } else { "done" },
                format_number(*changed)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &IndexProgressEvent) -> serde_json::Value {
        match event {
            IndexProgressEvent::Scanning { container } => serde_json::json!({
                "event": "progress",
                "container": container,
                "phase": "scanning"
            }),
            IndexProgressEvent::Applying {
                container,
                n,
                total,
                path,
            } => serde_json::json!({
                "event": "progress",
                "container": container,
                "phase": "applying",
                "n": n,
                "total": total,
                "path": path
            }),
            IndexProgressEvent::Finished {
                container,
                changed,
                cancelled,
            } => serde_json::json!({
                "event": "finished",
                "container": container,
                "changed": changed,
                "cancelled": cancelled
            }),
        }
    }
}

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
