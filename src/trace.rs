//! Redacted, size-bounded audit trace writer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::config::TraceMode;

const DEFAULT_MAX_BYTES: u64 = 262_144;
const DEFAULT_TOTAL_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILE_COUNT: u64 = 500;

fn default_redaction_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)bearer\s+[a-z0-9._\-]+").unwrap(),
            Regex::new(r"(?i)api[_-]?key[\s:=]+[a-z0-9._\-]+").unwrap(),
            Regex::new(r"sk-[A-Za-z0-9]{10,}").unwrap(),
            Regex::new(r"gh[pous]_[A-Za-z0-9]{10,}").unwrap(),
            Regex::new(r"xox[baprs]-[A-Za-z0-9\-]{10,}").unwrap(),
        ]
    })
}

/// Redacts secret-shaped substrings, honoring an allowlist override.
pub struct Redactor {
    patterns: Vec<Regex>,
    allowlist: Vec<Regex>,
    enabled: bool,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            patterns: default_redaction_patterns().to_vec(),
            allowlist: Vec::new(),
            enabled: true,
        }
    }
}

impl Redactor {
    pub fn disabled() -> Self {
        Self {
            patterns: Vec::new(),
            allowlist: Vec::new(),
            enabled: false,
        }
    }

    pub fn with_allowlist(mut self, patterns: Vec<Regex>) -> Self {
        self.allowlist = patterns;
        self
    }

    /// Returns the redacted content and whether any substitution happened.
    pub fn redact(&self, content: &str) -> (String, bool) {
        if !self.enabled {
            return (content.to_string(), false);
        }

        let mut result = content.to_string();
        let mut redacted = false;

        for pattern in &self.patterns {
            let mut out = String::with_capacity(result.len());
            let mut last_end = 0;
            for m in pattern.find_iter(&result) {
                let allowed = self
                    .allowlist
                    .iter()
                    .any(|allow| allow.find(m.as_str()).is_some());
                out.push_str(&result[last_end..m.start()]);
                if allowed {
                    out.push_str(m.as_str());
                } else {
                    out.push_str("[REDACTED]");
                    redacted = true;
                }
                last_end = m.end();
            }
            out.push_str(&result[last_end..]);
            result = out;
        }

        (result, redacted)
    }
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One recorded trace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub ts: chrono::DateTime<Utc>,
    pub event_type: String,
    pub phase: String,
    pub step: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub file: Option<String>,
    pub hash_raw: String,
    pub hash_stored: String,
    pub content_redacted: bool,
    pub content_truncated: bool,
    pub content_dropped: bool,
}

/// Fields describing one event to record, before redaction/size handling.
pub struct RecordEvent<'a> {
    pub event_type: &'a str,
    pub phase: &'a str,
    pub step: &'a str,
    pub agent: Option<&'a str>,
    pub model: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub task_name: Option<&'a str>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub content: &'a str,
    pub ext: &'a str,
}

struct Limits {
    max_bytes: u64,
    total_max_bytes: u64,
    max_file_count: u64,
}

impl Limits {
    fn new(max_bytes: u64, total_max_bytes: u64, max_file_count: u64) -> Self {
        Self {
            max_bytes,
            total_max_bytes: total_max_bytes.max(max_bytes),
            max_file_count,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES, DEFAULT_TOTAL_MAX_BYTES, DEFAULT_MAX_FILE_COUNT)
    }
}

/// Writes `<dir>/<run_id>/run.json` and an append-only `trace.jsonl`,
/// with optional sibling body files in `full` mode.
pub struct TraceWriter {
    dir: PathBuf,
    mode: TraceMode,
    redactor: Redactor,
    limits: Limits,
    seq: AtomicU64,
    bytes_written: AtomicU64,
    files_written: AtomicU64,
    disabled: AtomicBool,
}

impl TraceWriter {
    /// `StartRun`: create the run directory and manifest. `off` mode skips
    /// directory creation entirely.
    pub fn start_run(
        base_dir: impl AsRef<Path>,
        run_id: &str,
        workflow_id: &str,
        prompt_len: usize,
        mode: TraceMode,
        config_json: &serde_json::Value,
    ) -> Self {
        let dir = base_dir.as_ref().join(run_id);

        let writer = Self {
            dir: dir.clone(),
            mode,
            redactor: Redactor::default(),
            limits: Limits::default(),
            seq: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            files_written: AtomicU64::new(0),
            disabled: AtomicBool::new(mode == TraceMode::Off),
        };

        if mode == TraceMode::Off {
            return writer;
        }

        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(error = %e, "trace writer failed to create run directory, disabling");
            writer.disabled.store(true, Ordering::SeqCst);
            return writer;
        }

        let manifest = serde_json::json!({
            "schema_version": 1,
            "run_id": run_id,
            "workflow_id": workflow_id,
            "prompt_length": prompt_len,
            "started_at": Utc::now().to_rfc3339(),
            "config": config_json,
            "summary": serde_json::Value::Null,
        });

        if let Err(e) = std::fs::write(
            dir.join("run.json"),
            serde_json::to_string_pretty(&manifest).unwrap_or_default(),
        ) {
            error!(error = %e, "trace writer failed to write manifest, disabling");
            writer.disabled.store(true, Ordering::SeqCst);
        }

        writer
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_limits(mut self, max_bytes: u64, total_max_bytes: u64, max_file_count: u64) -> Self {
        self.limits = Limits::new(max_bytes, total_max_bytes, max_file_count);
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Record one event. A no-op if the writer has disabled itself.
    pub fn record(&self, event: RecordEvent<'_>) {
        if self.disabled.load(Ordering::SeqCst) || self.mode == TraceMode::Off {
            return;
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let hash_raw = sha256_hex(event.content);

        let (redacted_content, content_redacted) = self.redactor.redact(event.content);

        let over_total = self.bytes_written.load(Ordering::SeqCst) + redacted_content.len() as u64
            > self.limits.total_max_bytes;
        let over_file_count = self.files_written.load(Ordering::SeqCst) >= self.limits.max_file_count;
        let content_dropped = over_total || over_file_count;

        let (stored_content, content_truncated) = if content_dropped {
            (String::new(), false)
        } else if redacted_content.len() as u64 > self.limits.max_bytes {
            let cutoff = self.limits.max_bytes as usize;
            let mut truncated = redacted_content
                .char_indices()
                .take_while(|(i, _)| *i < cutoff)
                .map(|(_, c)| c)
                .collect::<String>();
            truncated.push_str("\n[trace truncated]\n");
            (truncated, true)
        } else {
            (redacted_content.clone(), false)
        };

        let hash_stored = sha256_hex(&stored_content);

        let file = if self.mode == TraceMode::Full && !content_dropped {
            let filename = format!(
                "{seq:04}-{}-{}-{}-{}-{}.{}",
                event.phase,
                event.step,
                event.agent.unwrap_or("none"),
                event.task_id.unwrap_or("none"),
                event.event_type,
                event.ext
            );
            let path = self.dir.join(&filename);
            match std::fs::write(&path, &stored_content) {
                Ok(()) => {
                    self.bytes_written
                        .fetch_add(stored_content.len() as u64, Ordering::SeqCst);
                    self.files_written.fetch_add(1, Ordering::SeqCst);
                    Some(filename)
                }
                Err(e) => {
                    error!(error = %e, "trace writer failed to write body file, disabling");
                    self.disabled.store(true, Ordering::SeqCst);
                    None
                }
            }
        } else {
            None
        };

        let trace_event = TraceEvent {
            seq,
            ts: Utc::now(),
            event_type: event.event_type.to_string(),
            phase: event.phase.to_string(),
            step: event.step.to_string(),
            agent: event.agent.map(str::to_string),
            model: event.model.map(str::to_string),
            task_id: event.task_id.map(str::to_string),
            task_name: event.task_name.map(str::to_string),
            tokens_in: event.tokens_in,
            tokens_out: event.tokens_out,
            file,
            hash_raw,
            hash_stored,
            content_redacted,
            content_truncated,
            content_dropped,
        };

        if let Err(e) = self.append_jsonl(&trace_event) {
            error!(error = %e, "trace writer failed to append jsonl, disabling");
            self.disabled.store(true, Ordering::SeqCst);
        }
    }

    fn append_jsonl(&self, event: &TraceEvent) -> std::io::Result<()> {
        use std::io::Write;
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("trace.jsonl"))?;
        writeln!(file, "{line}")
    }
}
