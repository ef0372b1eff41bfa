use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{DeliveryOutcome, SessionToken},
    errors::Error,
    ports::OutcomeSink,
    Result,
};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Delivery Log ==============

const DELIVERY_MAX_TEXT: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEntry {
    pub timestamp: String,
    pub phone: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl DeliveryEntry {
    pub fn from_outcome(outcome: &DeliveryOutcome) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            phone: outcome.contact.phone.clone(),
            status: outcome.status.as_str().to_string(),
            message: outcome.contact.message.clone(),
            error_details: outcome.detail.clone(),
        }
    }
}

/// Append-only record of every delivery attempt (JSON lines or a readable block format).
#[derive(Clone, Debug)]
pub struct DeliveryLog {
    path: PathBuf,
    json: bool,
}

impl DeliveryLog {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut entry: DeliveryEntry) -> Result<()> {
        if let Some(s) = &entry.message {
            entry.message = Some(truncate_text(s, DELIVERY_MAX_TEXT));
        }
        if let Some(s) = &entry.error_details {
            entry.error_details = Some(truncate_text(s, DELIVERY_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&entry)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        let value = serde_json::to_value(&entry)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "delivery entry is not a JSON object".to_string(),
            ));
        };
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Read back every entry, in either format. A missing file has no entries.
    pub fn entries(&self) -> Result<Vec<DeliveryEntry>> {
        let txt = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        let mut block: Option<serde_json::Map<String, serde_json::Value>> = None;
        for line in txt.lines() {
            let line = line.trim_end();
            if line.starts_with('{') {
                match serde_json::from_str::<DeliveryEntry>(line) {
                    Ok(entry) => out.push(entry),
                    Err(e) => tracing::warn!(path = %self.path.display(), "skipping bad delivery line: {e}"),
                }
                continue;
            }
            if line.starts_with(BLOCK_RULE) {
                flush_block(block.take(), &mut out);
                block = Some(serde_json::Map::new());
                continue;
            }
            if let (Some(fields), Some((k, v))) = (block.as_mut(), line.split_once(": ")) {
                fields
                    .entry(k.to_string())
                    .or_insert_with(|| serde_json::Value::String(v.to_string()));
            }
        }
        flush_block(block, &mut out);
        Ok(out)
    }
}

const BLOCK_RULE: &str = "==========";

fn flush_block(
    block: Option<serde_json::Map<String, serde_json::Value>>,
    out: &mut Vec<DeliveryEntry>,
) {
    if let Some(fields) = block {
        if let Ok(entry) = serde_json::from_value(serde_json::Value::Object(fields)) {
            out.push(entry);
        }
    }
}

#[async_trait]
impl OutcomeSink for DeliveryLog {
    async fn record(&self, outcome: &DeliveryOutcome) -> Result<()> {
        self.write(DeliveryEntry::from_outcome(outcome))
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

// ============== Session File ==============

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionFileData {
    session: String,
    saved_at: String,
}

/// Persists the resumable session token between runs.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let txt = std::fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let data: SessionFileData = serde_json::from_str(&txt)?;
        if data.session.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionToken(data.session)))
    }

    pub fn save(&self, token: &SessionToken) -> Result<()> {
        let txt = serde_json::to_string(&SessionFileData {
            session: token.0.clone(),
            saved_at: iso_timestamp_utc(),
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, txt)?;
        Ok(())
    }
}
