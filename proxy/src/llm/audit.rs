//! Audit trail of upstream calls
//!
//! Every finished upstream call is logged at target `editor_proxy::audit`.
//! With a configured directory, records are also appended as JSON lines to
//! `audit-YYYY-MM-DD.jsonl` (UTC date).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::types::Usage;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub usage: Option<Usage>,
    /// Body sent upstream
    pub request: Value,
    /// Assembled assistant reply
    pub response: Value,
}

impl AuditRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        usage: Option<Usage>,
        request: Value,
        response: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            usage,
            request,
            response,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    dir: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Record one call. Failures to write the file are logged, never raised.
    pub async fn record(&self, record: &AuditRecord) {
        let usage = record.usage.unwrap_or_default();
        tracing::info!(
            target: "editor_proxy::audit",
            provider = %record.provider,
            model = %record.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "upstream call finished"
        );

        let Some(dir) = &self.dir else {
            return;
        };
        if let Err(e) = append(dir, record).await {
            tracing::warn!("failed to write audit record to {}: {}", dir.display(), e);
        }
    }
}

fn file_for(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("audit-{}.jsonl", at.format("%Y-%m-%d")))
}

async fn append(dir: &Path, record: &AuditRecord) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_for(dir, record.timestamp))
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_file_name_uses_utc_date() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(
            file_for(Path::new("/var/log/proxy"), at),
            PathBuf::from("/var/log/proxy/audit-2026-03-09.jsonl")
        );
    }

    #[tokio::test]
    async fn test_records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(Some(dir.path().join("audit")));

        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 4,
            total_tokens: 14,
        };
        let record = AuditRecord::new(
            "local",
            "qwen3",
            Some(usage),
            json!({"model": "qwen3"}),
            json!({"content": "hi"}),
        );
        log.record(&record).await;
        log.record(&record).await;

        let path = file_for(&dir.path().join("audit"), record.timestamp);
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["provider"], "local");
        assert_eq!(parsed["usage"]["total_tokens"], 14);
        assert_eq!(parsed["response"]["content"], "hi");
    }

    #[tokio::test]
    async fn test_without_dir_only_logs() {
        let log = AuditLog::default();
        assert!(log.dir().is_none());
        log.record(&AuditRecord::new("p", "m", None, json!({}), json!({})))
            .await;
    }
}
