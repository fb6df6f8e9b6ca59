use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Notice,
    Error,
    Completed,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Notice => "notice",
            LogLevel::Error => "error",
            LogLevel::Completed => "completed",
        }
    }
}

/// Append-only sink for operator-facing stage messages.
///
/// Writing to the log never fails a job; implementations swallow their own
/// I/O problems after reporting them through `tracing`.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn write(&self, level: LogLevel, message: &str);

    async fn notice(&self, message: &str) {
        self.write(LogLevel::Notice, message).await;
    }

    async fn error(&self, message: &str) {
        self.write(LogLevel::Error, message).await;
    }

    async fn completed(&self, message: &str) {
        self.write(LogLevel::Completed, message).await;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExecutionLog;

#[async_trait]
impl ExecutionLog for TracingExecutionLog {
    async fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => error!(target: "orgreg::execution", "{message}"),
            LogLevel::Notice | LogLevel::Completed => {
                info!(target: "orgreg::execution", level = level.as_str(), "{message}")
            }
        }
    }
}

/// One line per message: `<rfc3339> <level> <message>`.
#[derive(Debug, Clone)]
pub struct FileExecutionLog {
    path: PathBuf,
}

impl FileExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl ExecutionLog for FileExecutionLog {
    async fn write(&self, level: LogLevel, message: &str) {
        let line = format!("{} {} {}\n", Utc::now().to_rfc3339(), level.as_str(), message);
        if let Err(err) = self.append(&line).await {
            error!(path = %self.path.display(), error = %err, "failed to append execution log");
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryExecutionLog {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn write(&self, level: LogLevel, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_log_appends_lines() {
        let dir = tempdir().expect("tempdir");
        let log = FileExecutionLog::new(dir.path().join("logs/execution.log"));
        log.notice("probing dataset").await;
        log.error("chunk 3 failed").await;

        let text = std::fs::read_to_string(dir.path().join("logs/execution.log")).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("notice probing dataset"));
        assert!(lines[1].ends_with("error chunk 3 failed"));
    }

    #[tokio::test]
    async fn memory_log_filters_by_level() {
        let log = MemoryExecutionLog::new();
        log.notice("a").await;
        log.completed("b").await;
        log.notice("c").await;
        assert_eq!(log.messages(LogLevel::Notice), vec!["a", "c"]);
        assert_eq!(log.messages(LogLevel::Completed), vec!["b"]);
    }
}
