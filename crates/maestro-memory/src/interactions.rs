use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use maestro_core::error::Result;
use maestro_core::types::ResponseMap;

/// One completed request, as stored in the interaction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub id: String,
    pub user_input: String,
    pub task_type: String,
    pub agent_responses: ResponseMap,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
}

impl Interaction {
    pub fn new(user_input: impl Into<String>, task_type: impl Into<String>, agent_responses: ResponseMap) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_input: user_input.into(),
            task_type: task_type.into(),
            agent_responses,
            timestamp: Utc::now(),
            stored_at: None,
        }
    }

    /// Lowercased text searched by relevance scoring.
    fn searchable_text(&self) -> String {
        let mut text = self.user_input.to_lowercase();
        for (_, response) in self.agent_responses.iter() {
            text.push(' ');
            text.push_str(&response.to_lowercase());
        }
        text
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InteractionStats {
    pub total: usize,
    pub by_task_type: BTreeMap<String, usize>,
    pub by_agent: BTreeMap<String, usize>,
    pub last_24h: usize,
}

/// Append-only JSON Lines store of interactions.
///
/// Each record is written as one line and flushed immediately, so a crash
/// never corrupts earlier records. Concurrent writers are serialized.
pub struct InteractionLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl InteractionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one interaction, stamping `stored_at`.
    pub async fn record(&self, interaction: &Interaction) -> Result<()> {
        let mut stored = interaction.clone();
        stored.stored_at = Some(Utc::now());
        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut writer = tokio::io::BufWriter::new(file);
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        debug!(id = %stored.id, task_type = %stored.task_type, "Interaction recorded");
        Ok(())
    }

    /// Every readable record, oldest first. Malformed lines are skipped.
    async fn read_all(&self) -> Result<Vec<Interaction>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Interaction>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = lineno + 1, error = %e, "Skipping malformed interaction record"),
            }
        }
        Ok(records)
    }

    /// The newest `limit` interactions, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Interaction>> {
        let mut records = self.read_all().await?;
        let start = records.len().saturating_sub(limit);
        Ok(records.split_off(start))
    }

    /// Interactions sharing keywords with `input`.
    ///
    /// Scans the newest `scan_window` records and scores each by how many
    /// whitespace-separated words of the lowercased input occur in its text.
    /// Returns at most `max` records with a positive score, best first;
    /// equal scores keep the newer record first.
    pub async fn relevant(&self, input: &str, max: usize, scan_window: usize) -> Result<Vec<Interaction>> {
        let lowered = input.to_lowercase();
        let keywords: Vec<&str> = lowered.split_whitespace().collect();
        if keywords.is_empty() || max == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.recent(scan_window).await?;
        let mut scored: Vec<(usize, Interaction)> = candidates
            .into_iter()
            .rev()
            .filter_map(|record| {
                let text = record.searchable_text();
                let score = keywords.iter().filter(|k| text.contains(*k)).count();
                (score > 0).then_some((score, record))
            })
            .collect();

        // Stable sort keeps newest-first among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(max);

        debug!(found = scored.len(), "Relevant interactions found");
        Ok(scored.into_iter().map(|(_, record)| record).collect())
    }

    pub async fn stats(&self) -> Result<InteractionStats> {
        let records = self.read_all().await?;
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let mut stats = InteractionStats {
            total: records.len(),
            ..InteractionStats::default()
        };

        for record in &records {
            *stats.by_task_type.entry(record.task_type.clone()).or_insert(0) += 1;
            for (agent, _) in record.agent_responses.iter() {
                *stats.by_agent.entry(agent.to_string()).or_insert(0) += 1;
            }
            if record.timestamp >= cutoff {
                stats.last_24h += 1;
            }
        }
        Ok(stats)
    }

    /// Drop records older than `days`. Lines that cannot be dated are kept.
    /// Returns the number of records removed.
    pub async fn cleanup_older_than(&self, days: i64) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut kept = String::with_capacity(content.len());
        let mut removed = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let expired = serde_json::from_str::<Interaction>(line)
                .map(|record| record.timestamp < cutoff)
                .unwrap_or(false);
            if expired {
                removed += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if removed > 0 {
            let mut tmp = self.path.clone().into_os_string();
            tmp.push(".tmp");
            tokio::fs::write(&tmp, kept).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            info!(removed, days, "Old interactions cleaned up");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::types::HandlerId;

    fn responses(pairs: &[(&str, &str)]) -> ResponseMap {
        pairs
            .iter()
            .map(|(id, text)| (HandlerId::new(*id), text.to_string()))
            .collect()
    }

    fn log_in(dir: &tempfile::TempDir) -> InteractionLog {
        InteractionLog::new(dir.path().join("data").join("interactions.jsonl"))
    }

    #[tokio::test]
    async fn test_record_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.record(&Interaction::new("hello", "chat", responses(&[("chat", "hi")])))
            .await
            .unwrap();
        log.record(&Interaction::new("grade it", "grading", responses(&[("grading", "B")])))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["user_input"], "hello");
        assert_eq!(first["agent_responses"]["chat"], "hi");
        assert!(first["stored_at"].is_string());
        assert!(Uuid::parse_str(first["id"].as_str().unwrap()).is_ok());

        let recent = log.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].task_type, "grading");
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        assert!(log.recent(10).await.unwrap().is_empty());
        assert!(log.relevant("anything", 5, 50).await.unwrap().is_empty());
        assert_eq!(log.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_relevant_scoring_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.record(&Interaction::new("rust borrow checker", "chat", responses(&[("chat", "lifetimes")])))
            .await
            .unwrap();
        log.record(&Interaction::new("python lists", "chat", responses(&[("chat", "slicing")])))
            .await
            .unwrap();
        log.record(&Interaction::new("rust traits", "chat", responses(&[("chat", "dyn dispatch")])))
            .await
            .unwrap();

        let found = log.relevant("Rust borrow rules", 5, 50).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].user_input, "rust borrow checker");
        assert_eq!(found[1].user_input, "rust traits");

        let capped = log.relevant("rust", 1, 50).await.unwrap();
        assert_eq!(capped.len(), 1);
        // Tie on score: newer first
        assert_eq!(capped[0].user_input, "rust traits");

        // Only the newest record is scanned
        let narrow = log.relevant("borrow", 5, 1).await.unwrap();
        assert!(narrow.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.record(&Interaction::new("ok", "chat", ResponseMap::new())).await.unwrap();
        let mut raw = std::fs::read_to_string(log.path()).unwrap();
        raw.push_str("{broken\n");
        std::fs::write(log.path(), raw).unwrap();

        assert_eq!(log.recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);

        let mut old = Interaction::new("ancient", "analysis", responses(&[("analysis", "x")]));
        old.timestamp = Utc::now() - ChronoDuration::days(40);
        log.record(&old).await.unwrap();
        log.record(&Interaction::new("today", "chat", responses(&[("chat", "y")])))
            .await
            .unwrap();

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_task_type.get("analysis"), Some(&1));
        assert_eq!(stats.by_agent.get("chat"), Some(&1));
        assert_eq!(stats.last_24h, 1);

        assert_eq!(log.cleanup_older_than(30).await.unwrap(), 1);
        let left = log.recent(10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].user_input, "today");
    }
}
