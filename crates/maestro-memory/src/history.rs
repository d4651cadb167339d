use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use maestro_core::error::{MaestroError, Result};
use maestro_core::types::{ChatMessage, HandlerId, Message, Role};

/// Bounded, ordered conversation log shared across requests.
///
/// Keeps the last `max_messages` messages, evicting from the head, plus at
/// most one in-progress streaming message. All state sits behind a single
/// mutex that is never held across an await; disk I/O works on snapshots.
pub struct ConversationHistory {
    state: Mutex<HistoryState>,
    storage: Option<PathBuf>,
    // Serializes writers of the storage file.
    save_lock: tokio::sync::Mutex<()>,
}

struct HistoryState {
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
    streaming: Option<StreamingAccumulator>,
    next_ticket: u64,
}

impl HistoryState {
    fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        self.enforce_window();
    }

    fn enforce_window(&mut self) {
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }
}

/// Identifies the accumulator opened by one `start_streaming` call.
///
/// Ticketed operations fail once that accumulator is gone, even if another
/// stream has been started since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTicket(u64);

/// Fragments of an assistant message that is still being streamed.
#[derive(Debug, Clone)]
pub struct StreamingAccumulator {
    pub ticket: StreamTicket,
    pub handler_id: HandlerId,
    pub fragments: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl StreamingAccumulator {
    pub fn content(&self) -> String {
        self.fragments.concat()
    }
}

/// On-disk layout of a saved history.
#[derive(Serialize, Deserialize)]
struct HistoryFile {
    max_messages: usize,
    saved_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

/// Summary counters for a history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub by_handler: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub max_messages: usize,
    pub streaming: bool,
}

impl ConversationHistory {
    /// In-memory history. `max_messages` is clamped to at least 1.
    pub fn new(max_messages: usize) -> Self {
        Self {
            state: Mutex::new(HistoryState {
                messages: VecDeque::new(),
                max_messages: max_messages.max(1),
                streaming: None,
                next_ticket: 0,
            }),
            storage: None,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist to and load from `path`.
    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Some(path.into());
        self
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append_user(&self, content: impl Into<String>) {
        self.lock().push(ChatMessage::user(content));
    }

    pub fn append_assistant(&self, content: impl Into<String>, handler_id: HandlerId) {
        self.lock().push(ChatMessage::assistant(content, handler_id));
    }

    /// Append an already-built message (e.g. one carrying metadata).
    pub fn append(&self, message: ChatMessage) {
        self.lock().push(message);
    }

    /// Begin accumulating a streamed assistant message.
    ///
    /// The returned ticket names this accumulator for the ticketed
    /// operations below.
    pub fn start_streaming(&self, handler_id: HandlerId) -> Result<StreamTicket> {
        let mut state = self.lock();
        if state.streaming.is_some() {
            return Err(MaestroError::StreamingActive);
        }
        state.next_ticket += 1;
        let ticket = StreamTicket(state.next_ticket);
        debug!(handler = %handler_id, ticket = ticket.0, "Streaming message started");
        state.streaming = Some(StreamingAccumulator {
            ticket,
            handler_id,
            fragments: Vec::new(),
            started_at: Utc::now(),
        });
        Ok(ticket)
    }

    pub fn append_chunk(&self, fragment: impl Into<String>) -> Result<()> {
        match self.lock().streaming.as_mut() {
            Some(acc) => {
                acc.fragments.push(fragment.into());
                Ok(())
            }
            None => Err(MaestroError::NoActiveStream),
        }
    }

    /// Like `append_chunk`, but only into the accumulator `ticket` opened.
    pub fn append_chunk_to(&self, ticket: StreamTicket, fragment: impl Into<String>) -> Result<()> {
        match self.lock().streaming.as_mut() {
            Some(acc) if acc.ticket == ticket => {
                acc.fragments.push(fragment.into());
                Ok(())
            }
            _ => Err(MaestroError::NoActiveStream),
        }
    }

    /// Turn the accumulated fragments into one assistant message.
    pub fn finalize(&self) -> Result<ChatMessage> {
        let mut state = self.lock();
        let acc = state.streaming.take().ok_or(MaestroError::NoActiveStream)?;
        let message = ChatMessage::assistant(acc.content(), acc.handler_id);
        state.push(message.clone());
        Ok(message)
    }

    /// Finalize the accumulator `ticket` opened, if it is still the active one.
    pub fn finalize_stream(&self, ticket: StreamTicket) -> Result<ChatMessage> {
        let mut state = self.lock();
        match state.streaming.as_ref() {
            Some(acc) if acc.ticket == ticket => {}
            _ => return Err(MaestroError::NoActiveStream),
        }
        let acc = state.streaming.take().ok_or(MaestroError::NoActiveStream)?;
        let message = ChatMessage::assistant(acc.content(), acc.handler_id);
        state.push(message.clone());
        Ok(message)
    }

    /// Discard the in-progress message. Returns whether one existed.
    pub fn cancel(&self) -> bool {
        let cancelled = self.lock().streaming.take().is_some();
        if cancelled {
            debug!("Streaming message cancelled");
        }
        cancelled
    }

    /// Discard the accumulator `ticket` opened. Another stream's
    /// accumulator is left alone.
    pub fn cancel_stream(&self, ticket: StreamTicket) -> bool {
        let mut state = self.lock();
        let owned = state.streaming.as_ref().is_some_and(|acc| acc.ticket == ticket);
        if owned {
            state.streaming = None;
            debug!(ticket = ticket.0, "Streaming message cancelled");
        }
        owned
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming.is_some()
    }

    /// Text accumulated so far by the in-progress message.
    pub fn streaming_content(&self) -> Option<String> {
        self.lock().streaming.as_ref().map(StreamingAccumulator::content)
    }

    /// Ordered snapshot, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.lock().max_messages
    }

    /// Change the window size, trimming the oldest messages immediately.
    pub fn set_max_messages(&self, max_messages: usize) {
        let mut state = self.lock();
        state.max_messages = max_messages.max(1);
        state.enforce_window();
    }

    /// Prompt messages for a text-generation call. Assistant replies are
    /// prefixed with the handler that produced them.
    pub fn llm_messages(&self) -> Vec<Message> {
        to_llm_messages(&self.messages())
    }

    /// Human-readable digest of the last `count` messages (all if 0).
    pub fn recent_context(&self, count: usize) -> String {
        let messages = self.messages();
        let start = if count == 0 { 0 } else { messages.len().saturating_sub(count) };
        let recent = &messages[start..];

        if recent.is_empty() {
            return "No previous conversation context.".to_string();
        }

        let mut lines = vec!["Recent conversation context:".to_string()];
        for msg in recent {
            let time = msg.timestamp.format("%H:%M");
            match msg.role {
                Role::User => lines.push(format!("[{}] User: {}", time, msg.content)),
                Role::Assistant => {
                    let agent = msg
                        .handler_id
                        .as_ref()
                        .map(|id| format!(" ({})", id))
                        .unwrap_or_default();
                    lines.push(format!("[{}] Assistant{}: {}", time, agent, msg.content));
                }
                Role::System => {}
            }
        }
        lines.join("\n")
    }

    pub fn stats(&self) -> HistoryStats {
        let state = self.lock();
        let mut by_handler = BTreeMap::new();
        let mut user_messages = 0;
        let mut assistant_messages = 0;

        for msg in &state.messages {
            match msg.role {
                Role::User => user_messages += 1,
                Role::Assistant => {
                    assistant_messages += 1;
                    if let Some(id) = &msg.handler_id {
                        *by_handler.entry(id.to_string()).or_insert(0) += 1;
                    }
                }
                Role::System => {}
            }
        }

        HistoryStats {
            total_messages: state.messages.len(),
            user_messages,
            assistant_messages,
            by_handler,
            oldest: state.messages.front().map(|m| m.timestamp),
            newest: state.messages.back().map(|m| m.timestamp),
            max_messages: state.max_messages,
            streaming: state.streaming.is_some(),
        }
    }

    fn require_storage(&self) -> Result<&Path> {
        self.storage
            .as_deref()
            .ok_or_else(|| MaestroError::Persistence("history has no storage path".into()))
    }

    /// Write the current messages to the storage file.
    ///
    /// The file is replaced atomically: a sibling temp file is written and
    /// renamed over the target. Concurrent saves run one at a time, each
    /// writing the snapshot taken after it got its turn.
    pub async fn save_to_disk(&self) -> Result<()> {
        let path = self.require_storage()?;
        let _writer = self.save_lock.lock().await;
        let snapshot = {
            let state = self.lock();
            HistoryFile {
                max_messages: state.max_messages,
                saved_at: Utc::now(),
                messages: state.messages.iter().cloned().collect(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }

        debug!(path = %path.display(), messages = snapshot.messages.len(), "History saved");
        Ok(())
    }

    /// Replace the in-memory messages with the saved ones.
    ///
    /// A missing file loads nothing. The saved window size is restored along
    /// with the messages. Returns the number of messages loaded.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let path = self.require_storage()?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved history");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let file: HistoryFile = serde_json::from_slice(&bytes)
            .map_err(|e| MaestroError::Persistence(format!("corrupt history file: {}", e)))?;

        let mut state = self.lock();
        state.max_messages = file.max_messages.max(1);
        state.messages = file.messages.into_iter().collect();
        state.enforce_window();
        let loaded = state.messages.len();
        info!(path = %path.display(), loaded, "History loaded");
        Ok(loaded)
    }

    /// Empty the history and remove the storage file, if any.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.messages.clear();
            state.streaming = None;
        }
        if let Some(path) = self.storage.as_deref() {
            let _writer = self.save_lock.lock().await;
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "History file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove history file");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Convert stored messages into prompt messages.
pub fn to_llm_messages(messages: &[ChatMessage]) -> Vec<Message> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::User => Message::user(msg.content.clone()),
            Role::Assistant => match &msg.handler_id {
                Some(id) => Message::assistant(format!("[{} agent]: {}", id, msg.content)),
                None => Message::assistant(msg.content.clone()),
            },
            Role::System => Message::system(msg.content.clone()),
        })
        .collect()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let history = ConversationHistory::new(3);
        for i in 0..5 {
            history.append_user(format!("m{}", i));
        }
        let contents: Vec<String> = history.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_finalize_appends_concatenation() {
        let history = ConversationHistory::new(20);
        history.start_streaming(HandlerId::new("chat")).unwrap();
        history.append_chunk("Hel").unwrap();
        history.append_chunk("lo").unwrap();
        assert_eq!(history.streaming_content().as_deref(), Some("Hello"));

        let msg = history.finalize().unwrap();
        assert_eq!(msg.content, "Hello");
        assert_eq!(msg.handler_id, Some(HandlerId::new("chat")));
        assert_eq!(history.len(), 1);
        assert!(!history.is_streaming());
    }

    #[test]
    fn test_cancel_leaves_history_untouched() {
        let history = ConversationHistory::new(20);
        history.append_user("hi");
        history.start_streaming(HandlerId::new("chat")).unwrap();
        history.append_chunk("partial").unwrap();
        assert!(history.cancel());
        assert_eq!(history.len(), 1);
        assert!(!history.cancel());
        assert!(matches!(history.finalize(), Err(MaestroError::NoActiveStream)));
    }

    #[test]
    fn test_only_one_stream_at_a_time() {
        let history = ConversationHistory::new(20);
        history.start_streaming(HandlerId::new("chat")).unwrap();
        assert!(matches!(
            history.start_streaming(HandlerId::new("analysis")),
            Err(MaestroError::StreamingActive)
        ));
        assert!(matches!(
            ConversationHistory::new(5).append_chunk("x"),
            Err(MaestroError::NoActiveStream)
        ));
    }

    #[test]
    fn test_finalize_respects_window() {
        let history = ConversationHistory::new(2);
        history.append_user("a");
        history.append_user("b");
        history.start_streaming(HandlerId::new("chat")).unwrap();
        history.append_chunk("c").unwrap();
        history.finalize().unwrap();
        let contents: Vec<String> = history.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[test]
    fn test_set_max_messages_trims() {
        let history = ConversationHistory::new(10);
        for i in 0..6 {
            history.append_user(format!("m{}", i));
        }
        history.set_max_messages(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[0].content, "m4");
        history.set_max_messages(0);
        assert_eq!(history.max_messages(), 1);
    }

    #[test]
    fn test_llm_messages_prefix_agent() {
        let history = ConversationHistory::new(10);
        history.append_user("grade this");
        history.append_assistant("B+", HandlerId::new("grading"));
        let messages = history.llm_messages();
        assert_eq!(messages[0], Message::user("grade this"));
        assert_eq!(messages[1], Message::assistant("[grading agent]: B+"));
    }

    #[test]
    fn test_recent_context() {
        let history = ConversationHistory::new(10);
        assert_eq!(history.recent_context(5), "No previous conversation context.");
        history.append_user("one");
        history.append_assistant("two", HandlerId::new("chat"));
        history.append_user("three");

        let context = history.recent_context(2);
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines[0], "Recent conversation context:");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("Assistant (chat): two"));
        assert!(lines[2].ends_with("User: three"));
    }

    #[test]
    fn test_stats() {
        let history = ConversationHistory::new(10);
        history.append_user("q1");
        history.append_assistant("a1", HandlerId::new("chat"));
        history.append_user("q2");
        history.append_assistant("a2", HandlerId::new("grading"));
        history.append_assistant("a3", HandlerId::new("chat"));

        let stats = history.stats();
        assert_eq!(stats.total_messages, 5);
        assert_eq!(stats.user_messages, 2);
        assert_eq!(stats.assistant_messages, 3);
        assert_eq!(stats.by_handler.get("chat"), Some(&2));
        assert!(stats.oldest <= stats.newest);
        assert!(!stats.streaming);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let history = ConversationHistory::new(20).with_storage(&path);
        history.append_user("Hello");
        history.append(
            ChatMessage::assistant("Hi there", HandlerId::new("chat"))
                .with_metadata(serde_json::json!({"cached": false})),
        );
        history.save_to_disk().await.unwrap();

        let restored = ConversationHistory::new(20).with_storage(&path);
        assert_eq!(restored.load_from_disk().await.unwrap(), 2);
        assert_eq!(restored.messages(), history.messages());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["max_messages"], 20);
        assert_eq!(raw["messages"][1]["agent_type"], "chat");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_load_restores_saved_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let saved = ConversationHistory::new(40).with_storage(&path);
        for i in 0..30 {
            saved.append_user(format!("m{}", i));
        }
        saved.save_to_disk().await.unwrap();

        let fresh = ConversationHistory::new(20).with_storage(&path);
        assert_eq!(fresh.load_from_disk().await.unwrap(), 30);
        assert_eq!(fresh.messages(), saved.messages());
        assert_eq!(fresh.max_messages(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let history = std::sync::Arc::new(ConversationHistory::new(50).with_storage(&path));

        for round in 0..10 {
            history.append_user(format!("round {}", round));
            let saves: Vec<_> = (0..8)
                .map(|_| {
                    let history = history.clone();
                    tokio::spawn(async move { history.save_to_disk().await })
                })
                .collect();
            for save in saves {
                save.await.unwrap().unwrap();
            }
        }

        let restored = ConversationHistory::new(50).with_storage(&path);
        assert_eq!(restored.load_from_disk().await.unwrap(), 10);
        assert_eq!(restored.messages(), history.messages());
    }

    #[tokio::test]
    async fn test_ticket_outlives_cleared_stream() {
        let history = ConversationHistory::new(20);
        let first = history.start_streaming(HandlerId::new("chat")).unwrap();
        history.append_chunk_to(first, "from first").unwrap();

        // Another run clears the history and opens its own stream.
        history.clear().await.unwrap();
        let second = history.start_streaming(HandlerId::new("analysis")).unwrap();
        assert_ne!(first, second);

        assert!(matches!(
            history.append_chunk_to(first, "late"),
            Err(MaestroError::NoActiveStream)
        ));
        assert!(!history.cancel_stream(first));
        assert!(matches!(
            history.finalize_stream(first),
            Err(MaestroError::NoActiveStream)
        ));

        history.append_chunk_to(second, "from second").unwrap();
        assert_eq!(history.streaming_content().as_deref(), Some("from second"));
        let msg = history.finalize_stream(second).unwrap();
        assert_eq!(msg.handler_id, Some(HandlerId::new("analysis")));
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = ConversationHistory::new(5).with_storage(dir.path().join("absent.json"));
        assert_eq!(history.load_from_disk().await.unwrap(), 0);
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").unwrap();
        let history = ConversationHistory::new(5).with_storage(&path);
        assert!(matches!(
            history.load_from_disk().await,
            Err(MaestroError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let history = ConversationHistory::new(5).with_storage(&path);
        history.append_user("bye");
        history.save_to_disk().await.unwrap();
        assert!(path.exists());

        history.clear().await.unwrap();
        assert!(history.is_empty());
        assert!(!path.exists());
        // Clearing twice is fine
        history.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_without_storage_fails() {
        let history = ConversationHistory::new(5);
        assert!(matches!(
            history.save_to_disk().await,
            Err(MaestroError::Persistence(_))
        ));
    }
}
