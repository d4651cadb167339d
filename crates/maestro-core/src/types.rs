use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of an agent handler (e.g. "chat", "grading").
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub String);

impl HandlerId {
    pub const MASTER: &'static str = "master";
    pub const ERROR: &'static str = "error";
    pub const SYSTEM: &'static str = "system";
    pub const FORMATTING: &'static str = "formatting";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Events and messages produced by the orchestrator itself.
    pub fn master() -> Self {
        Self::new(Self::MASTER)
    }

    /// Assistant messages that carry an error reply.
    pub fn error() -> Self {
        Self::new(Self::ERROR)
    }

    /// Stream errors raised by a fault in the orchestrator rather than by a
    /// handler.
    pub fn system() -> Self {
        Self::new(Self::SYSTEM)
    }

    pub fn formatting() -> Self {
        Self::new(Self::FORMATTING)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<TaskCategory> for HandlerId {
    fn from(category: TaskCategory) -> Self {
        Self::new(category.as_str())
    }
}

/// The closed set of labels a request can be classified into.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    Chat,
    Analysis,
    Grading,
    CodeReview,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 4] = [
        TaskCategory::Chat,
        TaskCategory::Analysis,
        TaskCategory::Grading,
        TaskCategory::CodeReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Analysis => "analysis",
            Self::Grading => "grading",
            Self::CodeReview => "code_review",
        }
    }

    /// Parse a raw classifier label. Accepts surrounding whitespace,
    /// any casing, and `code review` / `code-review` spellings.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .trim_matches(|c: char| c == '.' || c == '"' || c == '\'')
            .to_lowercase()
            .replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A prompt message sent to the text-generation backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A message stored in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Handler that produced an assistant message.
    #[serde(rename = "agent_type", default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<HandlerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            handler_id: None,
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>, handler_id: HandlerId) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            handler_id: Some(handler_id),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Kind of a streaming event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Status,
    Chunk,
    Complete,
    Error,
}

/// An event delivered to a streaming caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    pub content: String,
    pub agent: HandlerId,
}

impl StreamEvent {
    pub fn status(content: impl Into<String>, agent: HandlerId) -> Self {
        Self {
            kind: StreamEventKind::Status,
            content: content.into(),
            agent,
        }
    }

    pub fn chunk(content: impl Into<String>, agent: HandlerId) -> Self {
        Self {
            kind: StreamEventKind::Chunk,
            content: content.into(),
            agent,
        }
    }

    pub fn complete(content: impl Into<String>, agent: HandlerId) -> Self {
        Self {
            kind: StreamEventKind::Complete,
            content: content.into(),
            agent,
        }
    }

    pub fn error(content: impl Into<String>, agent: HandlerId) -> Self {
        Self {
            kind: StreamEventKind::Error,
            content: content.into(),
            agent,
        }
    }
}

/// Handler outputs keyed by handler id, kept in insertion order.
///
/// Serialized as a JSON object whose key order is the execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMap(Vec<(HandlerId, String)>);

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. An overwritten entry keeps its position.
    pub fn insert(&mut self, handler: HandlerId, text: impl Into<String>) {
        let text = text.into();
        match self.0.iter_mut().find(|(id, _)| *id == handler) {
            Some(entry) => entry.1 = text,
            None => self.0.push((handler, text)),
        }
    }

    pub fn get(&self, handler: &HandlerId) -> Option<&str> {
        self.0
            .iter()
            .find(|(id, _)| id == handler)
            .map(|(_, text)| text.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HandlerId, &str)> {
        self.0.iter().map(|(id, text)| (id, text.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(HandlerId, String)> for ResponseMap {
    fn from_iter<I: IntoIterator<Item = (HandlerId, String)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (id, text) in iter {
            map.insert(id, text);
        }
        map
    }
}

impl Serialize for ResponseMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, text) in &self.0 {
            map.serialize_entry(id.as_str(), text)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResponseMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ResponseMapVisitor;

        impl<'de> Visitor<'de> for ResponseMapVisitor {
            type Value = ResponseMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of handler id to response text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut map = ResponseMap::new();
                while let Some((id, text)) = access.next_entry::<String, String>()? {
                    map.insert(HandlerId(id), text);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(ResponseMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_label() {
        assert_eq!(TaskCategory::from_label("chat"), Some(TaskCategory::Chat));
        assert_eq!(TaskCategory::from_label(" Analysis\n"), Some(TaskCategory::Analysis));
        assert_eq!(TaskCategory::from_label("code review"), Some(TaskCategory::CodeReview));
        assert_eq!(TaskCategory::from_label("code-review."), Some(TaskCategory::CodeReview));
        assert_eq!(TaskCategory::from_label("poetry"), None);
        assert_eq!(TaskCategory::from_label(""), None);
    }

    #[test]
    fn test_chat_message_wire_format() {
        let msg = ChatMessage::assistant("hi", HandlerId::new("chat"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["agent_type"], "chat");
        assert!(json.get("metadata").is_none());

        let user = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert!(user.get("agent_type").is_none());
    }

    #[test]
    fn test_stream_event_wire_format() {
        let event = StreamEvent::chunk("Hel", HandlerId::new("chat"));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"chunk","content":"Hel","agent":"chat"}"#);
    }

    #[test]
    fn test_response_map_keeps_insertion_order() {
        let mut map = ResponseMap::new();
        map.insert(HandlerId::new("grading"), "B+");
        map.insert(HandlerId::new("formatting"), "# Report");
        map.insert(HandlerId::new("chat"), "notes");
        map.insert(HandlerId::new("grading"), "A-");

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r##"{"grading":"A-","formatting":"# Report","chat":"notes"}"##);

        let parsed: ResponseMap = serde_json::from_str(&json).unwrap();
        let keys: Vec<&str> = parsed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(keys, vec!["grading", "formatting", "chat"]);
    }
}
