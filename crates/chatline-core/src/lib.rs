use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod wire;

/// Status carried by the control fragment that ends a streaming turn.
pub const STATUS_COMPLETE: &str = "complete";
pub const BLOCK_TEXT: &str = "text";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Command,
    Error,
}

impl Default for Role {
    fn default() -> Self {
        Self::Assistant
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Command => "command",
            Role::Error => "error",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "command" => Ok(Role::Command),
            "error" => Ok(Role::Error),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// One typed block of message content. Only `text` blocks are merged by
/// concatenation; every other kind is carried through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: BLOCK_TEXT.to_string(),
            text: Some(text.into()),
            extra: Map::new(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == BLOCK_TEXT
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            self.text.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "deserialize_map_or_null")]
    pub meta_data: Map<String, Value>,
}

impl Message {
    /// Composes an outbound user message with a fresh id.
    pub fn user_text(
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        meta_data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            status: None,
            conversation_id: conversation_id.into(),
            created_at: None,
            meta_data,
        }
    }

    /// Concatenation of every text block, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .concat()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub messages: Vec<Message>,
    #[serde(default, deserialize_with = "deserialize_map_or_null")]
    pub meta_data: Map<String, Value>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            created_at: None,
            updated_at: None,
            messages: Vec::new(),
            meta_data: Map::new(),
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }
}

/// Inbound wire unit. Every field is optional on the wire; `classify` turns it
/// into something the merger can act on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub meta_data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentKind {
    /// Ends the current streaming turn; carries no mergeable content.
    Complete,
    /// Backend-reported failure for the current turn.
    Error { text: String },
    /// Content to merge into the store.
    Delta(Message),
    /// Content for which no conversation could be resolved.
    Orphan { id: Option<String> },
}

impl Fragment {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some(STATUS_COMPLETE)
    }

    pub fn is_error(&self) -> bool {
        self.role == Some(Role::Error)
    }

    /// Resolves the fragment against the conversation currently in view when
    /// the frame itself does not name one.
    pub fn classify(self, fallback_conversation: Option<&str>) -> FragmentKind {
        if self.is_error() {
            let text = self
                .content
                .iter()
                .find_map(ContentBlock::as_text)
                .map(str::to_string)
                .unwrap_or_else(|| "unknown backend error".to_string());
            return FragmentKind::Error { text };
        }
        if self.is_complete() {
            return FragmentKind::Complete;
        }
        let conversation_id = match self
            .conversation_id
            .or_else(|| fallback_conversation.map(str::to_string))
        {
            Some(value) => value,
            None => return FragmentKind::Orphan { id: self.id },
        };
        FragmentKind::Delta(Message {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            role: self.role.unwrap_or_default(),
            content: self.content,
            status: self.status,
            conversation_id,
            created_at: self.created_at,
            meta_data: self.meta_data.unwrap_or_default(),
        })
    }
}

impl From<Message> for Fragment {
    fn from(message: Message) -> Self {
        Self {
            id: Some(message.id),
            role: Some(message.role),
            content: message.content,
            status: message.status,
            conversation_id: Some(message.conversation_id),
            created_at: message.created_at,
            meta_data: Some(message.meta_data),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Percentage (0..=100), as edited in the settings panel.
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models: vec!["GPT-4".to_string(), "Claude Haiku".to_string()],
            current_model: Some("GPT-4".to_string()),
            custom_instructions: Some("You are a helpful assistant.".to_string()),
            max_tokens: Some(5000),
            temperature: Some(70.0),
        }
    }
}

impl Settings {
    pub fn model(&self) -> Option<&str> {
        self.current_model
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
    }

    /// The `meta_data.llm` object the backend reads from every user message.
    pub fn llm_meta(&self) -> Value {
        let mut llm = Map::new();
        if let Some(model) = self.model() {
            llm.insert("model".to_string(), Value::from(model));
        }
        if let Some(max_tokens) = self.max_tokens {
            llm.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = self.temperature {
            llm.insert("temperature".to_string(), Value::from(temperature / 100.0));
        }
        if let Some(instructions) = &self.custom_instructions {
            llm.insert("instructions".to_string(), Value::from(instructions.clone()));
        }
        Value::Object(llm)
    }

    pub fn outbound_meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("llm".to_string(), self.llm_meta());
        meta
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
    Warning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
            NotificationKind::Info => "info",
            NotificationKind::Warning => "warning",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: Option<NotificationKind>,
}

impl Notification {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, message)
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.message.is_empty()
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_map_or_null<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}
