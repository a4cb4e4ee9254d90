use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique request identifier, one per `Orchestrator::run` call.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior turn of the conversation, fed to the decomposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// What the engine knows about the user, summarised for prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Free-form notes, e.g. "boss: dana@acme.com".
    #[serde(default)]
    pub notes: Vec<String>,
}

impl UserContext {
    /// One-paragraph summary used inside prompts.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(format!("Name: {}", name));
        }
        if let Some(email) = &self.email {
            parts.push(format!("Email: {}", email));
        }
        if let Some(tz) = &self.timezone {
            parts.push(format!("Timezone: {}", tz));
        }
        for note in &self.notes {
            parts.push(note.clone());
        }
        if parts.is_empty() {
            "(no user context)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Neutral,
    Friendly,
    Formal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Brief,
    #[default]
    Normal,
    Detailed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Prose,
    Bullets,
    Markdown,
}

/// How the final answer should read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub format: ResponseFormat,
}

/// A single language-model call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// JSON schema the output must satisfy (strict mode when set).
    pub schema: Option<serde_json::Value>,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn text(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            schema: None,
            max_tokens,
        }
    }

    pub fn structured(prompt: impl Into<String>, schema: serde_json::Value, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            schema: Some(schema),
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Result of a language-model call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub raw: String,
    /// Parsed JSON, present when the request carried a schema.
    pub parsed: Option<serde_json::Value>,
    pub tokens_used: u64,
}

/// Which source an item came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    #[default]
    Email,
    Calendar,
    Contact,
    Chat,
}

/// One email, calendar event, contact card, or chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub source: ItemSource,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub unread: bool,
    pub timestamp: DateTime<Utc>,
}

/// A full conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub messages: Vec<Item>,
}

/// Structural filter over items. Unset fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataCriteria {
    #[serde(default)]
    pub source: Option<ItemSource>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub unread: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Free-text query over item bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeywordQuery {
    pub query: String,
    #[serde(default)]
    pub source: Option<ItemSource>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Lifecycle status of one graph node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// How a node failure affects the nodes that depend on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Dependents are skipped without running.
    Fatal,
    /// Dependents run; references to the failed node resolve to null.
    Recoverable,
}

/// Final status of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    AwaitingConfirmation,
    Aborted,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A validated plan is ready.
    PlanReady {
        request_id: RequestId,
        nodes: usize,
        est_tokens: u64,
    },
    /// The plan exceeded the budget and awaits confirmation.
    ConfirmationRequired { request_id: RequestId, plan_id: String },
    /// A stage is about to run.
    StageStarted {
        request_id: RequestId,
        stage: u32,
        nodes: Vec<String>,
    },
    /// A node reached a terminal status.
    NodeFinished {
        request_id: RequestId,
        node_id: String,
        status: NodeStatus,
        elapsed_ms: u64,
    },
    /// The request finished.
    RunFinished {
        request_id: RequestId,
        status: RunStatus,
        total_tokens: u64,
    },
}

impl EngineEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::PlanReady { request_id, .. }
            | Self::ConfirmationRequired { request_id, .. }
            | Self::StageStarted { request_id, .. }
            | Self::NodeFinished { request_id, .. }
            | Self::RunFinished { request_id, .. } => request_id,
        }
    }

    /// Last event published for a request.
    pub fn ends_run(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}
