use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{cursor::Revision, error::SessionError};

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HISTORY_PAGE_SIZE: u16 = 20;
const DEFAULT_HISTORY_PACING_MS: u64 = 500;
const DEFAULT_SEND_PACING_MS: u64 = 500;
const DEFAULT_EVENT_BUFFER: usize = 64;
const MAX_HISTORY_PAGE_SIZE: u16 = 100;

/// Public profile of a conversation participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Stable user ID.
    pub user_id: String,
    /// Best-effort display name.
    pub display_name: Option<String>,
}

impl Profile {
    /// Profile carrying only a user ID.
    pub fn bare(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

/// Conversation metadata snapshot returned by `get_conversation`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMetadata {
    /// Conversation ID.
    pub conversation_id: String,
    /// Optional conversation title.
    pub title: Option<String>,
    /// Current membership.
    pub participants: Vec<Profile>,
}

impl ChatMetadata {
    /// Look up a participant by user ID.
    pub fn participant(&self, user_id: &str) -> Option<&Profile> {
        self.participants
            .iter()
            .find(|profile| profile.user_id == user_id)
    }
}

/// Who is calling the chat service. The credential is forwarded untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// User ID of the session owner.
    pub user_id: String,
    /// Opaque credential attached to every collaborator call.
    pub credential: String,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerIdentity")
            .field("user_id", &self.user_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Server-confirmed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned message ID, unique within the conversation.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Sender profile.
    pub sender: Profile,
    /// Message text.
    pub content: String,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Revision of the log entry that produced this record, when known.
    #[serde(default)]
    pub revision: Option<Revision>,
}

/// Tombstone left behind by a deleted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedMessage {
    /// ID of the deleted message.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Original sender profile.
    pub sender: Profile,
    /// Deletion timestamp in milliseconds since Unix epoch.
    pub deleted_at_ms: u64,
    /// Revision of the log entry that produced this record, when known.
    #[serde(default)]
    pub revision: Option<Revision>,
}

/// Entry held by the past/live message stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoredEntry {
    Message(Message),
    DeletedMessage(DeletedMessage),
}

impl StoredEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Message(message) => &message.id,
            Self::DeletedMessage(deleted) => &deleted.id,
        }
    }

    pub fn revision(&self) -> Option<&Revision> {
        match self {
            Self::Message(message) => message.revision.as_ref(),
            Self::DeletedMessage(deleted) => deleted.revision.as_ref(),
        }
    }

    pub fn sender(&self) -> &Profile {
        match self {
            Self::Message(message) => &message.sender,
            Self::DeletedMessage(deleted) => &deleted.sender,
        }
    }
}

/// One record of a history page. Unrecognized shapes decode as `Unknown`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HistoryRecord {
    Message(Message),
    DeletedMessage(DeletedMessage),
    #[serde(other)]
    Unknown,
}

impl HistoryRecord {
    /// Storable form of the record, or `None` for unrecognized shapes.
    pub fn into_entry(self) -> Option<StoredEntry> {
        match self {
            Self::Message(message) => Some(StoredEntry::Message(message)),
            Self::DeletedMessage(deleted) => Some(StoredEntry::DeletedMessage(deleted)),
            Self::Unknown => None,
        }
    }
}

/// One page of conversation history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryPage {
    /// Records in the order the service returned them.
    pub records: Vec<HistoryRecord>,
    /// Continuation token; absent or empty when no more pages exist.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Payload of an event-log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// A message was created.
    CreateMessage { message: Message },
    /// A message was deleted.
    DeleteMessage { message: DeletedMessage },
    /// Any other log kind; ignored.
    #[serde(other)]
    Unknown,
}

/// Entry of the cross-conversation event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventLogEntry {
    /// Conversation the entry belongs to.
    pub conversation_id: String,
    /// Position of the entry in the log.
    #[serde(default)]
    pub revision: Option<Revision>,
    /// Entry payload.
    pub payload: EventPayload,
}

/// Delivery state of an optimistic outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PendingStatus {
    /// Request not yet answered.
    Sending,
    /// The request failed; the entry can be retried or discarded.
    Failed { error: SessionError },
}

/// Locally synthesized message shown before the server confirms it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    /// Locally generated correlation ID.
    pub correlation_id: String,
    /// Outgoing text.
    pub content: String,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Delivery state.
    pub status: PendingStatus,
}

impl PendingMessage {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, PendingStatus::Failed { .. })
    }
}

/// Rendered item, newest first. Derived on every read, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TimelineItem {
    Message {
        key: String,
        message: Message,
        /// Chronologically next confirmed entry, used to group same-sender runs.
        next_message: Option<StoredEntry>,
    },
    DeletedMessage {
        key: String,
        message: DeletedMessage,
        next_message: Option<StoredEntry>,
    },
    PendingMessage {
        key: String,
        message: PendingMessage,
    },
}

impl TimelineItem {
    pub fn key(&self) -> &str {
        match self {
            Self::Message { key, .. }
            | Self::DeletedMessage { key, .. }
            | Self::PendingMessage { key, .. } => key,
        }
    }

    /// Confirmed payload of this item; `None` for pending items.
    pub fn confirmed(&self) -> Option<StoredEntry> {
        match self {
            Self::Message { message, .. } => Some(StoredEntry::Message(message.clone())),
            Self::DeletedMessage { message, .. } => {
                Some(StoredEntry::DeletedMessage(message.clone()))
            }
            Self::PendingMessage { .. } => None,
        }
    }

    pub fn next_message(&self) -> Option<&StoredEntry> {
        match self {
            Self::Message { next_message, .. } | Self::DeletedMessage { next_message, .. } => {
                next_message.as_ref()
            }
            Self::PendingMessage { .. } => None,
        }
    }
}

impl From<StoredEntry> for TimelineItem {
    fn from(entry: StoredEntry) -> Self {
        match entry {
            StoredEntry::Message(message) => Self::Message {
                key: message.id.clone(),
                message,
                next_message: None,
            },
            StoredEntry::DeletedMessage(message) => Self::DeletedMessage {
                key: message.id.clone(),
                message,
                next_message: None,
            },
        }
    }
}

impl From<PendingMessage> for TimelineItem {
    fn from(message: PendingMessage) -> Self {
        Self::PendingMessage {
            key: message.correlation_id.clone(),
            message,
        }
    }
}

/// Asynchronous operation that can fail without ending the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionOperation {
    Backfill,
    Poll,
    Send { correlation_id: String },
}

impl SessionOperation {
    /// Whether `other` is the same kind of operation.
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Recoverable failure reported to observers and kept in the `Ready` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationFailure {
    pub operation: SessionOperation,
    pub error: SessionError,
}

/// Notification emitted to session subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// State changed; re-read the snapshot.
    Changed,
    /// A backfill, poll or send failed. The session stays usable.
    OperationFailed(OperationFailure),
}

/// Coarse session status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Destroyed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Public state exposed to the consumer, one variant per status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionSnapshot {
    Uninitialized,
    Initializing,
    Ready {
        /// Conversation metadata captured at initialization.
        chat: ChatMetadata,
        /// Projected items, newest first.
        items: Vec<TimelineItem>,
        /// Whether a history page is being fetched.
        is_fetching_history: bool,
        /// Whether older history may still be requested.
        has_more_history: bool,
        /// Most recent unresolved recoverable failure.
        last_failure: Option<OperationFailure>,
    },
    Error {
        error: SessionError,
    },
    Destroyed,
}

impl SessionSnapshot {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Uninitialized => SessionStatus::Uninitialized,
            Self::Initializing => SessionStatus::Initializing,
            Self::Ready { .. } => SessionStatus::Ready,
            Self::Error { .. } => SessionStatus::Error,
            Self::Destroyed => SessionStatus::Destroyed,
        }
    }

    /// Projected items; empty outside `Ready`.
    pub fn items(&self) -> &[TimelineItem] {
        match self {
            Self::Ready { items, .. } => items,
            _ => &[],
        }
    }
}

/// Timing and sizing knobs for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Delay between event-log ingestion cycles.
    pub poll_interval_ms: u64,
    /// Records requested per history page.
    pub history_page_size: u16,
    /// Pause before fetching a page when history is already loaded.
    pub history_pacing_ms: u64,
    /// Pause between showing an optimistic entry and sending it.
    pub send_pacing_ms: u64,
    /// Capacity of the subscriber broadcast buffer.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            history_pacing_ms: DEFAULT_HISTORY_PACING_MS,
            send_pacing_ms: DEFAULT_SEND_PACING_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Clamp values into their supported ranges.
    ///
    /// Page size ends up in `1..=100`; the event buffer is at least 1.
    pub fn validated(mut self) -> Self {
        self.history_page_size = self.history_page_size.clamp(1, MAX_HISTORY_PAGE_SIZE);
        self.event_buffer = self.event_buffer.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn history_pacing(&self) -> Duration {
        Duration::from_millis(self.history_pacing_ms)
    }

    pub fn send_pacing(&self) -> Duration {
        Duration::from_millis(self.send_pacing_ms)
    }
}
