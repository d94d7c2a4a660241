//! Core of the chat session controller.
//!
//! This crate holds the synchronous domain: wire types, the lifecycle state
//! machine, message stores and their projection, cursor bookkeeping, and the
//! notification channel. The async controller lives in `chat-session`.

/// Session notification channel.
pub mod channel;
/// Revision and history cursors.
pub mod cursor;
/// Stable session error types.
pub mod error;
/// Folding history pages and event-log batches into a conversation.
pub mod normalization;
/// Session lifecycle state machine.
pub mod state_machine;
/// Ordered message stores and item projection.
pub mod timeline;
/// Collaborator payloads and consumer-facing snapshot types.
pub mod types;

pub use channel::{EventStream, SessionChannels};
pub use cursor::{EventsCursor, HistoryCursor, Revision};
pub use error::{SessionError, SessionErrorCategory};
pub use normalization::{HistoryApplied, IngestSummary, apply_event_batch, apply_history_page};
pub use state_machine::{BackfillTicket, ReadySession, SessionPhase, SessionStateMachine};
pub use timeline::{ConversationTimeline, Keyed, OrderedStore, StoreError};
pub use types::{
    CallerIdentity, ChatMetadata, DeletedMessage, EventLogEntry, EventPayload, HistoryPage,
    HistoryRecord, Message, OperationFailure, PendingMessage, PendingStatus, Profile,
    SessionConfig, SessionEvent, SessionOperation, SessionSnapshot, SessionStatus, StoredEntry,
    TimelineItem,
};
