use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{
    CallerIdentity, ChatMetadata, DeletedMessage, EventLogEntry, EventPayload, HistoryPage,
    HistoryRecord, Message, Profile, Revision, SessionError, SessionErrorCategory, StoredEntry,
};
use tracing::{debug, trace};

const BASE_TIMESTAMP_MS: u64 = 1_731_000_000_000;
const DEFAULT_LOG_BATCH_LIMIT: usize = 100;

/// Remote chat API consumed by a session.
///
/// Every call carries the caller identity; implementations authenticate with
/// it and the session never inspects it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Load conversation metadata and membership.
    async fn get_conversation(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
    ) -> Result<ChatMetadata, SessionError>;

    /// Load one page of history, newest first.
    async fn get_history(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<HistoryPage, SessionError>;

    /// Read the cross-conversation event log after `cursor`.
    async fn get_event_log(
        &self,
        caller: &CallerIdentity,
        cursor: Option<&Revision>,
    ) -> Result<Vec<EventLogEntry>, SessionError>;

    /// Post a message and return the confirmed record.
    async fn send_message(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, SessionError>;
}

/// Identifies a [`ChatApi`] method for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    GetConversation,
    GetHistory,
    GetEventLog,
    SendMessage,
}

#[derive(Debug, Clone)]
struct ConversationRecord {
    metadata: ChatMetadata,
    /// Oldest first.
    history: Vec<StoredEntry>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    conversations: HashMap<String, ConversationRecord>,
    log: Vec<(u64, EventLogEntry)>,
    next_seq: u64,
    next_message_id: u64,
    credentials: HashSet<String>,
    failures: HashMap<ApiCall, VecDeque<SessionError>>,
    calls: HashMap<ApiCall, usize>,
    latency: Duration,
    log_batch_limit: Option<usize>,
}

impl InMemoryState {
    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn allocate_message_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("msg-{}", self.next_message_id)
    }

    fn conversation_mut(
        &mut self,
        conversation_id: &str,
    ) -> Result<&mut ConversationRecord, SessionError> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| conversation_not_found(conversation_id))
    }

    fn post(
        &mut self,
        conversation_id: &str,
        sender: Profile,
        content: &str,
    ) -> Result<Message, SessionError> {
        let seq = self.allocate_seq();
        let revision = revision_for(seq)?;
        let id = self.allocate_message_id();
        let message = Message {
            id,
            conversation_id: conversation_id.to_owned(),
            sender,
            content: content.to_owned(),
            created_at_ms: timestamp_for(seq),
            revision: Some(revision.clone()),
        };

        self.conversation_mut(conversation_id)?
            .history
            .push(StoredEntry::Message(message.clone()));
        self.log.push((
            seq,
            EventLogEntry {
                conversation_id: conversation_id.to_owned(),
                revision: Some(revision),
                payload: EventPayload::CreateMessage {
                    message: message.clone(),
                },
            },
        ));
        Ok(message)
    }
}

/// In-process chat service with a shared event log across conversations.
///
/// Revisions are zero-padded sequence numbers, so they sort the same way as
/// strings and as numbers. With no authorized credentials registered every
/// caller is accepted.
#[derive(Clone, Default)]
pub struct InMemoryChatApi {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation. Replaces any existing one with the same ID.
    pub fn create_conversation(&self, metadata: ChatMetadata) -> Result<(), SessionError> {
        let mut state = self.write()?;
        state.conversations.insert(
            metadata.conversation_id.clone(),
            ConversationRecord {
                metadata,
                history: Vec::new(),
            },
        );
        Ok(())
    }

    /// Accept calls carrying this credential; others fail with `Auth`.
    pub fn authorize(&self, credential: impl Into<String>) -> Result<(), SessionError> {
        self.write()?.credentials.insert(credential.into());
        Ok(())
    }

    /// Post a message as another participant. Lands in history and the log.
    pub fn post_message(
        &self,
        conversation_id: &str,
        sender: Profile,
        content: &str,
    ) -> Result<Message, SessionError> {
        self.write()?.post(conversation_id, sender, content)
    }

    /// Delete a message, leaving a tombstone in history and a log entry.
    pub fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<DeletedMessage, SessionError> {
        let mut state = self.write()?;
        let seq = state.allocate_seq();
        let revision = revision_for(seq)?;
        let conversation = state.conversation_mut(conversation_id)?;
        let slot = conversation
            .history
            .iter_mut()
            .find(|entry| entry.id() == message_id)
            .ok_or_else(|| {
                SessionError::new(
                    SessionErrorCategory::NotFound,
                    "message_not_found",
                    format!("message not found: {message_id}"),
                )
            })?;

        let deleted = DeletedMessage {
            id: message_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            sender: slot.sender().clone(),
            deleted_at_ms: timestamp_for(seq),
            revision: Some(revision.clone()),
        };
        *slot = StoredEntry::DeletedMessage(deleted.clone());

        state.log.push((
            seq,
            EventLogEntry {
                conversation_id: conversation_id.to_owned(),
                revision: Some(revision),
                payload: EventPayload::DeleteMessage {
                    message: deleted.clone(),
                },
            },
        ));
        Ok(deleted)
    }

    /// Append an arbitrary log entry, for kinds this service never produces
    /// on its own. Without `with_revision` the entry carries no revision.
    pub fn append_log_entry(
        &self,
        conversation_id: &str,
        payload: EventPayload,
        with_revision: bool,
    ) -> Result<Option<Revision>, SessionError> {
        let mut state = self.write()?;
        let seq = state.allocate_seq();
        let revision = if with_revision {
            Some(revision_for(seq)?)
        } else {
            None
        };
        state.log.push((
            seq,
            EventLogEntry {
                conversation_id: conversation_id.to_owned(),
                revision: revision.clone(),
                payload,
            },
        ));
        Ok(revision)
    }

    /// Make the next call of `call` fail with `error`. Failures queue up.
    pub fn fail_next(&self, call: ApiCall, error: SessionError) -> Result<(), SessionError> {
        self.write()?
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
        Ok(())
    }

    /// Delay applied before every call completes.
    pub fn set_latency(&self, latency: Duration) -> Result<(), SessionError> {
        self.write()?.latency = latency;
        Ok(())
    }

    /// Cap the number of entries returned per event-log read.
    pub fn set_log_batch_limit(&self, limit: usize) -> Result<(), SessionError> {
        self.write()?.log_batch_limit = Some(limit.max(1));
        Ok(())
    }

    /// How many times `call` was issued.
    pub fn call_count(&self, call: ApiCall) -> usize {
        self.read()
            .map(|state| state.calls.get(&call).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Current history of a conversation, oldest first.
    pub fn history(&self, conversation_id: &str) -> Result<Vec<StoredEntry>, SessionError> {
        let state = self.read()?;
        state
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.history.clone())
            .ok_or_else(|| conversation_not_found(conversation_id))
    }

    /// Count the call, wait out the latency, then run the admission checks.
    async fn begin_call(
        &self,
        call: ApiCall,
        caller: &CallerIdentity,
    ) -> Result<(), SessionError> {
        let latency = {
            let mut state = self.write()?;
            *state.calls.entry(call).or_default() += 1;
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write()?;
        if let Some(error) = state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            debug!(?call, code = %error.code, "injected failure");
            return Err(error);
        }
        if !state.credentials.is_empty() && !state.credentials.contains(&caller.credential) {
            return Err(SessionError::new(
                SessionErrorCategory::Auth,
                "invalid_credential",
                format!("credential rejected for {}", caller.user_id),
            ));
        }
        trace!(?call, user_id = %caller.user_id, "call admitted");
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InMemoryState>, SessionError> {
        self.state.read().map_err(|_| poisoned_lock())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, InMemoryState>, SessionError> {
        self.state.write().map_err(|_| poisoned_lock())
    }
}

#[async_trait]
impl ChatApi for InMemoryChatApi {
    async fn get_conversation(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
    ) -> Result<ChatMetadata, SessionError> {
        self.begin_call(ApiCall::GetConversation, caller).await?;
        let state = self.read()?;
        state
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.metadata.clone())
            .ok_or_else(|| conversation_not_found(conversation_id))
    }

    async fn get_history(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<HistoryPage, SessionError> {
        self.begin_call(ApiCall::GetHistory, caller).await?;
        let anchor = match cursor {
            Some(raw) => Some(raw.parse::<usize>().map_err(|err| invalid_cursor(raw, &err))?),
            None => None,
        };
        let limit = usize::from(limit.max(1));

        let state = self.read()?;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| conversation_not_found(conversation_id))?;

        // History is append-only and deletions replace in place, so a
        // position stays valid while newer messages arrive.
        let end = anchor.map_or(conversation.history.len(), |anchor| {
            anchor.min(conversation.history.len())
        });
        let start = end.saturating_sub(limit);

        let records: Vec<HistoryRecord> = conversation.history[start..end]
            .iter()
            .rev()
            .cloned()
            .map(|entry| match entry {
                StoredEntry::Message(message) => HistoryRecord::Message(message),
                StoredEntry::DeletedMessage(deleted) => HistoryRecord::DeletedMessage(deleted),
            })
            .collect();

        let next_cursor = (start > 0).then(|| start.to_string());

        Ok(HistoryPage {
            records,
            next_cursor,
        })
    }

    async fn get_event_log(
        &self,
        caller: &CallerIdentity,
        cursor: Option<&Revision>,
    ) -> Result<Vec<EventLogEntry>, SessionError> {
        self.begin_call(ApiCall::GetEventLog, caller).await?;
        let after = match cursor {
            Some(revision) => revision
                .as_str()
                .parse::<u64>()
                .map_err(|err| invalid_cursor(revision.as_str(), &err))?,
            None => 0,
        };

        let state = self.read()?;
        let limit = state.log_batch_limit.unwrap_or(DEFAULT_LOG_BATCH_LIMIT);
        Ok(state
            .log
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn send_message(
        &self,
        caller: &CallerIdentity,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, SessionError> {
        self.begin_call(ApiCall::SendMessage, caller).await?;
        let mut state = self.write()?;
        let sender = state
            .conversations
            .get(conversation_id)
            .and_then(|conversation| conversation.metadata.participant(&caller.user_id))
            .cloned()
            .unwrap_or_else(|| Profile::bare(caller.user_id.clone()));
        state.post(conversation_id, sender, content)
    }
}

fn revision_for(seq: u64) -> Result<Revision, SessionError> {
    Revision::parse(format!("{seq:012}")).ok_or_else(|| {
        SessionError::new(
            SessionErrorCategory::Internal,
            "invalid_revision",
            format!("could not build revision for sequence {seq}"),
        )
    })
}

fn timestamp_for(seq: u64) -> u64 {
    BASE_TIMESTAMP_MS + seq * 1_000
}

fn conversation_not_found(conversation_id: &str) -> SessionError {
    SessionError::new(
        SessionErrorCategory::NotFound,
        "conversation_not_found",
        format!("conversation not found: {conversation_id}"),
    )
}

fn invalid_cursor(raw: &str, err: &std::num::ParseIntError) -> SessionError {
    SessionError::new(
        SessionErrorCategory::Config,
        "invalid_cursor",
        format!("invalid cursor '{raw}': {err}"),
    )
}

fn poisoned_lock() -> SessionError {
    SessionError::new(
        SessionErrorCategory::Internal,
        "poisoned_lock",
        "in-memory chat state lock is poisoned",
    )
}
