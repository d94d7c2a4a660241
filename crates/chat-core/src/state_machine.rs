use crate::{
    cursor::{EventsCursor, HistoryCursor, Revision},
    error::SessionError,
    normalization::{HistoryApplied, IngestSummary, apply_event_batch, apply_history_page},
    timeline::ConversationTimeline,
    types::{
        ChatMetadata, EventLogEntry, HistoryPage, Message, OperationFailure, PendingMessage,
        PendingStatus, SessionOperation, SessionSnapshot, SessionStatus, StoredEntry,
    },
};

/// Session lifecycle. Stores and cursors only exist once `Ready`.
#[derive(Debug, Clone, Default)]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready(Box<ReadySession>),
    Error(SessionError),
    Destroyed,
}

/// A history page request handed out by [`ReadySession::begin_backfill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillTicket {
    /// Continuation token, `None` for the first page.
    pub cursor: Option<String>,
    /// Whether history is already loaded, in which case the fetch is paced.
    pub paced: bool,
}

/// State of an initialized session.
#[derive(Debug, Clone)]
pub struct ReadySession {
    chat: ChatMetadata,
    timeline: ConversationTimeline,
    history_cursor: HistoryCursor,
    events_cursor: EventsCursor,
    fetching_history: bool,
    ingestion_in_flight: bool,
    last_failure: Option<OperationFailure>,
}

impl ReadySession {
    fn new(chat: ChatMetadata) -> Self {
        Self {
            chat,
            timeline: ConversationTimeline::default(),
            history_cursor: HistoryCursor::NotStarted,
            events_cursor: EventsCursor::default(),
            fetching_history: false,
            ingestion_in_flight: false,
            last_failure: None,
        }
    }

    pub fn chat(&self) -> &ChatMetadata {
        &self.chat
    }

    pub fn timeline(&self) -> &ConversationTimeline {
        &self.timeline
    }

    pub fn history_cursor(&self) -> &HistoryCursor {
        &self.history_cursor
    }

    pub fn events_cursor(&self) -> &EventsCursor {
        &self.events_cursor
    }

    pub fn is_fetching_history(&self) -> bool {
        self.fetching_history
    }

    pub fn is_ingesting(&self) -> bool {
        self.ingestion_in_flight
    }

    pub fn last_failure(&self) -> Option<&OperationFailure> {
        self.last_failure.as_ref()
    }

    /// Claim the single backfill slot.
    ///
    /// Returns `None` when history is exhausted or a page is already in flight.
    pub fn begin_backfill(&mut self) -> Option<BackfillTicket> {
        if self.history_cursor.is_exhausted() || self.fetching_history {
            return None;
        }

        self.fetching_history = true;
        Some(BackfillTicket {
            cursor: self.history_cursor.request_token().map(ToOwned::to_owned),
            paced: !self.timeline.past().is_empty(),
        })
    }

    /// Apply a fetched page and release the backfill slot.
    pub fn finish_backfill(&mut self, page: HistoryPage) -> HistoryApplied {
        let (next, applied) =
            apply_history_page(&mut self.timeline, &mut self.events_cursor, page);
        self.history_cursor = next;
        self.fetching_history = false;
        self.clear_failure(&SessionOperation::Backfill);
        applied
    }

    /// Release the backfill slot after a failed fetch. The cursor is kept so
    /// the same page can be requested again.
    pub fn abort_backfill(&mut self, error: SessionError) -> OperationFailure {
        self.fetching_history = false;
        self.record_failure(SessionOperation::Backfill, error)
    }

    /// Claim the single ingestion slot and return the position to read from.
    ///
    /// Returns `None` while another ingestion is in flight.
    pub fn begin_ingestion(&mut self) -> Option<Option<Revision>> {
        if self.ingestion_in_flight {
            return None;
        }
        self.ingestion_in_flight = true;
        Some(self.events_cursor.current().cloned())
    }

    /// Apply a fetched event-log batch and release the ingestion slot.
    pub fn finish_ingestion(&mut self, entries: Vec<EventLogEntry>) -> IngestSummary {
        let summary = apply_event_batch(
            &mut self.timeline,
            &mut self.events_cursor,
            &self.chat.conversation_id,
            entries,
        );
        self.ingestion_in_flight = false;
        self.clear_failure(&SessionOperation::Poll);
        summary
    }

    pub fn abort_ingestion(&mut self, error: SessionError) -> OperationFailure {
        self.ingestion_in_flight = false;
        self.record_failure(SessionOperation::Poll, error)
    }

    /// Show an optimistic entry for an outgoing message.
    pub fn add_pending(
        &mut self,
        correlation_id: impl Into<String>,
        content: impl Into<String>,
        created_at_ms: u64,
    ) {
        self.timeline.insert_pending(PendingMessage {
            correlation_id: correlation_id.into(),
            content: content.into(),
            created_at_ms,
            status: PendingStatus::Sending,
        });
    }

    /// Swap an optimistic entry for the server-confirmed message.
    ///
    /// The sender is the caller's own profile from the cached membership,
    /// falling back to the profile the server returned.
    pub fn confirm_send(
        &mut self,
        correlation_id: &str,
        caller_user_id: &str,
        mut message: Message,
    ) {
        if let Some(profile) = self.chat.participant(caller_user_id) {
            message.sender = profile.clone();
        }
        self.timeline.insert_live(StoredEntry::Message(message));
        self.timeline.remove_pending(correlation_id);
        self.clear_failure(&SessionOperation::Send {
            correlation_id: correlation_id.to_owned(),
        });
    }

    /// Mark an optimistic entry as failed so it can be retried or discarded.
    pub fn fail_send(&mut self, correlation_id: &str, error: SessionError) -> OperationFailure {
        if let Some(pending) = self.timeline.pending_mut(correlation_id) {
            pending.status = PendingStatus::Failed {
                error: error.clone(),
            };
        }
        self.record_failure(
            SessionOperation::Send {
                correlation_id: correlation_id.to_owned(),
            },
            error,
        )
    }

    /// Move a failed entry back to `Sending` and return its content.
    ///
    /// Returns `None` for unknown entries and entries still sending.
    pub fn begin_retry(&mut self, correlation_id: &str) -> Option<String> {
        let pending = self.timeline.pending_mut(correlation_id)?;
        if !pending.is_failed() {
            return None;
        }
        pending.status = PendingStatus::Sending;
        Some(pending.content.clone())
    }

    /// Drop a failed entry. Entries still sending are left alone.
    pub fn discard_failed(&mut self, correlation_id: &str) -> bool {
        let failed = self
            .timeline
            .pending()
            .get(correlation_id)
            .is_some_and(PendingMessage::is_failed);
        if !failed {
            return false;
        }
        self.timeline.remove_pending(correlation_id);
        self.clear_failure(&SessionOperation::Send {
            correlation_id: correlation_id.to_owned(),
        });
        true
    }

    fn record_failure(
        &mut self,
        operation: SessionOperation,
        error: SessionError,
    ) -> OperationFailure {
        let failure = OperationFailure { operation, error };
        self.last_failure = Some(failure.clone());
        failure
    }

    fn clear_failure(&mut self, operation: &SessionOperation) {
        let clears = self.last_failure.as_ref().is_some_and(|failure| {
            match (&failure.operation, operation) {
                (
                    SessionOperation::Send { correlation_id: a },
                    SessionOperation::Send { correlation_id: b },
                ) => a == b,
                (failed, succeeded) => failed.same_kind(succeeded),
            }
        });
        if clears {
            self.last_failure = None;
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::Ready {
            chat: self.chat.clone(),
            items: self.timeline.project(),
            is_fetching_history: self.fetching_history,
            has_more_history: !self.history_cursor.is_exhausted(),
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Lifecycle state machine: `Uninitialized -> Initializing -> {Ready, Error}`,
/// and any non-terminal phase `-> Destroyed`.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    phase: SessionPhase,
}

impl SessionStateMachine {
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn status(&self) -> SessionStatus {
        match self.phase {
            SessionPhase::Uninitialized => SessionStatus::Uninitialized,
            SessionPhase::Initializing => SessionStatus::Initializing,
            SessionPhase::Ready(_) => SessionStatus::Ready,
            SessionPhase::Error(_) => SessionStatus::Error,
            SessionPhase::Destroyed => SessionStatus::Destroyed,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.phase, SessionPhase::Destroyed)
    }

    pub fn ready(&self) -> Option<&ReadySession> {
        match &self.phase {
            SessionPhase::Ready(ready) => Some(&**ready),
            _ => None,
        }
    }

    pub fn ready_mut(&mut self) -> Option<&mut ReadySession> {
        match &mut self.phase {
            SessionPhase::Ready(ready) => Some(&mut **ready),
            _ => None,
        }
    }

    pub fn begin_initialize(&mut self) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Uninitialized => {
                self.phase = SessionPhase::Initializing;
                Ok(())
            }
            _ => Err(self.invalid("initialize")),
        }
    }

    pub fn complete_initialize(&mut self, chat: ChatMetadata) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Initializing => {
                self.phase = SessionPhase::Ready(Box::new(ReadySession::new(chat)));
                Ok(())
            }
            _ => Err(self.invalid("complete_initialize")),
        }
    }

    /// Enter the terminal `Error` phase, keeping the failure as reported.
    pub fn fail_initialize(&mut self, error: SessionError) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Initializing => {
                self.phase = SessionPhase::Error(error);
                Ok(())
            }
            _ => Err(self.invalid("fail_initialize")),
        }
    }

    /// Enter `Destroyed` from any non-terminal phase.
    ///
    /// Returns `true` when the phase changed.
    pub fn destroy(&mut self) -> bool {
        match self.phase {
            SessionPhase::Uninitialized | SessionPhase::Initializing | SessionPhase::Ready(_) => {
                self.phase = SessionPhase::Destroyed;
                true
            }
            SessionPhase::Error(_) | SessionPhase::Destroyed => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match &self.phase {
            SessionPhase::Uninitialized => SessionSnapshot::Uninitialized,
            SessionPhase::Initializing => SessionSnapshot::Initializing,
            SessionPhase::Ready(ready) => ready.snapshot(),
            SessionPhase::Error(error) => SessionSnapshot::Error {
                error: error.clone(),
            },
            SessionPhase::Destroyed => SessionSnapshot::Destroyed,
        }
    }

    fn invalid(&self, action: &str) -> SessionError {
        SessionError::invalid_state(self.status().as_str(), action)
    }
}
