//! Client-side controller for one conversation.
//!
//! A [`ChatSession`] loads the conversation, backfills history in pages,
//! polls the shared event log for live changes and sends messages with an
//! optimistic pending entry. Consumers read [`ChatSession::state`] and
//! subscribe to change notifications.

mod poller;

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chat_core::{
    CallerIdentity, EventStream, ReadySession, Revision, SessionChannels, SessionConfig,
    SessionError, SessionSnapshot, SessionStateMachine, SessionStatus,
};
use chat_platform::ChatApi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::poller::RunningPoller;

pub use chat_core;
pub use chat_platform;

const CORRELATION_PREFIX: &str = "local-";

pub(crate) struct SessionInner {
    conversation_id: String,
    caller: CallerIdentity,
    api: Arc<dyn ChatApi>,
    config: SessionConfig,
    machine: Mutex<SessionStateMachine>,
    channels: SessionChannels,
    lifetime: CancellationToken,
    poller: Mutex<Option<RunningPoller>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Handle to a conversation session. Clones share the same session.
#[derive(Clone)]
pub struct ChatSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("conversation_id", &self.inner.conversation_id)
            .field("caller", &self.inner.caller)
            .field("status", &self.status())
            .finish()
    }
}

impl ChatSession {
    pub fn new(
        conversation_id: impl Into<String>,
        caller: CallerIdentity,
        api: Arc<dyn ChatApi>,
        config: SessionConfig,
    ) -> Self {
        let config = config.validated();
        Self {
            inner: Arc::new(SessionInner {
                conversation_id: conversation_id.into(),
                caller,
                api,
                channels: SessionChannels::new(config.event_buffer),
                config,
                machine: Mutex::new(SessionStateMachine::default()),
                lifetime: CancellationToken::new(),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current consumer-facing snapshot.
    pub fn state(&self) -> SessionSnapshot {
        self.with_machine(|machine| machine.snapshot())
    }

    pub fn status(&self) -> SessionStatus {
        self.with_machine(|machine| machine.status())
    }

    pub fn is_destroyed(&self) -> bool {
        self.with_machine(|machine| machine.is_destroyed())
    }

    /// Highest event-log revision observed so far.
    pub fn events_cursor(&self) -> Option<Revision> {
        self.with_machine(|machine| {
            machine
                .ready()
                .and_then(|ready| ready.events_cursor().current().cloned())
        })
    }

    /// Subscribe to change notifications and recoverable failures.
    pub fn subscribe(&self) -> EventStream {
        self.inner.channels.subscribe()
    }

    /// Load the conversation, fetch the first history page and start polling.
    ///
    /// Only the first call has an effect. A failure to load the conversation
    /// moves the session into the terminal `Error` state.
    pub async fn initialize(&self) {
        if let Err(err) = self.with_machine(|machine| machine.begin_initialize()) {
            debug!(
                conversation_id = %self.inner.conversation_id,
                code = %err.code,
                "ignoring initialize request"
            );
            return;
        }
        info!(
            conversation_id = %self.inner.conversation_id,
            user_id = %self.inner.caller.user_id,
            "initializing chat session"
        );
        self.notify_changed();

        let inner = &self.inner;
        let Some(result) = self
            .guarded(
                inner
                    .api
                    .get_conversation(&inner.caller, &inner.conversation_id),
            )
            .await
        else {
            debug!("session destroyed while loading conversation");
            return;
        };

        match result {
            Ok(chat) => {
                let participants = chat.participants.len();
                if self
                    .with_machine(|machine| machine.complete_initialize(chat))
                    .is_err()
                {
                    debug!("discarding conversation loaded after destroy");
                    return;
                }
                info!(
                    conversation_id = %inner.conversation_id,
                    participants,
                    "chat session ready"
                );
                self.notify_changed();

                self.fetch_message_history().await;
                self.start_poller();
            }
            Err(error) => {
                warn!(
                    conversation_id = %inner.conversation_id,
                    category = ?error.category,
                    code = %error.code,
                    "failed to load conversation"
                );
                if self
                    .with_machine(|machine| machine.fail_initialize(error))
                    .is_ok()
                {
                    self.notify_changed();
                }
            }
        }
    }

    /// Fetch the next older page of history.
    ///
    /// No-op unless the session is ready, history remains and no page is
    /// already in flight.
    pub async fn fetch_message_history(&self) {
        let Some(ticket) =
            self.with_machine(|machine| machine.ready_mut().and_then(ReadySession::begin_backfill))
        else {
            trace!("history backfill skipped");
            return;
        };
        self.notify_changed();

        if ticket.paced && !self.pause(self.inner.config.history_pacing()).await {
            return;
        }

        let inner = &self.inner;
        debug!(
            conversation_id = %inner.conversation_id,
            cursor = ?ticket.cursor,
            limit = inner.config.history_page_size,
            "fetching history page"
        );
        let Some(result) = self
            .guarded(inner.api.get_history(
                &inner.caller,
                &inner.conversation_id,
                ticket.cursor.as_deref(),
                inner.config.history_page_size,
            ))
            .await
        else {
            return;
        };

        match result {
            Ok(page) => {
                let applied = self.with_machine(|machine| {
                    machine.ready_mut().map(|ready| {
                        let applied = ready.finish_backfill(page);
                        (applied, ready.history_cursor().is_exhausted())
                    })
                });
                if let Some((applied, exhausted)) = applied {
                    debug!(
                        stored = applied.stored,
                        dropped = applied.dropped,
                        cursor_advanced = applied.cursor_advanced,
                        exhausted,
                        "history page applied"
                    );
                    self.notify_changed();
                }
            }
            Err(error) => {
                let failure = self.with_machine(|machine| {
                    machine
                        .ready_mut()
                        .map(|ready| ready.abort_backfill(error))
                });
                if let Some(failure) = failure {
                    warn!(
                        code = %failure.error.code,
                        recoverable = failure.error.is_recoverable(),
                        "history backfill failed"
                    );
                    self.inner.channels.notify_failed(failure);
                    self.notify_changed();
                }
            }
        }
    }

    /// Run one event-log ingestion now.
    ///
    /// Skipped while another ingestion is in flight, so poll cycles never
    /// overlap.
    pub async fn poll_events(&self) {
        let cursor = match self
            .with_machine(|machine| machine.ready_mut().map(ReadySession::begin_ingestion))
        {
            Some(Some(cursor)) => cursor,
            Some(None) => {
                trace!("ingestion already in flight");
                return;
            }
            None => return,
        };

        let inner = &self.inner;
        trace!(cursor = ?cursor, "reading event log");
        let Some(result) = self
            .guarded(inner.api.get_event_log(&inner.caller, cursor.as_ref()))
            .await
        else {
            return;
        };

        match result {
            Ok(entries) => {
                let received = entries.len();
                let summary = self.with_machine(|machine| {
                    machine
                        .ready_mut()
                        .map(|ready| ready.finish_ingestion(entries))
                });
                if let Some(summary) = summary {
                    if summary.malformed > 0 {
                        warn!(
                            malformed = summary.malformed,
                            "skipped event-log entries without a revision"
                        );
                    }
                    debug!(
                        received,
                        created = summary.created,
                        deleted = summary.deleted,
                        foreign = summary.foreign,
                        unknown_deletions = summary.unknown_deletions,
                        ignored = summary.ignored,
                        cursor_advanced = summary.cursor_advanced,
                        "event log ingested"
                    );
                    self.notify_changed();
                }
            }
            Err(error) => {
                let failure = self.with_machine(|machine| {
                    machine
                        .ready_mut()
                        .map(|ready| ready.abort_ingestion(error))
                });
                if let Some(failure) = failure {
                    warn!(
                        code = %failure.error.code,
                        recoverable = failure.error.is_recoverable(),
                        "event-log ingestion failed"
                    );
                    self.inner.channels.notify_failed(failure);
                    self.notify_changed();
                }
            }
        }
    }

    /// Send a message, showing it as pending until the server confirms it.
    ///
    /// Returns the correlation ID of the pending entry, or `None` when the
    /// request was ignored because the content is blank or the session is not
    /// ready.
    pub async fn send_message(&self, content: impl Into<String>) -> Option<String> {
        let content = content.into();
        if content.trim().is_empty() {
            debug!("ignoring blank message");
            return None;
        }

        let correlation_id = format!("{CORRELATION_PREFIX}{}", Uuid::new_v4());
        let added = self.with_machine(|machine| {
            machine
                .ready_mut()
                .map(|ready| {
                    ready.add_pending(correlation_id.as_str(), content.as_str(), now_millis());
                })
                .is_some()
        });
        if !added {
            debug!("ignoring send outside of a ready session");
            return None;
        }
        debug!(%correlation_id, "queued outgoing message");
        self.notify_changed();

        self.deliver(&correlation_id, &content).await;
        Some(correlation_id)
    }

    /// Send a failed message again. Returns `false` if `correlation_id` does
    /// not name a failed pending entry.
    pub async fn retry_send(&self, correlation_id: &str) -> bool {
        let Some(content) = self.with_machine(|machine| {
            machine
                .ready_mut()
                .and_then(|ready| ready.begin_retry(correlation_id))
        }) else {
            return false;
        };
        debug!(%correlation_id, "retrying outgoing message");
        self.notify_changed();

        self.deliver(correlation_id, &content).await;
        true
    }

    /// Drop a failed pending entry.
    pub fn discard_failed_send(&self, correlation_id: &str) -> bool {
        let discarded = self.with_machine(|machine| {
            machine
                .ready_mut()
                .is_some_and(|ready| ready.discard_failed(correlation_id))
        });
        if discarded {
            debug!(%correlation_id, "discarded failed message");
            self.notify_changed();
        }
        discarded
    }

    /// Tear the session down. Stops polling, abandons in-flight calls and
    /// drops stored state. Repeated calls are no-ops.
    pub fn destroy(&self) {
        let changed = self.with_machine(|machine| machine.destroy());
        self.inner.lifetime.cancel();

        let running = self.poller_slot().take();
        if let Some(running) = running {
            running.stop();
        }

        if changed {
            info!(conversation_id = %self.inner.conversation_id, "chat session destroyed");
            self.notify_changed();
        }
    }

    async fn deliver(&self, correlation_id: &str, content: &str) {
        if !self.pause(self.inner.config.send_pacing()).await {
            return;
        }

        let inner = &self.inner;
        let Some(result) = self
            .guarded(
                inner
                    .api
                    .send_message(&inner.caller, &inner.conversation_id, content),
            )
            .await
        else {
            return;
        };

        match result {
            Ok(message) => {
                let message_id = message.id.clone();
                let confirmed = self.with_machine(|machine| {
                    machine
                        .ready_mut()
                        .map(|ready| {
                            ready.confirm_send(correlation_id, &inner.caller.user_id, message)
                        })
                        .is_some()
                });
                if confirmed {
                    debug!(%correlation_id, %message_id, "message confirmed");
                    self.notify_changed();
                }
            }
            Err(error) => {
                let failure = self.with_machine(|machine| {
                    machine
                        .ready_mut()
                        .map(|ready| ready.fail_send(correlation_id, error))
                });
                if let Some(failure) = failure {
                    warn!(%correlation_id, code = %failure.error.code, "message send failed");
                    self.inner.channels.notify_failed(failure);
                    self.notify_changed();
                }
            }
        }
    }

    fn start_poller(&self) {
        if self.inner.lifetime.is_cancelled() {
            return;
        }

        let running = RunningPoller::spawn(
            &self.inner,
            self.inner.lifetime.child_token(),
            self.inner.config.poll_interval(),
        );
        let previous = self.poller_slot().replace(running);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Run `call` unless the session is torn down first.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, SessionError>>,
    ) -> Option<Result<T, SessionError>> {
        tokio::select! {
            biased;
            _ = self.inner.lifetime.cancelled() => None,
            result = call => Some(result),
        }
    }

    /// Sleep for `delay`. Returns `false` if the session was torn down.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.inner.lifetime.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.inner.lifetime.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn notify_changed(&self) {
        self.inner.channels.notify_changed();
    }

    /// The lock is never held across an await point.
    fn with_machine<R>(&self, f: impl FnOnce(&mut SessionStateMachine) -> R) -> R {
        let mut machine = self
            .inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut machine)
    }

    fn poller_slot(&self) -> MutexGuard<'_, Option<RunningPoller>> {
        self.inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{
        ChatMetadata, OperationFailure, PendingStatus, Profile, SessionErrorCategory,
        SessionEvent, SessionOperation, StoredEntry, TimelineItem,
    };
    use chat_platform::{ApiCall, InMemoryChatApi};
    use tokio::time::Instant;

    const CONVERSATION: &str = "c1";

    fn alice() -> Profile {
        Profile {
            user_id: "@alice".into(),
            display_name: Some("Alice".into()),
        }
    }

    fn bob() -> Profile {
        Profile {
            user_id: "@bob".into(),
            display_name: Some("Bob".into()),
        }
    }

    fn metadata(conversation_id: &str) -> ChatMetadata {
        ChatMetadata {
            conversation_id: conversation_id.into(),
            title: Some("General".into()),
            participants: vec![alice(), bob()],
        }
    }

    fn api() -> InMemoryChatApi {
        let api = InMemoryChatApi::new();
        api.create_conversation(metadata(CONVERSATION))
            .expect("create conversation");
        api.create_conversation(metadata("c2"))
            .expect("create conversation");
        api
    }

    fn session_with(api: &InMemoryChatApi, config: SessionConfig) -> ChatSession {
        ChatSession::new(
            CONVERSATION,
            CallerIdentity::new("@alice", "token-alice"),
            Arc::new(api.clone()),
            config,
        )
    }

    fn session(api: &InMemoryChatApi) -> ChatSession {
        session_with(api, SessionConfig::default())
    }

    fn post(api: &InMemoryChatApi, conversation_id: &str, content: &str) -> String {
        api.post_message(conversation_id, bob(), content)
            .expect("post message")
            .id
    }

    fn keys(snapshot: &SessionSnapshot) -> Vec<String> {
        snapshot
            .items()
            .iter()
            .map(|item| item.key().to_owned())
            .collect()
    }

    fn last_failure(snapshot: &SessionSnapshot) -> Option<OperationFailure> {
        match snapshot {
            SessionSnapshot::Ready { last_failure, .. } => last_failure.clone(),
            _ => None,
        }
    }

    fn has_more_history(snapshot: &SessionSnapshot) -> bool {
        matches!(
            snapshot,
            SessionSnapshot::Ready {
                has_more_history: true,
                ..
            }
        )
    }

    fn network_error() -> SessionError {
        SessionError::network("timeout", "request timed out")
    }

    async fn wait_until(
        session: &ChatSession,
        events: &mut EventStream,
        done: impl Fn(&SessionSnapshot) -> bool,
    ) {
        while !done(&session.state()) {
            events.recv().await.expect("session event");
        }
    }

    fn has_pending(snapshot: &SessionSnapshot) -> bool {
        snapshot
            .items()
            .iter()
            .any(|item| matches!(item, TimelineItem::PendingMessage { .. }))
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_loads_conversation_and_first_history_page() {
        let api = api();
        let first = post(&api, CONVERSATION, "one");
        let second = post(&api, CONVERSATION, "two");
        let session = session(&api);
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        session.initialize().await;

        let snapshot = session.state();
        match &snapshot {
            SessionSnapshot::Ready {
                chat,
                is_fetching_history,
                has_more_history,
                ..
            } => {
                assert_eq!(chat.title.as_deref(), Some("General"));
                assert!(!is_fetching_history);
                assert!(!has_more_history);
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }
        assert_eq!(keys(&snapshot), vec![second, first]);
        assert_eq!(api.call_count(ApiCall::GetConversation), 1);
        assert_eq!(api.call_count(ApiCall::GetHistory), 1);

        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_only_runs_once() {
        let api = api();
        let session = session(&api);

        session.initialize().await;
        session.initialize().await;

        assert_eq!(api.call_count(ApiCall::GetConversation), 1);
        assert_eq!(session.status(), SessionStatus::Ready);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialize_keeps_error_verbatim() {
        let api = api();
        let error = SessionError::new(SessionErrorCategory::Auth, "forbidden", "not a member");
        api.fail_next(ApiCall::GetConversation, error.clone())
            .expect("inject failure");
        let session = session(&api);

        session.initialize().await;

        assert_eq!(session.state(), SessionSnapshot::Error { error });
        assert_eq!(api.call_count(ApiCall::GetHistory), 0);

        session.destroy();
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_session_ignores_initialize() {
        let api = api();
        let session = session(&api);

        session.destroy();
        session.initialize().await;

        assert_eq!(session.state(), SessionSnapshot::Destroyed);
        assert_eq!(api.call_count(ApiCall::GetConversation), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_during_initialize_discards_the_result() {
        let api = api();
        api.set_latency(Duration::from_secs(1)).expect("latency");
        let session = session(&api);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        let mut events = session.subscribe();
        wait_until(&session, &mut events, |snapshot| {
            *snapshot == SessionSnapshot::Initializing
        })
        .await;

        session.destroy();
        task.await.expect("initialize task");

        assert_eq!(session.state(), SessionSnapshot::Destroyed);
        assert_eq!(api.call_count(ApiCall::GetHistory), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_pages_until_history_is_exhausted() {
        let api = api();
        let ids: Vec<String> = (0..5)
            .map(|n| post(&api, CONVERSATION, &format!("message {n}")))
            .collect();
        let session = session_with(
            &api,
            SessionConfig {
                history_page_size: 2,
                ..SessionConfig::default()
            },
        );

        session.initialize().await;
        assert_eq!(session.state().items().len(), 2);
        assert!(has_more_history(&session.state()));

        session.fetch_message_history().await;
        session.fetch_message_history().await;
        let snapshot = session.state();
        assert!(!has_more_history(&snapshot));

        let expected: Vec<String> = ids.into_iter().rev().collect();
        assert_eq!(keys(&snapshot), expected);
        assert_eq!(api.call_count(ApiCall::GetHistory), 3);

        session.fetch_message_history().await;
        assert_eq!(api.call_count(ApiCall::GetHistory), 3);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn later_history_pages_are_paced() {
        let api = api();
        for n in 0..3 {
            post(&api, CONVERSATION, &format!("message {n}"));
        }
        let session = session_with(
            &api,
            SessionConfig {
                history_page_size: 1,
                ..SessionConfig::default()
            },
        );
        session.initialize().await;

        let started = Instant::now();
        session.fetch_message_history().await;

        assert!(started.elapsed() >= session.config().history_pacing());
        assert_eq!(session.state().items().len(), 2);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_backfill_requests_issue_one_fetch() {
        let api = api();
        for n in 0..4 {
            post(&api, CONVERSATION, &format!("message {n}"));
        }
        let session = session_with(
            &api,
            SessionConfig {
                history_page_size: 2,
                ..SessionConfig::default()
            },
        );
        session.initialize().await;
        assert_eq!(api.call_count(ApiCall::GetHistory), 1);

        tokio::join!(
            session.fetch_message_history(),
            session.fetch_message_history()
        );

        assert_eq!(api.call_count(ApiCall::GetHistory), 2);
        assert_eq!(session.state().items().len(), 4);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_backfill_reports_and_allows_retry() {
        let api = api();
        for n in 0..3 {
            post(&api, CONVERSATION, &format!("message {n}"));
        }
        let session = session_with(
            &api,
            SessionConfig {
                history_page_size: 2,
                ..SessionConfig::default()
            },
        );
        session.initialize().await;
        api.fail_next(ApiCall::GetHistory, network_error())
            .expect("inject failure");
        let mut events = session.subscribe();

        session.fetch_message_history().await;

        let snapshot = session.state();
        assert!(matches!(
            snapshot,
            SessionSnapshot::Ready {
                is_fetching_history: false,
                ..
            }
        ));
        assert_eq!(
            last_failure(&snapshot).map(|failure| failure.operation),
            Some(SessionOperation::Backfill)
        );
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, SessionEvent::OperationFailed(_));
        }
        assert!(saw_failure);

        session.fetch_message_history().await;
        let snapshot = session.state();
        assert_eq!(snapshot.items().len(), 3);
        assert_eq!(last_failure(&snapshot), None);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn poller_picks_up_remote_messages() {
        let api = api();
        let session = session(&api);
        session.initialize().await;

        let remote = post(&api, CONVERSATION, "hello from bob");
        tokio::time::sleep(session.config().poll_interval() + Duration::from_millis(10)).await;

        let snapshot = session.state();
        assert_eq!(keys(&snapshot), vec![remote]);
        match &snapshot.items()[0] {
            TimelineItem::Message { message, .. } => assert_eq!(message.sender, bob()),
            other => panic!("unexpected item: {other:?}"),
        }
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_events_only_advance_the_cursor() {
        let api = api();
        let session = session(&api);
        session.initialize().await;

        post(&api, "c2", "elsewhere");
        session.poll_events().await;

        assert!(session.state().items().is_empty());
        let after_foreign = session.events_cursor().expect("cursor advanced");

        let local = post(&api, CONVERSATION, "here");
        session.poll_events().await;

        assert_eq!(keys(&session.state()), vec![local]);
        assert!(session.events_cursor().expect("cursor") > after_foreign);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_deletion_replaces_message_in_place() {
        let api = api();
        let older = post(&api, CONVERSATION, "older");
        let target = post(&api, CONVERSATION, "to be deleted");
        let session = session(&api);
        session.initialize().await;

        api.delete_message(CONVERSATION, &target).expect("delete");
        api.delete_message(CONVERSATION, &older).expect("delete");
        session.poll_events().await;

        let snapshot = session.state();
        assert_eq!(keys(&snapshot), vec![target, older]);
        assert!(
            snapshot
                .items()
                .iter()
                .all(|item| matches!(item, TimelineItem::DeletedMessage { .. }))
        );
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_deletion_of_live_message_replaces_it_in_place() {
        let api = api();
        let session = session(&api);
        session.initialize().await;

        let live = post(&api, CONVERSATION, "short-lived");
        session.poll_events().await;
        api.delete_message(CONVERSATION, &live).expect("delete");
        session.poll_events().await;

        let snapshot = session.state();
        assert_eq!(keys(&snapshot), vec![live]);
        assert!(matches!(
            snapshot.items()[0],
            TimelineItem::DeletedMessage { .. }
        ));
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_after_live_arrivals_keeps_every_id_once() {
        let api = api();
        for n in 0..3 {
            post(&api, CONVERSATION, &format!("older {n}"));
        }
        let session = session_with(
            &api,
            SessionConfig {
                history_page_size: 2,
                ..SessionConfig::default()
            },
        );
        session.initialize().await;
        for n in 0..4 {
            post(&api, CONVERSATION, &format!("newer {n}"));
        }

        session.poll_events().await;
        session.fetch_message_history().await;

        let snapshot = session.state();
        assert_eq!(
            keys(&snapshot),
            vec!["msg-7", "msg-6", "msg-5", "msg-4", "msg-3", "msg-2", "msg-1"]
        );
        assert!(!has_more_history(&snapshot));
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_overlapping_live_entries_does_not_duplicate() {
        let api = api();
        for n in 0..3 {
            post(&api, CONVERSATION, &format!("message {n}"));
        }
        api.fail_next(ApiCall::GetHistory, network_error())
            .expect("inject failure");
        let session = session(&api);
        session.initialize().await;

        // The failed first page leaves the events cursor unset, so the
        // poller reads the whole log into the live store.
        session.poll_events().await;
        assert_eq!(session.state().items().len(), 3);

        session.fetch_message_history().await;

        let snapshot = session.state();
        assert_eq!(keys(&snapshot), vec!["msg-3", "msg-2", "msg-1"]);
        assert_eq!(last_failure(&snapshot), None);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn send_shows_pending_then_confirmed_entry_once() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("hi bob").await }
        });
        wait_until(&session, &mut events, has_pending).await;

        match session.state().items() {
            [TimelineItem::PendingMessage { key, message }] => {
                assert!(key.starts_with(CORRELATION_PREFIX));
                assert_eq!(message.content, "hi bob");
                assert_eq!(message.status, PendingStatus::Sending);
            }
            other => panic!("unexpected items: {other:?}"),
        }

        let correlation_id = task.await.expect("send task").expect("send accepted");
        assert!(correlation_id.starts_with(CORRELATION_PREFIX));

        // The confirmation also arrives through the event log.
        session.poll_events().await;

        let snapshot = session.state();
        assert_eq!(snapshot.items().len(), 1);
        match &snapshot.items()[0] {
            TimelineItem::Message { message, .. } => {
                assert_eq!(message.content, "hi bob");
                assert_eq!(message.sender, alice());
            }
            other => panic!("unexpected item: {other:?}"),
        }
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn blank_messages_are_ignored() {
        let api = api();
        let session = session(&api);
        session.initialize().await;

        assert_eq!(session.send_message("").await, None);
        assert_eq!(session.send_message("  \n\t").await, None);

        assert_eq!(api.call_count(ApiCall::SendMessage), 0);
        assert!(session.state().items().is_empty());
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn send_before_ready_is_ignored() {
        let api = api();
        let session = session(&api);

        assert_eq!(session.send_message("too early").await, None);
        assert_eq!(api.call_count(ApiCall::SendMessage), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_stays_pending_until_retried() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        api.fail_next(ApiCall::SendMessage, network_error())
            .expect("inject failure");

        let correlation_id = session
            .send_message("retry me")
            .await
            .expect("send accepted");

        let snapshot = session.state();
        match snapshot.items() {
            [TimelineItem::PendingMessage { message, .. }] => assert!(message.is_failed()),
            other => panic!("unexpected items: {other:?}"),
        }
        assert_eq!(
            last_failure(&snapshot).map(|failure| failure.operation),
            Some(SessionOperation::Send {
                correlation_id: correlation_id.clone()
            })
        );

        assert!(session.retry_send(&correlation_id).await);

        let snapshot = session.state();
        assert_eq!(snapshot.items().len(), 1);
        assert!(matches!(
            snapshot.items()[0].confirmed(),
            Some(StoredEntry::Message(_))
        ));
        assert_eq!(last_failure(&snapshot), None);
        assert!(!session.retry_send(&correlation_id).await);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_can_be_discarded() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        api.fail_next(ApiCall::SendMessage, network_error())
            .expect("inject failure");

        let correlation_id = session.send_message("oops").await.expect("send accepted");

        assert!(session.discard_failed_send(&correlation_id));
        assert!(!session.discard_failed_send(&correlation_id));
        assert!(session.state().items().is_empty());
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_abandons_in_flight_send() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("never sent").await }
        });
        wait_until(&session, &mut events, has_pending).await;

        session.destroy();
        task.await.expect("send task");

        assert_eq!(session.state(), SessionSnapshot::Destroyed);
        assert_eq!(api.call_count(ApiCall::SendMessage), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_polling() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let polls = api.call_count(ApiCall::GetEventLog);
        assert_eq!(polls, 1);

        session.destroy();
        tokio::time::sleep(session.config().poll_interval() * 4).await;

        assert_eq!(api.call_count(ApiCall::GetEventLog), polls);
        assert_eq!(session.state(), SessionSnapshot::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_is_reported_and_polling_continues() {
        let api = api();
        api.fail_next(ApiCall::GetEventLog, network_error())
            .expect("inject failure");
        let session = session(&api);
        session.initialize().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            last_failure(&session.state()).map(|failure| failure.operation),
            Some(SessionOperation::Poll)
        );

        let remote = post(&api, CONVERSATION, "after the outage");
        tokio::time::sleep(session.config().poll_interval()).await;

        let snapshot = session.state();
        assert_eq!(keys(&snapshot), vec![remote]);
        assert_eq!(last_failure(&snapshot), None);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_polls_never_overlap() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        api.set_latency(Duration::from_secs(7)).expect("latency");

        // Polls start at 0s and 12s: each wait begins after the previous read.
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(api.call_count(ApiCall::GetEventLog), 2);

        let started = Instant::now();
        session.poll_events().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(api.call_count(ApiCall::GetEventLog), 2);
        session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_stops_the_poller() {
        let api = api();
        let session = session(&api);
        session.initialize().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let polls = api.call_count(ApiCall::GetEventLog);

        drop(session);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(api.call_count(ApiCall::GetEventLog), polls);
    }
}
