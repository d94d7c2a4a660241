use crate::{
    cursor::{EventsCursor, HistoryCursor},
    timeline::ConversationTimeline,
    types::{EventLogEntry, EventPayload, HistoryPage, StoredEntry},
};

/// What a history page contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryApplied {
    /// Records stored into the past store.
    pub stored: usize,
    /// Records of unrecognized shape that were skipped.
    pub dropped: usize,
    /// Whether the events cursor moved.
    pub cursor_advanced: bool,
}

/// What an event-log batch contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Entries without a usable revision.
    pub malformed: usize,
    /// Entries that belong to other conversations.
    pub foreign: usize,
    /// Message creations applied.
    pub created: usize,
    /// Deletions applied to known messages.
    pub deleted: usize,
    /// Deletions for messages this session never saw.
    pub unknown_deletions: usize,
    /// Entries of unrecognized kind.
    pub ignored: usize,
    /// Whether the events cursor moved.
    pub cursor_advanced: bool,
}

impl IngestSummary {
    /// Whether the batch changed the conversation stores.
    pub fn touched_timeline(&self) -> bool {
        self.created > 0 || self.deleted > 0
    }
}

/// Fold one history page into the past store and cursors.
///
/// Returns the history cursor to use for the next page; an empty or absent
/// continuation token marks the history as exhausted.
pub fn apply_history_page(
    timeline: &mut ConversationTimeline,
    events_cursor: &mut EventsCursor,
    page: HistoryPage,
) -> (HistoryCursor, HistoryApplied) {
    let mut applied = HistoryApplied::default();

    for record in page.records {
        let Some(entry) = record.into_entry() else {
            applied.dropped += 1;
            continue;
        };

        if let Some(revision) = entry.revision().filter(|rev| rev.is_well_formed())
            && events_cursor.observe(revision)
        {
            applied.cursor_advanced = true;
        }

        timeline.insert_past(entry);
        applied.stored += 1;
    }

    (HistoryCursor::from_next(page.next_cursor), applied)
}

/// Fold a batch of the shared event log into a conversation.
///
/// The cursor advances over every entry with a usable revision, including
/// entries of other conversations, so they are not fetched again. Only
/// then are foreign entries discarded.
pub fn apply_event_batch(
    timeline: &mut ConversationTimeline,
    events_cursor: &mut EventsCursor,
    conversation_id: &str,
    entries: Vec<EventLogEntry>,
) -> IngestSummary {
    let mut summary = IngestSummary::default();

    for entry in entries {
        let Some(revision) = entry.revision.filter(|rev| rev.is_well_formed()) else {
            summary.malformed += 1;
            continue;
        };

        if events_cursor.observe(&revision) {
            summary.cursor_advanced = true;
        }

        if entry.conversation_id != conversation_id {
            summary.foreign += 1;
            continue;
        }

        match entry.payload {
            EventPayload::CreateMessage { message } => {
                timeline.insert_live(StoredEntry::Message(message));
                summary.created += 1;
            }
            EventPayload::DeleteMessage { message } => {
                if timeline.apply_deletion(StoredEntry::DeletedMessage(message)) {
                    summary.deleted += 1;
                } else {
                    summary.unknown_deletions += 1;
                }
            }
            EventPayload::Unknown => summary.ignored += 1,
        }
    }

    summary
}
