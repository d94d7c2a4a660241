use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque revision token issued by the event log.
///
/// Tokens are compared lexicographically; the service issues them so that
/// byte order matches log order. An empty token is never a valid revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Parse a raw token, rejecting empty or whitespace-only values.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let revision = Self(raw.into());
        revision.is_well_formed().then_some(revision)
    }

    /// Deserialized tokens skip `parse`, so consumers check this before use.
    pub fn is_well_formed(&self) -> bool {
        !self.0.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read position in the shared event log. Only ever moves forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsCursor {
    current: Option<Revision>,
}

impl EventsCursor {
    pub fn current(&self) -> Option<&Revision> {
        self.current.as_ref()
    }

    /// Adopt `seen` when the cursor is unset or `seen` is strictly greater.
    ///
    /// Returns `true` when the cursor moved.
    pub fn observe(&mut self, seen: &Revision) -> bool {
        match &self.current {
            Some(current) if seen <= current => false,
            _ => {
                self.current = Some(seen.clone());
                true
            }
        }
    }
}

/// Backfill position in conversation history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HistoryCursor {
    /// No page has been requested yet.
    #[default]
    NotStarted,
    /// More pages are available from this token.
    More(String),
    /// The server reported no further pages.
    Exhausted,
}

impl HistoryCursor {
    /// Interpret the `next_cursor` returned with a page.
    ///
    /// Absent and empty tokens both mean the history is exhausted.
    pub fn from_next(next: Option<String>) -> Self {
        match next {
            Some(token) if !token.is_empty() => Self::More(token),
            _ => Self::Exhausted,
        }
    }

    /// Token to send with the next page request, if any.
    pub fn request_token(&self) -> Option<&str> {
        match self {
            Self::More(token) => Some(token.as_str()),
            Self::NotStarted | Self::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}
