//! Conversation history
//!
//! Owned by the caller and lent to the orchestrator, which only appends.
//! The one exception is compaction, which swaps the whole transcript for a
//! summary produced by an external [`Compactor`].

use crate::types::{ContentBlock, HistoryEntry, TokenUsage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Summarizes a transcript when the context grows too large
#[async_trait]
pub trait Compactor: Send + Sync {
    /// Return a replacement transcript for `entries`
    async fn compact(&self, entries: &[HistoryEntry], usage: &TokenUsage)
        -> Result<Vec<HistoryEntry>>;
}

/// Ordered session transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Text of the most recent assistant text block
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|entry| match entry {
            HistoryEntry::Assistant { content } => {
                content.iter().find_map(ContentBlock::as_text)
            }
            _ => None,
        })
    }

    /// Replace the transcript with a compacted version
    ///
    /// Returns the number of entries before compaction.
    pub async fn compact_with(
        &mut self,
        compactor: &dyn Compactor,
        usage: &TokenUsage,
    ) -> Result<usize> {
        let before = self.entries.len();
        let compacted = compactor.compact(&self.entries, usage).await?;
        tracing::info!(
            before = before,
            after = compacted.len(),
            "History compacted"
        );
        self.entries = compacted;
        Ok(before)
    }

    pub fn into_vec(self) -> Vec<HistoryEntry> {
        self.entries
    }
}

impl From<Vec<HistoryEntry>> for History {
    fn from(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }
}
