use std::sync::Arc;

use crate::database::{Channel, ConversationTurn, GuideDatabase};
use crate::error::GuideResult;

/// Recent turns of one (user, channel) stream, yielded oldest-first.
///
/// Consuming the window does not re-read storage; call
/// [`HistoryWindowManager::load_recent_history`] again for a fresh view.
#[derive(Debug)]
pub struct HistoryWindow {
    turns: std::iter::Rev<std::vec::IntoIter<ConversationTurn>>,
}

impl HistoryWindow {
    fn from_newest_first(turns: Vec<ConversationTurn>) -> Self {
        Self {
            turns: turns.into_iter().rev(),
        }
    }

    /// No prior turns on this channel.
    pub fn is_first_contact(&self) -> bool {
        self.turns.len() == 0
    }
}

impl Iterator for HistoryWindow {
    type Item = ConversationTurn;

    fn next(&mut self) -> Option<Self::Item> {
        self.turns.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.turns.size_hint()
    }
}

impl ExactSizeIterator for HistoryWindow {}

#[derive(Clone)]
pub struct HistoryWindowManager {
    db: Arc<GuideDatabase>,
}

impl HistoryWindowManager {
    pub fn new(db: Arc<GuideDatabase>) -> Self {
        Self { db }
    }

    pub fn load_recent_history(
        &self,
        user_id: &str,
        channel: Channel,
        limit: usize,
    ) -> GuideResult<HistoryWindow> {
        let newest_first = self.db.latest_turns(user_id, channel, limit)?;
        Ok(HistoryWindow::from_newest_first(newest_first))
    }
}
