use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::GuideDatabase;
use crate::error::{GuideError, GuideResult};
use crate::persona::{NarrativeReference, PersonaConfig};

/// Narrowest allowed set: exactly the completed units, never more.
pub fn allowed_references(completed: &BTreeSet<u32>) -> BTreeSet<u32> {
    completed.clone()
}

/// Persona callbacks whose episode is inside `allowed`, in table order.
pub fn visible_references<'a>(
    persona: &'a PersonaConfig,
    allowed: &'a BTreeSet<u32>,
) -> impl Iterator<Item = &'a NarrativeReference> + 'a {
    persona
        .references
        .iter()
        .filter(move |r| allowed.contains(&r.episode))
}

#[derive(Clone)]
pub struct AntiSpoilerFilter {
    db: Arc<GuideDatabase>,
}

impl AntiSpoilerFilter {
    pub fn new(db: Arc<GuideDatabase>) -> Self {
        Self { db }
    }

    pub fn allowed_reference_set(&self, user_id: &str) -> GuideResult<BTreeSet<u32>> {
        if self.db.get_profile(user_id)?.is_none() {
            return Err(GuideError::UnknownUser(user_id.to_string()));
        }
        let completed = self.db.completed_episodes(user_id)?;
        Ok(allowed_references(&completed))
    }
}
