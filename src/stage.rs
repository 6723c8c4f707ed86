//! Stage map and stage resolution.
//!
//! Episodes are grouped into stage groups that span one or more weeks. A user
//! may open episode N only after 1..N-1 are complete, and their stored stage
//! advances once every episode of the active group is inside the contiguously
//! completed prefix.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::GuideDatabase;
use crate::error::{GuideError, GuideResult};

/// One cluster of weeks sharing a theme and an episode range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGroup {
    pub first_week: u32,
    pub last_week: u32,
    pub name: String,
    /// Inclusive episode range; `None` for groups whose content is not mapped yet.
    #[serde(default)]
    pub episodes: Option<(u32, u32)>,
}

impl StageGroup {
    pub fn contains_week(&self, week: u32) -> bool {
        week >= self.first_week && week <= self.last_week
    }

    pub fn contains_episode(&self, episode: u32) -> bool {
        matches!(self.episodes, Some((start, end)) if episode >= start && episode <= end)
    }
}

/// Immutable stage-boundary table, loaded once and injected where needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMap {
    pub groups: Vec<StageGroup>,
    pub total_weeks: u32,
}

fn group(first_week: u32, last_week: u32, name: &str, episodes: Option<(u32, u32)>) -> StageGroup {
    StageGroup {
        first_week,
        last_week,
        name: name.to_string(),
        episodes,
    }
}

impl Default for StageMap {
    fn default() -> Self {
        Self {
            groups: vec![
                group(1, 2, "Presence", Some((1, 3))),
                group(3, 4, "Listening", Some((4, 6))),
                group(5, 6, "Observation", Some((7, 9))),
                group(7, 8, "Deep Observation", Some((10, 12))),
                group(9, 10, "Acceptance", Some((13, 15))),
                group(11, 12, "Settled Acceptance", Some((16, 18))),
                group(13, 14, "Forgiveness", Some((19, 21))),
                group(15, 16, "Forgiveness", Some((22, 24))),
                group(17, 18, "Letting Go", Some((25, 27))),
                group(19, 20, "Letting Go", Some((28, 30))),
                group(21, 33, "Inner Resurrection", None),
            ],
            total_weeks: 33,
        }
    }
}

impl StageMap {
    /// Highest episode number covered by any group.
    pub fn max_episode(&self) -> u32 {
        self.groups
            .iter()
            .filter_map(|g| g.episodes.map(|(_, end)| end))
            .max()
            .unwrap_or(0)
    }

    pub fn is_known_episode(&self, episode: u32) -> bool {
        episode >= 1 && episode <= self.max_episode()
    }

    pub fn group_for_week(&self, week: u32) -> Option<&StageGroup> {
        self.groups.iter().find(|g| g.contains_week(week))
    }

    pub fn group_for_episode(&self, episode: u32) -> Option<&StageGroup> {
        self.groups.iter().find(|g| g.contains_episode(episode))
    }

    /// Week tag stored on completion records; unmapped episodes fall back to week 1.
    pub fn week_for_episode(&self, episode: u32) -> u32 {
        self.group_for_episode(episode)
            .map(|g| g.first_week)
            .unwrap_or(1)
    }

    pub fn stage_name(&self, week: u32) -> &str {
        self.group_for_week(week)
            .map(|g| g.name.as_str())
            .unwrap_or("Presence")
    }

    /// Weeks the user may open, given their completed episodes.
    pub fn unlocked_weeks(&self, completed: &BTreeSet<u32>) -> Vec<u32> {
        let mut weeks = Vec::new();
        for week in 1..=self.total_weeks {
            if week == 1 {
                weeks.push(1);
                continue;
            }
            let Some((start, end)) = self.group_for_week(week - 1).and_then(|g| g.episodes) else {
                break;
            };
            if (start..=end).all(|ep| completed.contains(&ep)) {
                weeks.push(week);
            }
        }
        weeks
    }

    pub fn is_week_unlocked(&self, week: u32, completed: &BTreeSet<u32>) -> bool {
        self.unlocked_weeks(completed).contains(&week)
    }

    pub fn next_week_to_unlock(&self, completed: &BTreeSet<u32>) -> Option<u32> {
        let highest = self.unlocked_weeks(completed).into_iter().max().unwrap_or(1);
        let next = highest + 1;
        (next <= self.total_weeks).then_some(next)
    }

    /// Stage the user is entitled to, given their contiguous completion prefix.
    ///
    /// Returns the first week of the first group not fully inside the prefix,
    /// or the last mapped group when everything is done.
    pub fn target_stage(&self, contiguous: u32) -> u32 {
        let mut last_mapped = 1;
        for g in &self.groups {
            match g.episodes {
                Some((_, end)) => {
                    last_mapped = g.first_week;
                    if end > contiguous {
                        return g.first_week;
                    }
                }
                None => return g.first_week,
            }
        }
        last_mapped
    }
}

/// Highest N such that every unit 1..=N is complete. Gaps are never skipped.
pub fn contiguous_completed(completed: &BTreeSet<u32>) -> u32 {
    let mut highest = 0;
    while completed.contains(&(highest + 1)) {
        highest += 1;
    }
    highest
}

/// Unit `episode` is reachable iff every earlier unit is complete.
pub fn is_episode_reachable(episode: u32, completed: &BTreeSet<u32>) -> bool {
    episode >= 1 && contiguous_completed(completed) + 1 >= episode
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageContext {
    /// Week number of the active stage group.
    pub stage_index: u32,
    pub stage_name: String,
    /// Highest episode the user may open.
    pub unlocked_content_upper_bound: u32,
    pub is_channel_linked: bool,
    pub advanced: bool,
}

/// Derives the user's stage and applies a due stage advance.
#[derive(Clone)]
pub struct StageResolver {
    db: Arc<GuideDatabase>,
    map: Arc<StageMap>,
}

impl StageResolver {
    pub fn new(db: Arc<GuideDatabase>, map: Arc<StageMap>) -> Self {
        Self { db, map }
    }

    pub fn map(&self) -> &StageMap {
        &self.map
    }

    pub fn resolve_stage(&self, user_id: &str) -> GuideResult<StageContext> {
        let profile = self
            .db
            .get_profile(user_id)?
            .ok_or_else(|| GuideError::UnknownUser(user_id.to_string()))?;
        let completed = self.db.completed_episodes(user_id)?;
        self.resolve_with(user_id, profile.current_stage, profile.telegram_id.is_some(), &completed)
    }

    fn resolve_with(
        &self,
        user_id: &str,
        stored_stage: u32,
        is_channel_linked: bool,
        completed: &BTreeSet<u32>,
    ) -> GuideResult<StageContext> {
        let max_known = self.map.max_episode();
        if let Some(&beyond) = completed.iter().rev().find(|&&ep| ep > max_known) {
            let stale = GuideError::StaleState {
                user_id: user_id.to_string(),
                unit: beyond,
            };
            tracing::warn!("{}; clamping to the highest known stage", stale);
        }

        let contiguous = contiguous_completed(completed).min(max_known);
        let target = self.map.target_stage(contiguous);

        let mut stage_index = stored_stage.max(1);
        let mut advanced = false;
        if target > stage_index {
            advanced = self.db.advance_stage(user_id, target)?;
            if advanced {
                tracing::info!(
                    "Stage advanced for {}: week {} -> week {}",
                    user_id,
                    stage_index,
                    target
                );
            }
            stage_index = target;
        }

        Ok(StageContext {
            stage_index,
            stage_name: self.map.stage_name(stage_index).to_string(),
            unlocked_content_upper_bound: (contiguous + 1).min(max_known),
            is_channel_linked,
            advanced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewProfile;

    fn set(items: &[u32]) -> BTreeSet<u32> {
        items.iter().copied().collect()
    }

    fn resolver_with_user() -> (StageResolver, Arc<GuideDatabase>) {
        let db = Arc::new(GuideDatabase::open_in_memory().unwrap());
        db.create_profile(&NewProfile {
            user_id: "u1".to_string(),
            name: "Luca".to_string(),
            ..Default::default()
        })
        .unwrap();
        (
            StageResolver::new(db.clone(), Arc::new(StageMap::default())),
            db,
        )
    }

    #[test]
    fn gaps_block_sequential_unlock() {
        let completed = set(&[1, 2, 4]);
        assert_eq!(contiguous_completed(&completed), 2);
        assert!(is_episode_reachable(3, &completed));
        assert!(!is_episode_reachable(4, &completed));
        assert!(!is_episode_reachable(5, &completed));
        assert!(!is_episode_reachable(0, &completed));
    }

    #[test]
    fn week_one_always_unlocked_and_pairs_follow_episodes() {
        let map = StageMap::default();
        assert_eq!(map.unlocked_weeks(&set(&[])), vec![1]);
        // Week 2 shares the episodes of week 1's group.
        assert_eq!(map.unlocked_weeks(&set(&[1, 2])), vec![1]);
        assert_eq!(map.unlocked_weeks(&set(&[1, 2, 3])), vec![1, 2, 3]);
        assert!(map.is_week_unlocked(3, &set(&[1, 2, 3])));
        assert!(!map.is_week_unlocked(5, &set(&[1, 2, 3])));
        assert_eq!(map.next_week_to_unlock(&set(&[1, 2, 3])), Some(4));
    }

    #[test]
    fn unlock_scan_stops_at_unmapped_groups() {
        let map = StageMap::default();
        let all: BTreeSet<u32> = (1..=30).collect();
        let weeks = map.unlocked_weeks(&all);
        assert_eq!(weeks.last(), Some(&21));
        assert_eq!(map.next_week_to_unlock(&all), Some(22));
    }

    #[test]
    fn episodes_map_to_first_week_of_their_group() {
        let map = StageMap::default();
        assert_eq!(map.week_for_episode(1), 1);
        assert_eq!(map.week_for_episode(6), 3);
        assert_eq!(map.week_for_episode(30), 19);
        assert_eq!(map.week_for_episode(99), 1);
        assert_eq!(map.max_episode(), 30);
    }

    #[test]
    fn resolver_reports_unknown_user() {
        let (resolver, _db) = resolver_with_user();
        assert!(matches!(
            resolver.resolve_stage("ghost"),
            Err(GuideError::UnknownUser(_))
        ));
    }

    #[test]
    fn resolver_advances_once_group_is_complete() {
        let (resolver, db) = resolver_with_user();
        db.upsert_completion("u1", 1, 1).unwrap();
        db.upsert_completion("u1", 2, 1).unwrap();

        let ctx = resolver.resolve_stage("u1").unwrap();
        assert_eq!(ctx.stage_index, 1);
        assert_eq!(ctx.unlocked_content_upper_bound, 3);
        assert!(!ctx.advanced);

        db.upsert_completion("u1", 3, 1).unwrap();
        let ctx = resolver.resolve_stage("u1").unwrap();
        assert_eq!(ctx.stage_index, 3);
        assert_eq!(ctx.stage_name, "Listening");
        assert!(ctx.advanced);

        // Unchanged inputs: no second write.
        let again = resolver.resolve_stage("u1").unwrap();
        assert_eq!(again.stage_index, 3);
        assert!(!again.advanced);
        assert_eq!(db.get_profile("u1").unwrap().unwrap().current_stage, 3);
    }

    #[test]
    fn resolver_ignores_completions_after_a_gap() {
        let (resolver, db) = resolver_with_user();
        for ep in [1, 2, 4, 5, 6] {
            db.upsert_completion("u1", ep, resolver.map().week_for_episode(ep))
                .unwrap();
        }
        let ctx = resolver.resolve_stage("u1").unwrap();
        assert_eq!(ctx.stage_index, 1);
        assert_eq!(ctx.unlocked_content_upper_bound, 3);
    }

    #[test]
    fn resolver_never_lowers_a_stored_stage() {
        let (resolver, db) = resolver_with_user();
        db.advance_stage("u1", 7).unwrap();
        let ctx = resolver.resolve_stage("u1").unwrap();
        assert_eq!(ctx.stage_index, 7);
        assert_eq!(db.get_profile("u1").unwrap().unwrap().current_stage, 7);
    }

    #[test]
    fn stale_completions_clamp_to_known_stage() {
        let (resolver, db) = resolver_with_user();
        for ep in 1..=31 {
            db.upsert_completion("u1", ep, 1).unwrap();
        }
        let ctx = resolver.resolve_stage("u1").unwrap();
        assert_eq!(ctx.stage_index, 21);
        assert_eq!(ctx.unlocked_content_upper_bound, 30);
    }

    #[test]
    fn racing_resolutions_keep_stage_monotonic() {
        let (resolver, db) = resolver_with_user();
        for ep in 1..=6 {
            db.upsert_completion("u1", ep, 1).unwrap();
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                std::thread::spawn(move || resolver.resolve_stage("u1").unwrap().stage_index)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
        assert_eq!(db.get_profile("u1").unwrap().unwrap().current_stage, 5);
    }
}
