//! Episode access, completion, reflections and weekly practices.

use std::sync::Arc;

use serde::Serialize;

use crate::content::{ContentProvider, ContentUnit, StageOverview};
use crate::database::{
    CompletionRecord, GuideDatabase, ReflectionEntry, UserProfile, WeeklyPractice, PRACTICES_PER_WEEK,
    PRACTICE_DAYS,
};
use crate::error::{GuideError, GuideResult};
use crate::stage::{contiguous_completed, is_episode_reachable, StageContext, StageResolver};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeView {
    pub episode_number: u32,
    pub week_number: u32,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_message: Option<String>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentUnit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<ReflectionEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub progress: CompletionRecord,
    pub next_episode: Option<u32>,
    pub unlocked_next: bool,
    pub stage: StageContext,
}

#[derive(Clone)]
pub struct ProgressService {
    db: Arc<GuideDatabase>,
    resolver: StageResolver,
    content: Arc<dyn ContentProvider>,
    reflection_max_chars: usize,
}

impl ProgressService {
    pub fn new(
        db: Arc<GuideDatabase>,
        resolver: StageResolver,
        content: Arc<dyn ContentProvider>,
        reflection_max_chars: usize,
    ) -> Self {
        Self {
            db,
            resolver,
            content,
            reflection_max_chars,
        }
    }

    fn require_profile(&self, user_id: &str) -> GuideResult<UserProfile> {
        self.db
            .get_profile(user_id)?
            .ok_or_else(|| GuideError::UnknownUser(user_id.to_string()))
    }

    fn require_known_episode(&self, episode: u32) -> GuideResult<()> {
        if self.resolver.map().is_known_episode(episode) {
            Ok(())
        } else {
            Err(GuideError::ContentNotFound(format!("episode {}", episode)))
        }
    }

    pub async fn open_episode(&self, user_id: &str, episode: u32) -> GuideResult<EpisodeView> {
        self.require_profile(user_id)?;
        self.require_known_episode(episode)?;

        let completed = self.db.completed_episodes(user_id)?;
        let week_number = self.resolver.map().week_for_episode(episode);
        if !is_episode_reachable(episode, &completed) {
            return Ok(EpisodeView {
                episode_number: episode,
                week_number,
                locked: true,
                lock_message: Some(format!(
                    "Complete episode {} to unlock this one",
                    contiguous_completed(&completed) + 1
                )),
                completed: false,
                content: None,
                reflection: None,
            });
        }

        let content = self.content.get_content_unit(episode, week_number).await?;
        Ok(EpisodeView {
            episode_number: episode,
            week_number,
            locked: false,
            lock_message: None,
            completed: completed.contains(&episode),
            content: Some(content),
            reflection: self.db.get_reflection(user_id, episode)?,
        })
    }

    pub fn complete_episode(&self, user_id: &str, episode: u32) -> GuideResult<CompletionOutcome> {
        self.require_profile(user_id)?;
        self.require_known_episode(episode)?;

        let completed = self.db.completed_episodes(user_id)?;
        if !is_episode_reachable(episode, &completed) {
            return Err(GuideError::ContentLocked {
                episode,
                required: contiguous_completed(&completed) + 1,
            });
        }
        let has_reflection = self
            .db
            .get_reflection(user_id, episode)?
            .is_some_and(|r| !r.response.trim().is_empty());
        if !has_reflection {
            return Err(GuideError::ReflectionMissing(episode));
        }

        let week_number = self.resolver.map().week_for_episode(episode);
        let progress = self.db.upsert_completion(user_id, episode, week_number)?;
        let stage = self.resolver.resolve_stage(user_id)?;

        let next = episode + 1;
        let next_known = self.resolver.map().is_known_episode(next);
        Ok(CompletionOutcome {
            progress,
            next_episode: next_known.then_some(next),
            unlocked_next: next_known && next <= stage.unlocked_content_upper_bound,
            stage,
        })
    }

    pub fn save_reflection(
        &self,
        user_id: &str,
        episode: u32,
        question: Option<&str>,
        text: &str,
    ) -> GuideResult<ReflectionEntry> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GuideError::InvalidInput("reflection text is empty".into()));
        }
        let len = text.chars().count();
        if len > self.reflection_max_chars {
            return Err(GuideError::ReflectionTooLong {
                len,
                max: self.reflection_max_chars,
            });
        }

        self.require_profile(user_id)?;
        self.require_known_episode(episode)?;
        let completed = self.db.completed_episodes(user_id)?;
        if !is_episode_reachable(episode, &completed) {
            return Err(GuideError::ContentLocked {
                episode,
                required: contiguous_completed(&completed) + 1,
            });
        }

        let question = question.map(str::trim).filter(|q| !q.is_empty());
        self.db
            .upsert_reflection(user_id, episode, question, text)
            .map_err(|e| GuideError::PersistenceWriteFailed(format!("{:#}", e)))
    }

    pub fn get_reflection(&self, user_id: &str, episode: u32) -> GuideResult<Option<ReflectionEntry>> {
        self.require_profile(user_id)?;
        Ok(self.db.get_reflection(user_id, episode)?)
    }

    fn require_week(&self, week: u32) -> GuideResult<()> {
        let total = self.resolver.map().total_weeks;
        if week == 0 || week > total {
            return Err(GuideError::InvalidInput(format!(
                "week must be between 1 and {}",
                total
            )));
        }
        Ok(())
    }

    pub fn list_practices(&self, user_id: &str, week: u32) -> GuideResult<Vec<WeeklyPractice>> {
        self.require_profile(user_id)?;
        self.require_week(week)?;
        Ok(self.db.list_or_seed_practices(user_id, week)?)
    }

    pub fn set_practice_day(
        &self,
        user_id: &str,
        week: u32,
        practice: u32,
        day: usize,
        completed: bool,
    ) -> GuideResult<WeeklyPractice> {
        self.require_profile(user_id)?;
        self.require_week(week)?;
        if practice == 0 || practice > PRACTICES_PER_WEEK {
            return Err(GuideError::InvalidInput(format!(
                "practice must be between 1 and {}",
                PRACTICES_PER_WEEK
            )));
        }
        if day == 0 || day > PRACTICE_DAYS {
            return Err(GuideError::InvalidInput(format!(
                "day must be between 1 and {}",
                PRACTICE_DAYS
            )));
        }
        Ok(self
            .db
            .set_practice_day(user_id, week, practice, day, completed)?)
    }

    pub async fn week_overview(&self, week: u32) -> GuideResult<StageOverview> {
        self.require_week(week)?;
        self.content.get_stage_overview(week).await
    }

    /// Stage context plus the weeks the user can open.
    pub fn stage_summary(&self, user_id: &str) -> GuideResult<(StageContext, Vec<u32>)> {
        let stage = self.resolver.resolve_stage(user_id)?;
        let completed = self.db.completed_episodes(user_id)?;
        Ok((stage, self.resolver.map().unlocked_weeks(&completed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::StaticContentProvider;
    use crate::stage::StageMap;
    use crate::testing::seed_user;

    fn unit(number: u32) -> ContentUnit {
        ContentUnit {
            number,
            title: format!("Episode {}", number),
            lead_text: "lead".into(),
            guidance_text: "guidance".into(),
            reflection_prompt: "What do you notice?".into(),
            takeaway_text: "takeaway".into(),
            stage_tag: 0,
        }
    }

    fn service() -> (Arc<GuideDatabase>, ProgressService) {
        let db = Arc::new(GuideDatabase::open_in_memory().unwrap());
        seed_user(&db, "u1");
        let resolver = StageResolver::new(db.clone(), Arc::new(StageMap::default()));
        let content = (1..=6).fold(StaticContentProvider::new(), |p, n| p.with_unit(unit(n)));
        let service = ProgressService::new(db.clone(), resolver, Arc::new(content), 500);
        (db, service)
    }

    fn finish(service: &ProgressService, episode: u32) {
        service
            .save_reflection("u1", episode, None, "something moved")
            .unwrap();
        service.complete_episode("u1", episode).unwrap();
    }

    #[tokio::test]
    async fn gap_keeps_later_episode_locked() {
        let (db, service) = service();
        db.upsert_completion("u1", 1, 1).unwrap();
        db.upsert_completion("u1", 2, 1).unwrap();

        let view = service.open_episode("u1", 4).await.unwrap();
        assert!(view.locked);
        assert!(view.content.is_none());
        assert_eq!(view.lock_message.as_deref(), Some("Complete episode 3 to unlock this one"));

        let view = service.open_episode("u1", 3).await.unwrap();
        assert!(!view.locked);
        assert_eq!(view.content.map(|c| c.stage_tag), Some(1));
    }

    #[tokio::test]
    async fn lock_names_the_first_missing_episode() {
        let (db, service) = service();
        for episode in [1, 2, 4] {
            db.upsert_completion("u1", episode, 1).unwrap();
        }

        let view = service.open_episode("u1", 6).await.unwrap();
        assert!(view.locked);
        assert_eq!(view.lock_message.as_deref(), Some("Complete episode 3 to unlock this one"));
        assert!(matches!(
            service.complete_episode("u1", 6),
            Err(GuideError::ContentLocked {
                episode: 6,
                required: 3
            })
        ));
    }

    #[tokio::test]
    async fn unknown_episode_is_not_found() {
        let (_db, service) = service();
        assert!(matches!(
            service.open_episode("u1", 31).await,
            Err(GuideError::ContentNotFound(_))
        ));
    }

    #[test]
    fn completion_requires_reflection_and_order() {
        let (_db, service) = service();
        assert!(matches!(
            service.complete_episode("u1", 1),
            Err(GuideError::ReflectionMissing(1))
        ));
        assert!(matches!(
            service.complete_episode("u1", 2),
            Err(GuideError::ContentLocked {
                episode: 2,
                required: 1
            })
        ));
    }

    #[test]
    fn finishing_a_group_advances_stage() {
        let (db, service) = service();
        finish(&service, 1);
        finish(&service, 2);
        service.save_reflection("u1", 3, Some("q"), "done").unwrap();
        let outcome = service.complete_episode("u1", 3).unwrap();

        assert_eq!(outcome.stage.stage_index, 3);
        assert_eq!(outcome.next_episode, Some(4));
        assert!(outcome.unlocked_next);
        assert_eq!(outcome.progress.week_number, 1);
        assert_eq!(db.get_profile("u1").unwrap().unwrap().current_stage, 3);

        let (_, weeks) = service.stage_summary("u1").unwrap();
        assert_eq!(weeks, vec![1, 2, 3]);
    }

    #[test]
    fn overlong_reflection_writes_nothing() {
        let (db, service) = service();
        let text = "a".repeat(501);
        assert!(matches!(
            service.save_reflection("u1", 1, None, &text),
            Err(GuideError::ReflectionTooLong { len: 501, max: 500 })
        ));
        assert!(db.list_reflections("u1").unwrap().is_empty());

        let text = "è".repeat(500);
        assert!(service.save_reflection("u1", 1, None, &text).is_ok());
    }

    #[test]
    fn blank_reflection_is_invalid() {
        let (_db, service) = service();
        assert!(matches!(
            service.save_reflection("u1", 1, None, "   "),
            Err(GuideError::InvalidInput(_))
        ));
    }

    #[test]
    fn practice_bounds_are_checked() {
        let (_db, service) = service();
        assert_eq!(service.list_practices("u1", 1).unwrap().len(), 3);
        assert!(matches!(
            service.set_practice_day("u1", 1, 4, 1, true),
            Err(GuideError::InvalidInput(_))
        ));
        assert!(matches!(
            service.set_practice_day("u1", 1, 1, 15, true),
            Err(GuideError::InvalidInput(_))
        ));
        assert!(matches!(
            service.list_practices("u1", 34),
            Err(GuideError::InvalidInput(_))
        ));
        let practice = service.set_practice_day("u1", 1, 2, 14, true).unwrap();
        assert!(practice.completed_days[13]);
    }

    #[test]
    fn unknown_user_is_reported() {
        let (_db, service) = service();
        assert!(matches!(
            service.get_reflection("ghost", 1),
            Err(GuideError::UnknownUser(_))
        ));
    }
}
