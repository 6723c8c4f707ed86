//! System prompt assembly.
//!
//! Sections always appear in the same order: base persona rules, stage rules,
//! channel format, narrative-reference constraint, then the personal context.
//! Given identical inputs the output is byte-identical.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::{Channel, ReflectionEntry, UserProfile};
use crate::persona::{PersonaConfig, StageRule};
use crate::spoiler::visible_references;
use crate::stage::{StageContext, StageMap};

pub struct PromptAssembler {
    persona: Arc<PersonaConfig>,
    map: Arc<StageMap>,
    reflections_in_prompt: usize,
}

impl PromptAssembler {
    pub fn new(persona: Arc<PersonaConfig>, map: Arc<StageMap>, reflections_in_prompt: usize) -> Self {
        Self {
            persona,
            map,
            reflections_in_prompt,
        }
    }

    pub fn persona(&self) -> &PersonaConfig {
        &self.persona
    }

    /// Build the system prompt for a registered user. `first_contact` is true
    /// when the channel has no prior turns for this user.
    pub fn assemble_prompt(
        &self,
        stage: &StageContext,
        allowed_refs: &BTreeSet<u32>,
        profile: &UserProfile,
        reflections: &[ReflectionEntry],
        channel: Channel,
        first_contact: bool,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(self.persona.base_rules.trim());
        prompt.push_str("\n\n");

        self.push_stage_rules(&mut prompt, stage.stage_index);

        prompt.push_str(self.persona.channel_formats.for_channel(channel).trim());
        prompt.push_str("\n\n");

        self.push_reference_rule(&mut prompt, allowed_refs);
        self.push_user_context(&mut prompt, stage, allowed_refs, profile, reflections);

        if first_contact {
            prompt.push_str("\n\n");
            prompt.push_str(self.persona.first_contact.for_channel(channel).trim());
        }

        prompt
    }

    /// Reduced prompt for bridge handles that map to no registered user.
    pub fn assemble_unregistered_prompt(&self, channel: Channel) -> String {
        format!(
            "{}\n\n{}",
            self.persona.unregistered_prompt.trim(),
            self.persona.channel_formats.for_channel(channel).trim()
        )
    }

    fn current_rule(&self, stage_index: u32) -> Option<&StageRule> {
        let mut current = None;
        for rule in self.persona.rules_up_to(stage_index) {
            current = Some(rule);
            if stage_index <= rule.to_week {
                break;
            }
        }
        current
    }

    fn push_stage_rules(&self, prompt: &mut String, stage_index: u32) {
        let Some(current) = self.current_rule(stage_index) else {
            return;
        };

        let traversed: Vec<&str> = self
            .persona
            .rules_up_to(stage_index)
            .filter(|r| r.to_week < current.from_week)
            .map(|r| r.title.as_str())
            .collect();

        prompt.push_str(&format!(
            "# CURRENT STAGE: WEEK {} ({})\n\n",
            stage_index,
            self.map.stage_name(stage_index)
        ));
        prompt.push_str(&format!("## {}\n{}\n", current.title, current.rules.trim()));
        if !current.vocabulary.trim().is_empty() {
            prompt.push_str(&format!("Preferred vocabulary: {}\n", current.vocabulary.trim()));
        }
        if !traversed.is_empty() {
            prompt.push_str(&format!(
                "\nStages already traversed: {}. You may gently recall them.\n",
                traversed.join(", ")
            ));
        }
        prompt.push_str(
            "\nStay inside this stage. Never anticipate themes, passages or practices of later stages.\n\n",
        );
    }

    fn push_reference_rule(&self, prompt: &mut String, allowed_refs: &BTreeSet<u32>) {
        prompt.push_str("# NARRATIVE REFERENCES\n\n");
        if allowed_refs.is_empty() {
            prompt.push_str(self.persona.no_references_note.trim());
            prompt.push_str("\n\n");
            return;
        }

        let ids: Vec<String> = allowed_refs.iter().map(u32::to_string).collect();
        prompt.push_str(&format!(
            "Reference only episodes the person has completed: {}. Never mention, hint at or \
summarize any other episode.\n",
            ids.join(", ")
        ));
        let mut any = false;
        for reference in visible_references(&self.persona, allowed_refs) {
            if !any {
                prompt.push_str("Callbacks you may use when they resonate:\n");
                any = true;
            }
            prompt.push_str(&format!("- Episode {}: {}\n", reference.episode, reference.text.trim()));
        }
        prompt.push('\n');
    }

    fn push_user_context(
        &self,
        prompt: &mut String,
        stage: &StageContext,
        allowed_refs: &BTreeSet<u32>,
        profile: &UserProfile,
        reflections: &[ReflectionEntry],
    ) {
        prompt.push_str("# PERSON CONTEXT\n\n");
        prompt.push_str(&format!("Name: {}\n", profile.name));
        if let Some(age) = profile.age {
            prompt.push_str(&format!("Age: {}\n", age));
        }
        prompt.push_str(&format!("Current week: {} ({})\n", stage.stage_index, stage.stage_name));

        let optional = [
            ("Current situation", &profile.current_situation),
            ("Goals", &profile.goals),
            ("Passions", &profile.passions),
            ("Dream", &profile.dream),
        ];
        for (label, value) in optional {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                prompt.push_str(&format!("{}: {}\n", label, value));
            }
        }
        prompt.push_str(&format!("Episodes completed: {}\n", allowed_refs.len()));

        // Reflections on episodes outside the allowed set would leak their prompts.
        let mut recent: Vec<&ReflectionEntry> = reflections
            .iter()
            .filter(|r| allowed_refs.contains(&r.episode_number))
            .filter(|r| !r.response.trim().is_empty())
            .collect();
        recent.sort_by_key(|r| r.episode_number);
        let skip = recent.len().saturating_sub(self.reflections_in_prompt);
        let recent = &recent[skip..];
        if !recent.is_empty() {
            prompt.push_str("\nRecent reflections:\n");
            for entry in recent {
                match entry.question.as_deref().filter(|q| !q.trim().is_empty()) {
                    Some(question) => prompt.push_str(&format!(
                        "- Episode {} (\"{}\"): {}\n",
                        entry.episode_number,
                        question.trim(),
                        entry.response.trim()
                    )),
                    None => prompt.push_str(&format!(
                        "- Episode {}: {}\n",
                        entry.episode_number,
                        entry.response.trim()
                    )),
                }
            }
        }

        if let Some(summary) = profile
            .memory_summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            prompt.push_str(&format!("\nMemory of past conversations:\n{}\n", summary));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile() -> UserProfile {
        UserProfile {
            user_id: "u1".into(),
            name: "Anna".into(),
            age: Some(34),
            goals: Some("more calm".into()),
            passions: None,
            dream: Some("  ".into()),
            current_situation: Some("new job".into()),
            current_stage: 1,
            memory_summary: Some("Recurring themes: work".into()),
            telegram_id: None,
            created_at: Utc::now(),
        }
    }

    fn stage(stage_index: u32, name: &str) -> StageContext {
        StageContext {
            stage_index,
            stage_name: name.into(),
            unlocked_content_upper_bound: 3,
            is_channel_linked: false,
            advanced: false,
        }
    }

    fn reflection(episode: u32, text: &str) -> ReflectionEntry {
        ReflectionEntry {
            episode_number: episode,
            question: Some(format!("Question {}", episode)),
            response: text.into(),
            updated_at: Utc::now(),
        }
    }

    fn assembler() -> PromptAssembler {
        PromptAssembler::new(
            Arc::new(PersonaConfig::default()),
            Arc::new(StageMap::default()),
            5,
        )
    }

    #[test]
    fn completed_one_and_two_never_leak_later_material() {
        let assembler = assembler();
        let persona = PersonaConfig::default();
        let allowed: BTreeSet<u32> = [1, 2].into_iter().collect();
        let prompt = assembler.assemble_prompt(
            &stage(1, "Presence"),
            &allowed,
            &profile(),
            &[reflection(1, "a"), reflection(3, "peeked ahead")],
            Channel::Web,
            false,
        );

        for rule in persona.stage_rules.iter().filter(|r| r.from_week > 1) {
            assert!(!prompt.contains(rule.rules.trim()), "leaked {}", rule.title);
            assert!(!prompt.contains(&rule.title), "leaked {}", rule.title);
        }
        for reference in persona.references.iter().filter(|r| r.episode >= 3) {
            assert!(!prompt.contains(&reference.text));
        }
        assert!(!prompt.contains("peeked ahead"));
        assert!(prompt.contains(&persona.references[0].text));
    }

    /// Story names keyed by the episode that introduces them.
    const STORIES: &[(u32, &str)] = &[
        (1, "mary welcoming"),
        (2, "baptism"),
        (3, "psalm 139"),
        (4, "temptations in the desert"),
        (7, "leaving the nets"),
        (10, "beatitudes"),
        (22, "prodigal"),
        (25, "woman at the well"),
        (28, "walking on the water"),
    ];

    #[test]
    fn no_stage_leaks_stories_of_unfinished_episodes() {
        let assembler = assembler();
        let persona = PersonaConfig::default();
        let map = StageMap::default();

        for group in map.groups.iter().filter(|g| g.episodes.is_some()) {
            let (start, _) = group.episodes.unwrap();
            let allowed: BTreeSet<u32> = (1..start).collect();
            let prompt = assembler.assemble_prompt(
                &stage(group.first_week, &group.name),
                &allowed,
                &profile(),
                &[],
                Channel::Bridge,
                false,
            );
            let lowered = prompt.to_lowercase();

            for reference in persona.references.iter().filter(|r| !allowed.contains(&r.episode)) {
                assert!(
                    !prompt.contains(&reference.text),
                    "week {} leaked reference {}",
                    group.first_week,
                    reference.episode
                );
            }
            for (episode, story) in STORIES.iter().filter(|(ep, _)| !allowed.contains(ep)) {
                assert!(
                    !lowered.contains(story),
                    "week {} names '{}' from episode {}",
                    group.first_week,
                    story,
                    episode
                );
            }
            for later in persona.stage_rules.iter().filter(|r| r.from_week > group.last_week) {
                assert!(
                    !prompt.contains(&later.title),
                    "week {} shows later rule {}",
                    group.first_week,
                    later.title
                );
            }
        }
    }

    #[test]
    fn week_thirteen_keeps_later_forgiveness_stories_hidden() {
        let allowed: BTreeSet<u32> = (1..=18).collect();
        let prompt = assembler().assemble_prompt(
            &stage(13, "Forgiveness"),
            &allowed,
            &profile(),
            &[],
            Channel::Web,
            false,
        );
        assert!(prompt.contains("FORGIVENESS (care for the wounded)"));
        assert!(!prompt.contains("Prodigal Son"));
        assert!(!prompt.contains("woman at the well"));
        assert!(prompt.contains("Beatitudes"));
    }

    #[test]
    fn empty_allowed_set_forbids_content_references() {
        let assembler = assembler();
        let prompt = assembler.assemble_prompt(
            &stage(1, "Presence"),
            &BTreeSet::new(),
            &profile(),
            &[],
            Channel::Web,
            false,
        );
        assert!(prompt.contains(assembler.persona().no_references_note.trim()));
        assert!(!prompt.contains("Callbacks you may use"));
    }

    #[test]
    fn sections_follow_fixed_order_and_are_deterministic() {
        let assembler = assembler();
        let allowed: BTreeSet<u32> = [1, 2, 3, 4].into_iter().collect();
        let build = || {
            assembler.assemble_prompt(
                &stage(3, "Listening"),
                &allowed,
                &profile(),
                &[reflection(2, "quiet"), reflection(4, "loud")],
                Channel::Bridge,
                true,
            )
        };
        let prompt = build();
        assert_eq!(prompt, build());

        let persona = assembler.persona();
        let base = prompt.find("# YOUR ROLE").unwrap();
        let stage_at = prompt.find("# CURRENT STAGE").unwrap();
        let format_at = prompt.find("# RESPONSE FORMAT (Telegram)").unwrap();
        let refs_at = prompt.find("# NARRATIVE REFERENCES").unwrap();
        let context_at = prompt.find("# PERSON CONTEXT").unwrap();
        assert!(base < stage_at && stage_at < format_at);
        assert!(format_at < refs_at && refs_at < context_at);

        assert!(!prompt.contains("# RESPONSE FORMAT (Web Chat)"));
        assert!(prompt.contains("Stages already traversed: PRESENCE"));
        assert!(prompt.contains(persona.first_contact.bridge.trim()));
        assert!(prompt.contains("Episode 4 (\"Question 4\"): loud"));
    }

    #[test]
    fn person_context_skips_blank_fields_and_limits_reflections() {
        let assembler = PromptAssembler::new(
            Arc::new(PersonaConfig::default()),
            Arc::new(StageMap::default()),
            2,
        );
        let allowed: BTreeSet<u32> = (1..=4).collect();
        let reflections: Vec<_> = (1..=4).map(|n| reflection(n, &format!("text {}", n))).collect();
        let prompt = assembler.assemble_prompt(
            &stage(3, "Listening"),
            &allowed,
            &profile(),
            &reflections,
            Channel::Web,
            false,
        );
        assert!(prompt.contains("Goals: more calm"));
        assert!(!prompt.contains("Dream:"));
        assert!(!prompt.contains("text 2"));
        assert!(prompt.contains("text 3") && prompt.contains("text 4"));
        assert!(prompt.contains("Recurring themes: work"));
    }

    #[test]
    fn unregistered_prompt_carries_channel_format() {
        let assembler = assembler();
        let prompt = assembler.assemble_unregistered_prompt(Channel::Bridge);
        assert!(prompt.starts_with(assembler.persona().unregistered_prompt.trim()));
        assert!(prompt.contains("# RESPONSE FORMAT (Telegram)"));
        assert!(!prompt.contains("# PERSON CONTEXT"));
    }
}
