use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

/// Days tracked per weekly practice (two-week stage groups).
pub const PRACTICE_DAYS: usize = 14;
/// Practices seeded for every (user, week).
pub const PRACTICES_PER_WEEK: u32 = 3;

/// Delivery surface of a conversation. Each channel keeps its own history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Bridge,
}

impl Channel {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Bridge => "bridge",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bridge" | "telegram" => Channel::Bridge,
            _ => Channel::Web,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Persona,
}

impl TurnRole {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Persona => "persona",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "persona" | "assistant" => TurnRole::Persona,
            _ => TurnRole::User,
        }
    }
}

/// Identity and durable personalization state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub age: Option<u32>,
    pub goals: Option<String>,
    pub passions: Option<String>,
    pub dream: Option<String>,
    pub current_situation: Option<String>,
    /// Week number of the active stage group. Only ever moves forward.
    pub current_stage: u32,
    pub memory_summary: Option<String>,
    pub telegram_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registration payload for [`GuideDatabase::create_profile`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProfile {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub goals: Option<String>,
    #[serde(default)]
    pub passions: Option<String>,
    #[serde(default)]
    pub dream: Option<String>,
    #[serde(default)]
    pub current_situation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub episode_number: u32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub week_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub episode_number: u32,
    pub question: Option<String>,
    pub response: String,
    pub updated_at: DateTime<Utc>,
}

/// One persisted message on a (user, channel) stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub user_id: String,
    pub channel: Channel,
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyPractice {
    pub week_number: u32,
    pub practice_number: u32,
    pub completed_days: Vec<bool>,
    pub updated_at: DateTime<Utc>,
}

pub struct GuideDatabase {
    conn: Mutex<Connection>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_days(raw: String, idx: usize) -> rusqlite::Result<Vec<bool>> {
    let mut days: Vec<bool> = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    days.resize(PRACTICE_DAYS, false);
    Ok(days)
}

const PROFILE_COLUMNS: &str = "user_id, name, age, goals, passions, dream, current_situation, \
     current_stage, memory_summary, telegram_id, created_at";

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        user_id: row.get(0)?,
        name: row.get(1)?,
        age: row.get::<_, Option<i64>>(2)?.map(|a| a.max(0) as u32),
        goals: row.get(3)?,
        passions: row.get(4)?,
        dream: row.get(5)?,
        current_situation: row.get(6)?,
        current_stage: row.get::<_, i64>(7)?.max(1) as u32,
        memory_summary: row.get(8)?,
        telegram_id: row.get(9)?,
        created_at: parse_ts(row.get(10)?, 10)?,
    })
}

fn turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationTurn> {
    Ok(ConversationTurn {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel: Channel::from_db(&row.get::<_, String>(2)?),
        role: TurnRole::from_db(&row.get::<_, String>(3)?),
        content: row.get(4)?,
        created_at: parse_ts(row.get(5)?, 5)?,
    })
}

impl GuideDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                age INTEGER,
                goals TEXT,
                passions TEXT,
                dream TEXT,
                current_situation TEXT,
                current_stage INTEGER NOT NULL DEFAULT 1,
                memory_summary TEXT,
                telegram_id TEXT UNIQUE,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS episode_progress (
                user_id TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                week_number INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                PRIMARY KEY (user_id, episode_number)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS episode_reflections (
                user_id TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                reflection_question TEXT,
                reflection_text TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, episode_number)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversation_turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversation_turns_stream
             ON conversation_turns(user_id, channel, created_at DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS weekly_practices (
                user_id TEXT NOT NULL,
                week_number INTEGER NOT NULL,
                practice_number INTEGER NOT NULL,
                completed_days TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, week_number, practice_number)
            )"#,
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    /// Register a user. New profiles always start at stage 1.
    pub fn create_profile(&self, profile: &NewProfile) -> Result<UserProfile> {
        let user_id = profile.user_id.trim();
        if user_id.is_empty() {
            anyhow::bail!("user_id cannot be empty");
        }
        let now = Utc::now();
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO profiles (user_id, name, age, goals, passions, dream, current_situation, current_stage, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                params![
                    user_id,
                    profile.name.trim(),
                    profile.age.map(i64::from),
                    profile.goals,
                    profile.passions,
                    profile.dream,
                    profile.current_situation,
                    format_ts(now),
                ],
            )
            .with_context(|| format!("Failed to create profile {}", user_id))?;
        }
        self.get_profile(user_id)?
            .ok_or_else(|| anyhow::anyhow!("profile {} vanished after insert", user_id))
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.lock_conn()?;
        let profile = conn
            .query_row(
                &format!("SELECT {} FROM profiles WHERE user_id = ?1", PROFILE_COLUMNS),
                [user_id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    /// Resolve a messaging-bridge handle to the linked profile.
    pub fn get_profile_by_telegram_id(&self, telegram_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.lock_conn()?;
        let profile = conn
            .query_row(
                &format!(
                    "SELECT {} FROM profiles WHERE telegram_id = ?1",
                    PROFILE_COLUMNS
                ),
                [telegram_id.trim()],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    /// Store the bridge handle on a profile. Returns false when the user does not exist.
    pub fn link_telegram_id(&self, user_id: &str, telegram_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE profiles SET telegram_id = ?2 WHERE user_id = ?1",
            params![user_id, telegram_id.trim()],
        )?;
        Ok(updated > 0)
    }

    /// Move the stored stage forward to `stage`.
    ///
    /// The conditional update makes this monotonic even when two requests
    /// race: a lower target never overwrites a higher stored value.
    pub fn advance_stage(&self, user_id: &str, stage: u32) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE profiles SET current_stage = ?2 WHERE user_id = ?1 AND current_stage < ?2",
            params![user_id, i64::from(stage)],
        )?;
        Ok(updated > 0)
    }

    /// Overwrite the condensed memory summary (last write wins).
    pub fn set_memory_summary(&self, user_id: &str, summary: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE profiles SET memory_summary = ?2 WHERE user_id = ?1",
            params![user_id, summary],
        )?;
        if updated == 0 {
            anyhow::bail!("no profile for user {}", user_id);
        }
        Ok(())
    }

    // ========================================================================
    // Episode progress
    // ========================================================================

    /// Idempotently mark an episode complete.
    pub fn upsert_completion(
        &self,
        user_id: &str,
        episode_number: u32,
        week_number: u32,
    ) -> Result<CompletionRecord> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO episode_progress (user_id, episode_number, week_number, completed, completed_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(user_id, episode_number) DO UPDATE SET
                completed = 1,
                week_number = excluded.week_number,
                completed_at = COALESCE(episode_progress.completed_at, excluded.completed_at)",
            params![
                user_id,
                i64::from(episode_number),
                i64::from(week_number),
                format_ts(now)
            ],
        )?;
        let record = conn.query_row(
            "SELECT episode_number, completed, completed_at, week_number FROM episode_progress
             WHERE user_id = ?1 AND episode_number = ?2",
            params![user_id, i64::from(episode_number)],
            |row| {
                Ok(CompletionRecord {
                    episode_number: row.get::<_, i64>(0)? as u32,
                    completed: row.get::<_, i64>(1)? != 0,
                    completed_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|raw| parse_ts(raw, 2))
                        .transpose()?,
                    week_number: row.get::<_, i64>(3)? as u32,
                })
            },
        )?;
        Ok(record)
    }

    pub fn list_completions(&self, user_id: &str) -> Result<Vec<CompletionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT episode_number, completed, completed_at, week_number FROM episode_progress
             WHERE user_id = ?1
             ORDER BY episode_number ASC",
        )?;
        let records = stmt
            .query_map([user_id], |row| {
                Ok(CompletionRecord {
                    episode_number: row.get::<_, i64>(0)? as u32,
                    completed: row.get::<_, i64>(1)? != 0,
                    completed_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|raw| parse_ts(raw, 2))
                        .transpose()?,
                    week_number: row.get::<_, i64>(3)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Episode numbers with the completion flag set.
    pub fn completed_episodes(&self, user_id: &str) -> Result<BTreeSet<u32>> {
        Ok(self
            .list_completions(user_id)?
            .into_iter()
            .filter(|r| r.completed)
            .map(|r| r.episode_number)
            .collect())
    }

    // ========================================================================
    // Reflections
    // ========================================================================

    pub fn upsert_reflection(
        &self,
        user_id: &str,
        episode_number: u32,
        question: Option<&str>,
        response: &str,
    ) -> Result<ReflectionEntry> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO episode_reflections (user_id, episode_number, reflection_question, reflection_text, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, episode_number) DO UPDATE SET
                reflection_question = COALESCE(excluded.reflection_question, episode_reflections.reflection_question),
                reflection_text = excluded.reflection_text,
                updated_at = excluded.updated_at",
            params![
                user_id,
                i64::from(episode_number),
                question,
                response,
                format_ts(now)
            ],
        )?;
        drop(conn);
        self.get_reflection(user_id, episode_number)?
            .ok_or_else(|| anyhow::anyhow!("reflection vanished after upsert"))
    }

    pub fn get_reflection(
        &self,
        user_id: &str,
        episode_number: u32,
    ) -> Result<Option<ReflectionEntry>> {
        let conn = self.lock_conn()?;
        let entry = conn
            .query_row(
                "SELECT episode_number, reflection_question, reflection_text, updated_at
                 FROM episode_reflections
                 WHERE user_id = ?1 AND episode_number = ?2",
                params![user_id, i64::from(episode_number)],
                |row| {
                    Ok(ReflectionEntry {
                        episode_number: row.get::<_, i64>(0)? as u32,
                        question: row.get(1)?,
                        response: row.get(2)?,
                        updated_at: parse_ts(row.get(3)?, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// All reflections of a user in episode order.
    pub fn list_reflections(&self, user_id: &str) -> Result<Vec<ReflectionEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT episode_number, reflection_question, reflection_text, updated_at
             FROM episode_reflections
             WHERE user_id = ?1
             ORDER BY episode_number ASC",
        )?;
        let entries = stmt
            .query_map([user_id], |row| {
                Ok(ReflectionEntry {
                    episode_number: row.get::<_, i64>(0)? as u32,
                    question: row.get(1)?,
                    response: row.get(2)?,
                    updated_at: parse_ts(row.get(3)?, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ========================================================================
    // Conversation turns
    // ========================================================================

    pub fn record_turn(
        &self,
        user_id: &str,
        channel: Channel,
        role: TurnRole,
        content: &str,
    ) -> Result<ConversationTurn> {
        self.record_turn_at(user_id, channel, role, content, Utc::now())
    }

    pub fn record_turn_at(
        &self,
        user_id: &str,
        channel: Channel,
        role: TurnRole,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ConversationTurn> {
        let turn = ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            channel,
            role,
            content: content.to_string(),
            created_at,
        };
        let conn = self.lock_conn()?;
        insert_turn(&conn, &turn)?;
        Ok(turn)
    }

    /// Append a user turn and the persona reply in one transaction.
    pub fn record_exchange(
        &self,
        user_id: &str,
        channel: Channel,
        user_text: &str,
        persona_text: &str,
    ) -> Result<(ConversationTurn, ConversationTurn)> {
        let user_at = Utc::now();
        let persona_at = Utc::now().max(user_at + chrono::Duration::microseconds(1));
        let user_turn = ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            channel,
            role: TurnRole::User,
            content: user_text.to_string(),
            created_at: user_at,
        };
        let persona_turn = ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            channel,
            role: TurnRole::Persona,
            content: persona_text.to_string(),
            created_at: persona_at,
        };

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        insert_turn(&tx, &user_turn)?;
        insert_turn(&tx, &persona_turn)?;
        tx.commit().context("Failed to commit conversation exchange")?;
        Ok((user_turn, persona_turn))
    }

    /// The newest `limit` turns of one (user, channel) stream, newest first.
    pub fn latest_turns(
        &self,
        user_id: &str,
        channel: Channel,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, channel, role, content, created_at FROM conversation_turns
             WHERE user_id = ?1 AND channel = ?2
             ORDER BY created_at DESC, seq DESC
             LIMIT ?3",
        )?;
        let turns = stmt
            .query_map(
                params![user_id, channel.as_db_str(), limit as i64],
                turn_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    pub fn count_turns(&self, user_id: &str, channel: Channel) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM conversation_turns WHERE user_id = ?1 AND channel = ?2",
            params![user_id, channel.as_db_str()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Retention sweep: drop turns created before `cutoff` on every channel.
    pub fn delete_turns_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversation_turns WHERE created_at < ?1",
            [format_ts(cutoff)],
        )?;
        Ok(deleted)
    }

    // ========================================================================
    // Weekly practices
    // ========================================================================

    /// Practices for one week, seeding the empty set on first access.
    pub fn list_or_seed_practices(
        &self,
        user_id: &str,
        week_number: u32,
    ) -> Result<Vec<WeeklyPractice>> {
        let empty_days = serde_json::to_string(&vec![false; PRACTICE_DAYS])?;
        let now = format_ts(Utc::now());
        let conn = self.lock_conn()?;
        for practice_number in 1..=PRACTICES_PER_WEEK {
            conn.execute(
                "INSERT OR IGNORE INTO weekly_practices (user_id, week_number, practice_number, completed_days, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    i64::from(week_number),
                    i64::from(practice_number),
                    empty_days,
                    now
                ],
            )?;
        }

        let mut stmt = conn.prepare(
            "SELECT week_number, practice_number, completed_days, updated_at FROM weekly_practices
             WHERE user_id = ?1 AND week_number = ?2
             ORDER BY practice_number ASC",
        )?;
        let practices = stmt
            .query_map(params![user_id, i64::from(week_number)], |row| {
                Ok(WeeklyPractice {
                    week_number: row.get::<_, i64>(0)? as u32,
                    practice_number: row.get::<_, i64>(1)? as u32,
                    completed_days: parse_days(row.get(2)?, 2)?,
                    updated_at: parse_ts(row.get(3)?, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(practices)
    }

    /// Flip one day flag of a practice. `day` is 1-based.
    pub fn set_practice_day(
        &self,
        user_id: &str,
        week_number: u32,
        practice_number: u32,
        day: usize,
        completed: bool,
    ) -> Result<WeeklyPractice> {
        if day == 0 || day > PRACTICE_DAYS {
            anyhow::bail!("day must be between 1 and {}", PRACTICE_DAYS);
        }
        let practices = self.list_or_seed_practices(user_id, week_number)?;
        let mut practice = practices
            .into_iter()
            .find(|p| p.practice_number == practice_number)
            .ok_or_else(|| anyhow::anyhow!("practice {} does not exist", practice_number))?;

        practice.completed_days[day - 1] = completed;
        practice.updated_at = Utc::now();

        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE weekly_practices SET completed_days = ?4, updated_at = ?5
             WHERE user_id = ?1 AND week_number = ?2 AND practice_number = ?3",
            params![
                user_id,
                i64::from(week_number),
                i64::from(practice_number),
                serde_json::to_string(&practice.completed_days)?,
                format_ts(practice.updated_at),
            ],
        )?;
        Ok(practice)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

fn insert_turn(conn: &Connection, turn: &ConversationTurn) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_turns (id, user_id, channel, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            turn.id,
            turn.user_id,
            turn.channel.as_db_str(),
            turn.role.as_db_str(),
            turn.content,
            format_ts(turn.created_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seeded_db() -> GuideDatabase {
        let db = GuideDatabase::open_in_memory().expect("db init");
        db.create_profile(&NewProfile {
            user_id: "u1".to_string(),
            name: "Marta".to_string(),
            ..Default::default()
        })
        .expect("create profile");
        db
    }

    #[test]
    fn new_profiles_start_at_stage_one() {
        let db = seeded_db();
        let profile = db.get_profile("u1").unwrap().expect("profile exists");
        assert_eq!(profile.current_stage, 1);
        assert!(profile.memory_summary.is_none());
        assert!(db.get_profile("missing").unwrap().is_none());
    }

    #[test]
    fn stage_advance_never_regresses() {
        let db = seeded_db();
        assert!(db.advance_stage("u1", 5).unwrap());
        assert!(!db.advance_stage("u1", 3).unwrap());
        assert!(!db.advance_stage("u1", 5).unwrap());
        assert_eq!(db.get_profile("u1").unwrap().unwrap().current_stage, 5);
    }

    #[test]
    fn telegram_link_resolves_profile() {
        let db = seeded_db();
        assert!(db.link_telegram_id("u1", "987654").unwrap());
        assert!(!db.link_telegram_id("ghost", "1").unwrap());
        let profile = db
            .get_profile_by_telegram_id("987654")
            .unwrap()
            .expect("linked profile");
        assert_eq!(profile.user_id, "u1");
    }

    #[test]
    fn completion_upsert_is_idempotent() {
        let db = seeded_db();
        let first = db.upsert_completion("u1", 2, 1).unwrap();
        let second = db.upsert_completion("u1", 2, 1).unwrap();
        assert!(second.completed);
        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(db.list_completions("u1").unwrap().len(), 1);
        assert_eq!(
            db.completed_episodes("u1").unwrap().into_iter().collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn reflection_upsert_keeps_question_when_omitted() {
        let db = seeded_db();
        db.upsert_reflection("u1", 1, Some("What touched you?"), "The silence")
            .unwrap();
        let updated = db.upsert_reflection("u1", 1, None, "The silence, again").unwrap();
        assert_eq!(updated.question.as_deref(), Some("What touched you?"));
        assert_eq!(updated.response, "The silence, again");
        assert_eq!(db.list_reflections("u1").unwrap().len(), 1);
    }

    #[test]
    fn latest_turns_are_scoped_per_channel_and_newest_first() {
        let db = seeded_db();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        for idx in 0..5 {
            db.record_turn_at(
                "u1",
                Channel::Bridge,
                TurnRole::User,
                &format!("bridge {}", idx),
                base + chrono::Duration::seconds(idx),
            )
            .unwrap();
        }
        db.record_turn_at("u1", Channel::Web, TurnRole::User, "web 0", base)
            .unwrap();

        let latest = db.latest_turns("u1", Channel::Bridge, 3).unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].content, "bridge 4");
        assert_eq!(latest[2].content, "bridge 2");
        assert_eq!(db.count_turns("u1", Channel::Bridge).unwrap(), 5);
        assert_eq!(db.count_turns("u1", Channel::Web).unwrap(), 1);
    }

    #[test]
    fn exchange_writes_user_then_persona() {
        let db = seeded_db();
        db.record_exchange("u1", Channel::Web, "Ciao", "Welcome.")
            .unwrap();
        let latest = db.latest_turns("u1", Channel::Web, 10).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].role, TurnRole::Persona);
        assert_eq!(latest[1].role, TurnRole::User);
        assert!(latest[0].created_at > latest[1].created_at);
    }

    #[test]
    fn retention_sweep_removes_only_old_turns() {
        let db = seeded_db();
        let old = Utc::now() - chrono::Duration::days(120);
        db.record_turn_at("u1", Channel::Bridge, TurnRole::User, "old", old)
            .unwrap();
        db.record_turn("u1", Channel::Bridge, TurnRole::User, "fresh")
            .unwrap();

        let deleted = db
            .delete_turns_older_than(Utc::now() - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(deleted, 1);
        let remaining = db.latest_turns("u1", Channel::Bridge, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "fresh");
    }

    #[test]
    fn practices_seed_three_and_track_days() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = GuideDatabase::new(dir.path().join("practices.db")).expect("db init");

        let seeded = db.list_or_seed_practices("u1", 3).unwrap();
        assert_eq!(seeded.len(), 3);
        assert!(seeded.iter().all(|p| p.completed_days.len() == PRACTICE_DAYS));

        let updated = db.set_practice_day("u1", 3, 2, 14, true).unwrap();
        assert!(updated.completed_days[13]);

        let reloaded = db.list_or_seed_practices("u1", 3).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded[1].completed_days[13]);
        assert!(!reloaded[0].completed_days[13]);

        assert!(db.set_practice_day("u1", 3, 2, 15, true).is_err());
        assert!(db.set_practice_day("u1", 3, 4, 1, true).is_err());
    }
}
