//! Read-only access to episodes and week overviews.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GuideError, GuideResult};

pub const NOTION_API_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUnit {
    pub number: u32,
    pub title: String,
    pub lead_text: String,
    pub guidance_text: String,
    pub reflection_prompt: String,
    pub takeaway_text: String,
    /// First week of the stage group holding this episode.
    pub stage_tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOverview {
    pub week: u32,
    pub theme: String,
    pub guiding_question: String,
    pub essence: String,
    pub mantra: String,
    pub practice_list: Vec<String>,
    pub key_insight: String,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn get_content_unit(&self, number: u32, stage_tag: u32) -> GuideResult<ContentUnit>;
    async fn get_stage_overview(&self, week: u32) -> GuideResult<StageOverview>;
}

/// In-memory provider for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticContentProvider {
    units: BTreeMap<u32, ContentUnit>,
    overviews: BTreeMap<u32, StageOverview>,
}

impl StaticContentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: ContentUnit) -> Self {
        self.units.insert(unit.number, unit);
        self
    }

    pub fn with_overview(mut self, overview: StageOverview) -> Self {
        self.overviews.insert(overview.week, overview);
        self
    }
}

#[async_trait]
impl ContentProvider for StaticContentProvider {
    async fn get_content_unit(&self, number: u32, stage_tag: u32) -> GuideResult<ContentUnit> {
        let mut unit = self
            .units
            .get(&number)
            .cloned()
            .ok_or_else(|| GuideError::ContentNotFound(format!("episode {}", number)))?;
        unit.stage_tag = stage_tag;
        Ok(unit)
    }

    async fn get_stage_overview(&self, week: u32) -> GuideResult<StageOverview> {
        self.overviews
            .get(&week)
            .cloned()
            .ok_or_else(|| GuideError::ContentNotFound(format!("week {}", week)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotionSettings {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_notion_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub episodes_database_id: String,
    #[serde(default)]
    pub weeks_database_id: String,
}

fn default_notion_api_url() -> String {
    NOTION_API_URL.to_string()
}

impl Default for NotionSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: default_notion_api_url(),
            episodes_database_id: String::new(),
            weeks_database_id: String::new(),
        }
    }
}

impl NotionSettings {
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty()
            && !self.episodes_database_id.is_empty()
            && !self.weeks_database_id.is_empty()
    }
}

pub struct NotionContentProvider {
    settings: NotionSettings,
    client: reqwest::Client,
}

impl NotionContentProvider {
    pub fn new(settings: NotionSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// First page of `database_id` whose `Numero` property equals `number`.
    async fn query_by_number(&self, database_id: &str, number: u32) -> anyhow::Result<Option<Value>> {
        let url = format!(
            "{}/databases/{}/query",
            self.settings.api_url.trim_end_matches('/'),
            database_id
        );
        let body = json!({
            "filter": { "property": "Numero", "number": { "equals": number } },
            "page_size": 1
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.settings.token))
            .header("Notion-Version", NOTION_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to query Notion database")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Notion API returned error {}: {}", status, body);
        }

        let mut data: Value = response
            .json()
            .await
            .context("Failed to parse Notion response")?;
        let page = data
            .get_mut("results")
            .and_then(Value::as_array_mut)
            .and_then(|results| (!results.is_empty()).then(|| results.swap_remove(0)));
        Ok(page)
    }
}

#[async_trait]
impl ContentProvider for NotionContentProvider {
    async fn get_content_unit(&self, number: u32, stage_tag: u32) -> GuideResult<ContentUnit> {
        let page = self
            .query_by_number(&self.settings.episodes_database_id, number)
            .await?
            .ok_or_else(|| GuideError::ContentNotFound(format!("episode {}", number)))?;
        Ok(episode_from_page(&page, number, stage_tag))
    }

    async fn get_stage_overview(&self, week: u32) -> GuideResult<StageOverview> {
        let page = self
            .query_by_number(&self.settings.weeks_database_id, week)
            .await?
            .ok_or_else(|| GuideError::ContentNotFound(format!("week {}", week)))?;
        Ok(overview_from_page(&page, week))
    }
}

/// Plain text of a rich_text, title or select property.
fn property_text(page: &Value, name: &str) -> String {
    let Some(prop) = page.get("properties").and_then(|p| p.get(name)) else {
        return String::new();
    };
    if let Some(select) = prop.get("select").and_then(|s| s.get("name")) {
        return select.as_str().unwrap_or_default().to_string();
    }
    let fragments = prop
        .get("rich_text")
        .or_else(|| prop.get("title"))
        .and_then(Value::as_array);
    match fragments {
        Some(fragments) => fragments
            .iter()
            .filter_map(|f| f.get("plain_text").and_then(Value::as_str))
            .collect(),
        None => String::new(),
    }
}

fn episode_from_page(page: &Value, number: u32, stage_tag: u32) -> ContentUnit {
    let title = property_text(page, "Titolo episodio");
    ContentUnit {
        number,
        title: if title.is_empty() {
            format!("Episode {}", number)
        } else {
            title
        },
        lead_text: property_text(page, "Mini-lezione breve"),
        guidance_text: property_text(page, "Tema principale"),
        reflection_prompt: property_text(page, "Domanda riflessiva"),
        takeaway_text: property_text(page, "Concetti collegati"),
        stage_tag,
    }
}

fn overview_from_page(page: &Value, week: u32) -> StageOverview {
    let practice_list = property_text(page, "Pratiche")
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '•', '*']).trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    StageOverview {
        week,
        theme: property_text(page, "Tema principale"),
        guiding_question: property_text(page, "Titolo"),
        essence: property_text(page, "Fase"),
        mantra: property_text(page, "Mantra"),
        practice_list,
        key_insight: property_text(page, "Versetto guida"),
    }
}
