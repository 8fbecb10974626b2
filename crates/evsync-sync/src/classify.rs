//! Classification adapter: prompt formatting, reply parsing and the
//! batch processors that drive the remote model.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use evsync_adapters::{strip_code_fence, ClassificationModel, CompletionRequest};
use evsync_core::{Event, EventCategory};
use evsync_storage::CheckpointStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::batch::{BatchError, BatchProcessor, BatchRunner, BatchRunnerConfig};
use crate::PipelineSettings;

pub const UNKNOWN_MEMBER_CATEGORY: &str = "Unknown";

pub const MEMBER_SKILL_CATEGORIES: &[&str] = &[
    "Software Engineering",
    "Crypto & Web3",
    "Design & Creative",
    "Marketing & Growth",
    "Finance & Trading",
    "Data & AI",
    "Product Management",
    "Research & Academia",
    "Healthcare",
    "Law & Policy",
    "Content Creation",
    "Education",
    "Business & Entrepreneurship",
    "Operations",
    UNKNOWN_MEMBER_CATEGORY,
];

pub const MEMBER_INTEREST_CATEGORIES: &[&str] = &[
    "Health & Fitness",
    "Networking & Community",
    "Technology",
    "Travel & Culture",
    "Arts & Music",
    "Gaming",
    "Sports",
    "Reading & Learning",
    "Nature & Outdoors",
    "Food & Cooking",
    "Philosophy & Mindfulness",
    "Social Impact",
    "Finance & Investing",
    UNKNOWN_MEMBER_CATEGORY,
];

const EVENT_CATEGORIZE_PROMPT: &str = "You categorize community events. Each line is `id: title - description`. \
Assign exactly one category per event using ONLY these exact names: {categories}.\n\n\
Return a JSON object mapping each event id to its category string. Return ONLY valid JSON, no markdown or explanation.";

const TERM_CATEGORIZE_PROMPT: &str = "You categorize {term_type} terms into predefined categories. \
You MUST use ONLY these exact category names: {categories}. If a term does not fit any category, map it to \"Unknown\".\n\n\
Return a JSON object mapping each input term (lowercase) to its category string. Return ONLY valid JSON, no markdown or explanation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    CategoryMap,
    MessageClassifications,
    Extraction,
    Consolidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Intro,
    #[serde(other)]
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageClassification {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub skills: String,
    #[serde(default)]
    pub interests: String,
    #[serde(default)]
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub engagement: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub ideas: Vec<ExtractedItem>,
    #[serde(default)]
    pub apps: Vec<ExtractedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    #[serde(default)]
    pub ideas: Vec<ScoredItem>,
    #[serde(default)]
    pub apps: Vec<ScoredItem>,
}

/// A parsed model reply. Which variant is expected is decided by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// item id or term -> raw category label; non-string values are dropped.
    CategoryMap(BTreeMap<String, String>),
    MessageClassifications(BTreeMap<usize, MessageClassification>),
    Extraction(ExtractionResult),
    Consolidation(Consolidation),
}

#[derive(Debug, Error)]
#[error("unparseable {kind:?} reply ({excerpt:?})")]
pub struct ParseError {
    pub kind: ReplyKind,
    pub excerpt: String,
    #[source]
    pub source: serde_json::Error,
}

impl ModelReply {
    /// Strip an optional code fence and decode `text` as `kind`.
    pub fn parse(kind: ReplyKind, text: &str) -> Result<Self, ParseError> {
        let body = strip_code_fence(text);
        let wrap = |source: serde_json::Error| ParseError {
            kind,
            excerpt: body.chars().take(80).collect(),
            source,
        };

        let reply = match kind {
            ReplyKind::CategoryMap => {
                let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(body).map_err(wrap)?;
                ModelReply::CategoryMap(
                    raw.into_iter()
                        .filter_map(|(k, v)| v.as_str().map(|label| (k, label.to_string())))
                        .collect(),
                )
            }
            ReplyKind::MessageClassifications => {
                ModelReply::MessageClassifications(serde_json::from_str(body).map_err(wrap)?)
            }
            ReplyKind::Extraction => ModelReply::Extraction(serde_json::from_str(body).map_err(wrap)?),
            ReplyKind::Consolidation => ModelReply::Consolidation(serde_json::from_str(body).map_err(wrap)?),
        };
        Ok(reply)
    }

    pub fn into_category_map(self) -> Option<BTreeMap<String, String>> {
        match self {
            ModelReply::CategoryMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_message_classifications(self) -> Option<BTreeMap<usize, MessageClassification>> {
        match self {
            ModelReply::MessageClassifications(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_extraction(self) -> Option<ExtractionResult> {
        match self {
            ModelReply::Extraction(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_consolidation(self) -> Option<Consolidation> {
        match self {
            ModelReply::Consolidation(result) => Some(result),
            _ => None,
        }
    }
}

/// Drop control characters the completion API rejects; keeps tab and newlines.
pub fn sanitize_for_model(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(*c, '\t' | '\n' | '\r'))
        .collect()
}

pub fn clip(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// One model call per batch: build the request, send it, parse the reply.
#[derive(Clone)]
pub struct ModelCaller {
    model: Arc<dyn ClassificationModel>,
    model_id: String,
    max_tokens: u32,
}

impl ModelCaller {
    pub fn new(model: Arc<dyn ClassificationModel>, settings: &PipelineSettings) -> Self {
        Self {
            model,
            model_id: settings.model.clone(),
            max_tokens: settings.max_tokens,
        }
    }

    pub async fn ask(&self, kind: ReplyKind, system: &str, user: String) -> anyhow::Result<ModelReply> {
        let request = CompletionRequest {
            model: self.model_id.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            user: sanitize_for_model(&user),
        };
        let text = self.model.complete(&request).await?;
        debug!(?kind, chars = text.len(), "parsing model reply");
        Ok(ModelReply::parse(kind, &text)?)
    }
}

pub(crate) fn runner_config(
    settings: &PipelineSettings,
    label: &str,
    progress_key: &str,
    batch_size: usize,
    total: usize,
) -> BatchRunnerConfig {
    BatchRunnerConfig::new(label, progress_key, batch_size, total)
        .with_delays(settings.batch_delay(), settings.retry_delay())
}

pub fn event_prompt_line(id: &str, event: &Event, description_limit: usize) -> String {
    match event.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(desc) => format!("{id}: {} - {}", event.title, clip(desc, description_limit)),
        None => format!("{id}: {}", event.title),
    }
}

fn event_system_prompt() -> String {
    let categories = EventCategory::ALL
        .iter()
        .map(|c| c.label())
        .collect::<Vec<_>>()
        .join(", ");
    EVENT_CATEGORIZE_PROMPT.replace("{categories}", &categories)
}

struct EventBatch<'a> {
    caller: &'a ModelCaller,
    system: String,
    events: &'a [Event],
    batch_size: usize,
    description_limit: usize,
}

#[async_trait]
impl<'a> BatchProcessor for EventBatch<'a> {
    type Accumulator = BTreeMap<String, EventCategory>;

    async fn process_batch(
        &self,
        start: usize,
        mut acc: Self::Accumulator,
    ) -> anyhow::Result<Self::Accumulator> {
        let end = (start + self.batch_size).min(self.events.len());
        let lines = self.events[start..end]
            .iter()
            .map(|e| event_prompt_line(e.identity_key().as_str(), e, self.description_limit))
            .collect::<Vec<_>>();
        let user = format!("Categorize these events:\n\n{}", lines.join("\n"));

        let labels = self
            .caller
            .ask(ReplyKind::CategoryMap, &self.system, user)
            .await?
            .into_category_map()
            .ok_or_else(|| anyhow!("expected a category map"))?;

        for event in &self.events[start..end] {
            let key = event.identity_key().to_string();
            let category = labels
                .get(&key)
                .map(|label| EventCategory::coerce(label))
                .unwrap_or_default();
            acc.insert(key, category);
        }
        Ok(acc)
    }

    fn describe(&self, acc: &Self::Accumulator) -> String {
        format!("categorized {}", acc.len())
    }
}

/// Assigns an [`EventCategory`] to each event, keyed by identity key.
pub struct EventCategorizer {
    caller: ModelCaller,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: PipelineSettings,
}

impl EventCategorizer {
    pub fn new(
        model: Arc<dyn ClassificationModel>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            caller: ModelCaller::new(model, &settings),
            checkpoints,
            settings,
        }
    }

    pub async fn categorize(
        &self,
        events: &[Event],
        progress_key: &str,
    ) -> Result<BTreeMap<String, EventCategory>, BatchError> {
        if events.is_empty() {
            return Ok(BTreeMap::new());
        }
        let processor = EventBatch {
            caller: &self.caller,
            system: event_system_prompt(),
            events,
            batch_size: self.settings.event_batch_size,
            description_limit: self.settings.description_slice_limit,
        };
        let runner = BatchRunner::new(
            self.checkpoints.clone(),
            runner_config(
                &self.settings,
                "categorize events",
                progress_key,
                processor.batch_size,
                events.len(),
            ),
        );
        runner.run(&processor, BTreeMap::new()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermType {
    Skills,
    Interests,
}

impl TermType {
    pub fn as_str(self) -> &'static str {
        match self {
            TermType::Skills => "skills",
            TermType::Interests => "interests",
        }
    }

    pub fn categories(self) -> &'static [&'static str] {
        match self {
            TermType::Skills => MEMBER_SKILL_CATEGORIES,
            TermType::Interests => MEMBER_INTEREST_CATEGORIES,
        }
    }

    /// Labels outside this term type's list become `Unknown`.
    pub fn coerce(self, label: &str) -> String {
        let label = label.trim();
        if self.categories().contains(&label) {
            label.to_string()
        } else {
            UNKNOWN_MEMBER_CATEGORY.to_string()
        }
    }

    fn system_prompt(self) -> String {
        let categories = self
            .categories()
            .iter()
            .filter(|c| **c != UNKNOWN_MEMBER_CATEGORY)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        TERM_CATEGORIZE_PROMPT
            .replace("{term_type}", self.as_str())
            .replace("{categories}", &categories)
    }
}

struct TermBatch<'a> {
    caller: &'a ModelCaller,
    term_type: TermType,
    system: String,
    terms: &'a [String],
    batch_size: usize,
}

#[async_trait]
impl<'a> BatchProcessor for TermBatch<'a> {
    type Accumulator = BTreeMap<String, String>;

    async fn process_batch(
        &self,
        start: usize,
        mut acc: Self::Accumulator,
    ) -> anyhow::Result<Self::Accumulator> {
        let end = (start + self.batch_size).min(self.terms.len());
        let batch = &self.terms[start..end];
        let user = format!(
            "Categorize these {}:\n\n{}",
            self.term_type.as_str(),
            batch.join("\n")
        );

        let labels = self
            .caller
            .ask(ReplyKind::CategoryMap, &self.system, user)
            .await?
            .into_category_map()
            .ok_or_else(|| anyhow!("expected a category map"))?;

        for term in batch {
            let category = labels
                .get(term)
                .map(|label| self.term_type.coerce(label))
                .unwrap_or_else(|| UNKNOWN_MEMBER_CATEGORY.to_string());
            acc.insert(term.clone(), category);
        }
        Ok(acc)
    }

    fn describe(&self, acc: &Self::Accumulator) -> String {
        format!("mapped {} {}", acc.len(), self.term_type.as_str())
    }
}

/// Maps free-text member terms onto the fixed skill or interest categories.
pub struct TermCategorizer {
    caller: ModelCaller,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: PipelineSettings,
}

impl TermCategorizer {
    pub fn new(
        model: Arc<dyn ClassificationModel>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            caller: ModelCaller::new(model, &settings),
            checkpoints,
            settings,
        }
    }

    pub async fn categorize(
        &self,
        terms: &[String],
        term_type: TermType,
        progress_key: &str,
    ) -> Result<BTreeMap<String, String>, BatchError> {
        if terms.is_empty() {
            return Ok(BTreeMap::new());
        }
        let processor = TermBatch {
            caller: &self.caller,
            term_type,
            system: term_type.system_prompt(),
            terms,
            batch_size: self.settings.term_batch_size,
        };
        let label = format!("categorize {}", term_type.as_str());
        let runner = BatchRunner::new(
            self.checkpoints.clone(),
            runner_config(&self.settings, &label, progress_key, processor.batch_size, terms.len()),
        );
        runner.run(&processor, BTreeMap::new()).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedModel;
    use super::*;
    use chrono::{TimeZone, Utc};
    use evsync_storage::MemoryCheckpointStore;

    fn settings() -> PipelineSettings {
        PipelineSettings::immediate()
    }

    fn event(id: &str, title: &str) -> Event {
        Event::new(title, Utc.with_ymd_and_hms(2025, 4, 2, 18, 0, 0).single().unwrap()).with_external_id(id)
    }

    #[test]
    fn parses_fenced_category_map_and_drops_non_strings() {
        let reply = ModelReply::parse(
            ReplyKind::CategoryMap,
            "```json\n{\"evt-1\": \"AI & Data\", \"evt-2\": 7}\n```",
        )
        .unwrap();
        let map = reply.into_category_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["evt-1"], "AI & Data");
    }

    #[test]
    fn message_classifications_key_by_index() {
        let reply = ModelReply::parse(
            ReplyKind::MessageClassifications,
            r#"{"0": {"type": "intro", "country": "PT", "skills": "rust", "interests": "surfing", "when": "-"},
                "1": {"type": "banter"}}"#,
        )
        .unwrap();
        let map = reply.into_message_classifications().unwrap();
        assert_eq!(map[&0].kind, MessageKind::Intro);
        assert_eq!(map[&1].kind, MessageKind::Skip);
    }

    #[test]
    fn prose_reply_is_a_parse_error() {
        let err = ModelReply::parse(ReplyKind::Extraction, "Sure! Here are the ideas").unwrap_err();
        assert_eq!(err.kind, ReplyKind::Extraction);
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize_for_model("a\u{0}b\u{7}c\nd"), "abc\nd");
    }

    #[test]
    fn term_labels_outside_list_become_unknown() {
        assert_eq!(TermType::Skills.coerce("Data & AI"), "Data & AI");
        assert_eq!(TermType::Skills.coerce("Gaming"), "Unknown");
        assert_eq!(TermType::Interests.coerce("Gaming"), "Gaming");
    }

    #[tokio::test]
    async fn event_labels_are_coerced_and_missing_ids_default_to_other() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"evt-1": "AI & Data", "evt-2": "Quantum Knitting"}"#,
        ]));
        let categorizer = EventCategorizer::new(
            model.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings(),
        );
        let events = vec![event("evt-1", "LLM meetup"), event("evt-2", "Knit"), event("evt-3", "Mystery")];

        let map = categorizer.categorize(&events, "cat-test").await.unwrap();

        assert_eq!(map["evt-1"], EventCategory::AiData);
        assert_eq!(map["evt-2"], EventCategory::Other);
        assert_eq!(map["evt-3"], EventCategory::Other);
        let prompt = &model.requests.lock().unwrap()[0].user;
        assert!(prompt.contains("evt-1: LLM meetup"));
    }

    #[tokio::test]
    async fn garbage_reply_is_retried_once_as_a_batch_failure() {
        let model = Arc::new(ScriptedModel::new(["not json", r#"{"evt-1": "Food & Dining"}"#]));
        let categorizer = EventCategorizer::new(
            model.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings(),
        );

        let map = categorizer
            .categorize(&[event("evt-1", "Ramen night")], "cat-retry")
            .await
            .unwrap();

        assert_eq!(map["evt-1"], EventCategory::FoodDining);
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn terms_are_batched_and_coerced() {
        let model = Arc::new(ScriptedModel::new([r#"{"rust": "Software Engineering", "poker": "Card Games"}"#]));
        let categorizer = TermCategorizer::new(
            model,
            Arc::new(MemoryCheckpointStore::new()),
            settings(),
        );

        let map = categorizer
            .categorize(&["rust".to_string(), "poker".to_string()], TermType::Skills, "terms")
            .await
            .unwrap();

        assert_eq!(map["rust"], "Software Engineering");
        assert_eq!(map["poker"], "Unknown");
    }
}
