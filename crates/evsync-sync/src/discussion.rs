//! Discussion pipeline: pick seed messages, build reply snippets, extract
//! ideas/apps per batch, then consolidate in one final call.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_adapters::ClassificationModel;
use evsync_core::ChatMessage;
use evsync_storage::CheckpointStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::{BatchProcessor, BatchRunner};
use crate::chat::{date_range, reaction_score};
use crate::classify::{clip, runner_config, Consolidation, ExtractedItem, ExtractionResult, ModelCaller, ReplyKind, ScoredItem};
use crate::PipelineSettings;

const EXTRACT_PROMPT: &str = "You read conversation snippets from a community chat. Each snippet starts with a SEED message \
followed by replies. Extract concrete product or project ideas people propose, and existing apps or tools they recommend.

Return a JSON object {\"ideas\": [...], \"apps\": [...]} where every item is {\"name\": string, \"description\": string, \
\"engagement\": number}. Engagement reflects reactions and replies. Return ONLY valid JSON, no markdown or explanation.";

const CONSOLIDATE_PROMPT: &str = "You receive ideas and apps extracted from many chat snippets. Merge duplicates, \
keep the most popular, and rank them.

Return a JSON object {\"ideas\": [...], \"apps\": [...]} where every item is {\"name\": string, \"description\": string, \
\"score\": number}. Return at most 10 of each. Return ONLY valid JSON, no markdown or explanation.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMessage {
    pub author: String,
    pub content: String,
    pub reactions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub author: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub seed: SeedMessage,
    pub replies: Vec<ReplyMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionStats {
    pub generated_at: DateTime<Utc>,
    pub total_messages: usize,
    pub first_date: String,
    pub last_date: String,
    pub ideas: Vec<ScoredItem>,
    pub apps: Vec<ScoredItem>,
}

fn is_bare_url(text: &str) -> bool {
    let text = text.trim();
    (text.starts_with("http://") || text.starts_with("https://")) && !text.chars().any(char::is_whitespace)
}

pub fn is_noise(content: &str, settings: &PipelineSettings) -> bool {
    content.chars().count() < settings.seed_min_content_length
        || settings
            .noise_prefixes
            .iter()
            .any(|prefix| content.starts_with(prefix.as_str()))
        || is_bare_url(content)
}

pub fn is_seed(content: &str, reactions: u64, settings: &PipelineSettings) -> bool {
    if is_noise(content, settings) {
        return false;
    }
    if reactions >= settings.seed_min_reaction_score {
        return true;
    }
    let lower = content.to_lowercase();
    settings
        .seed_keywords
        .iter()
        .any(|keyword| lower.contains(keyword.as_str()))
}

fn author_or_unknown(author: &str) -> String {
    if author.trim().is_empty() {
        "unknown".to_string()
    } else {
        author.to_string()
    }
}

/// Each seed claims up to `snippet_context_size` following messages that no
/// earlier snippet claimed; empty replies are claimed but not kept.
pub fn build_snippets(messages: &[ChatMessage], settings: &PipelineSettings) -> Vec<Snippet> {
    let limit = settings.content_slice_limit;
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut snippets = Vec::new();

    for (i, message) in messages.iter().enumerate() {
        if claimed.contains(&i) {
            continue;
        }
        let reactions = reaction_score(&message.reactions);
        if !is_seed(&message.content, reactions, settings) {
            continue;
        }
        claimed.insert(i);

        let window_end = (i + 1 + settings.snippet_context_size).min(messages.len());
        let mut replies = Vec::new();
        for j in (i + 1)..window_end {
            if !claimed.insert(j) {
                continue;
            }
            let reply = &messages[j];
            if !reply.content.is_empty() {
                replies.push(ReplyMessage {
                    author: author_or_unknown(&reply.author),
                    content: clip(&reply.content, limit),
                });
            }
        }

        snippets.push(Snippet {
            seed: SeedMessage {
                author: author_or_unknown(&message.author),
                content: clip(&message.content, limit),
                reactions,
            },
            replies,
        });
    }
    snippets
}

pub fn format_snippet(snippet: &Snippet, index: usize) -> String {
    let mut lines = vec![
        format!("--- Snippet {} ---", index + 1),
        format!(
            "[SEED] (reactions: {}) {}: \"{}\"",
            snippet.seed.reactions, snippet.seed.author, snippet.seed.content
        ),
    ];
    lines.extend(
        snippet
            .replies
            .iter()
            .map(|r| format!("[REPLY] {}: \"{}\"", r.author, r.content)),
    );
    lines.join("\n")
}

/// Top `n` items by engagement, used when consolidation keeps failing.
pub fn fallback_ranking(items: &[ExtractedItem], n: usize) -> Vec<ScoredItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| b.engagement.total_cmp(&a.engagement));
    sorted
        .into_iter()
        .take(n)
        .map(|item| ScoredItem {
            name: item.name,
            description: item.description,
            score: item.engagement,
        })
        .collect()
}

struct SnippetBatch<'a> {
    caller: &'a ModelCaller,
    snippets: &'a [Snippet],
    batch_size: usize,
}

#[async_trait]
impl<'a> BatchProcessor for SnippetBatch<'a> {
    type Accumulator = ExtractionResult;

    async fn process_batch(
        &self,
        start: usize,
        mut acc: Self::Accumulator,
    ) -> anyhow::Result<Self::Accumulator> {
        let end = (start + self.batch_size).min(self.snippets.len());
        let formatted = self.snippets[start..end]
            .iter()
            .enumerate()
            .map(|(offset, s)| format_snippet(s, start + offset))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("Extract ideas and apps from these conversation snippets:\n\n{formatted}");

        let extracted = self
            .caller
            .ask(ReplyKind::Extraction, EXTRACT_PROMPT, user)
            .await?
            .into_extraction()
            .ok_or_else(|| anyhow!("expected an extraction result"))?;
        acc.ideas.extend(extracted.ideas);
        acc.apps.extend(extracted.apps);
        Ok(acc)
    }

    fn describe(&self, acc: &Self::Accumulator) -> String {
        format!("ideas {} apps {}", acc.ideas.len(), acc.apps.len())
    }
}

pub struct DiscussionPipeline {
    caller: ModelCaller,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: PipelineSettings,
}

impl DiscussionPipeline {
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

    pub async fn run(&self, messages: &[ChatMessage], run_key: &str) -> anyhow::Result<DiscussionStats> {
        let snippets = build_snippets(messages, &self.settings);
        info!(snippets = snippets.len(), messages = messages.len(), "snippets built");

        let extracted = self.extract(&snippets, run_key).await?;
        info!(
            ideas = extracted.ideas.len(),
            apps = extracted.apps.len(),
            "extraction complete"
        );

        let consolidated = if extracted.ideas.is_empty() && extracted.apps.is_empty() {
            Consolidation::default()
        } else {
            self.consolidate(&extracted).await
        };

        let (first_date, last_date) = date_range(messages);
        Ok(DiscussionStats {
            generated_at: Utc::now(),
            total_messages: messages.len(),
            first_date,
            last_date,
            ideas: consolidated.ideas,
            apps: consolidated.apps,
        })
    }

    async fn extract(&self, snippets: &[Snippet], run_key: &str) -> anyhow::Result<ExtractionResult> {
        if snippets.is_empty() {
            return Ok(ExtractionResult::default());
        }
        let processor = SnippetBatch {
            caller: &self.caller,
            snippets,
            batch_size: self.settings.snippet_batch_size,
        };
        let runner = BatchRunner::new(
            self.checkpoints.clone(),
            runner_config(
                &self.settings,
                "extract ideas",
                &format!("{run_key}-extract"),
                processor.batch_size,
                snippets.len(),
            ),
        );
        Ok(runner.run(&processor, ExtractionResult::default()).await?)
    }

    /// One call plus one retry; falls back to engagement ranking.
    async fn consolidate(&self, extracted: &ExtractionResult) -> Consolidation {
        let payload = match serde_json::to_string(extracted) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not serialize extractions, using raw ranking");
                return self.fallback(extracted);
            }
        };
        let user = format!("Consolidate and rank these extracted items:\n\n{payload}");

        for attempt in 0..2 {
            let reply = self
                .caller
                .ask(ReplyKind::Consolidation, CONSOLIDATE_PROMPT, user.clone())
                .await
                .and_then(|r| r.into_consolidation().ok_or_else(|| anyhow!("expected a consolidation")));
            match reply {
                Ok(consolidated) => return consolidated,
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %format!("{err:#}"), "consolidation failed");
                    if attempt == 0 {
                        tokio::time::sleep(self.settings.retry_delay()).await;
                    }
                }
            }
        }
        warn!("using raw extractions ranked by engagement");
        self.fallback(extracted)
    }

    fn fallback(&self, extracted: &ExtractionResult) -> Consolidation {
        Consolidation {
            ideas: fallback_ranking(&extracted.ideas, self.settings.fallback_top_n),
            apps: fallback_ranking(&extracted.apps, self.settings.fallback_top_n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::testing::ScriptedModel;
    use evsync_storage::MemoryCheckpointStore;

    fn message(content: &str, reactions: &str) -> ChatMessage {
        ChatMessage {
            author: "dee".into(),
            date: "2024-10-01T12:00:00Z".into(),
            content: content.into(),
            reactions: reactions.into(),
            ..Default::default()
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            snippet_context_size: 2,
            ..PipelineSettings::immediate()
        }
    }

    fn item(name: &str, engagement: f64) -> ExtractedItem {
        ExtractedItem {
            name: name.into(),
            description: String::new(),
            engagement,
        }
    }

    #[test]
    fn noise_rules() {
        let s = settings();
        assert!(is_noise("short", &s));
        assert!(is_noise("https://example.com/a-very-long-link-that-is-long", &s));
        assert!(!is_noise("someone should build a shared calendar for the village", &s));
        assert!(!is_seed("a perfectly ordinary sentence about the weather today", 0, &s));
        assert!(is_seed("a perfectly ordinary sentence about the weather today", 5, &s));
        assert!(is_seed("what if we had an app for booking the sauna slots", 0, &s));
    }

    #[test]
    fn seeds_claim_following_replies_once() {
        let s = settings();
        let messages = vec![
            message("we should build an app that tracks who is in the cowork", ""),
            message("yes please", ""),
            message("", ""),
            message("another idea: a tool to split grocery bills automatically", "(4)"),
            message("love it", ""),
        ];

        let snippets = build_snippets(&messages, &s);

        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].replies.len(), 1);
        assert_eq!(snippets[1].seed.reactions, 4);
        assert_eq!(snippets[1].replies[0].content, "love it");
        let text = format_snippet(&snippets[1], 1);
        assert!(text.starts_with("--- Snippet 2 ---\n[SEED] (reactions: 4) dee:"));
    }

    #[test]
    fn fallback_keeps_top_by_engagement() {
        let ranked = fallback_ranking(&[item("a", 1.0), item("b", 7.0), item("c", 3.0)], 2);
        let names = ranked.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(ranked[0].score, 7.0);
    }

    #[tokio::test]
    async fn consolidation_double_failure_falls_back() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"ideas": [{"name": "Sauna booking", "description": "slots", "engagement": 5}], "apps": [{"name": "Splitwise", "engagement": 2}]}"#,
            "not json",
            "still not json",
        ]));
        let pipeline = DiscussionPipeline::new(model.clone(), Arc::new(MemoryCheckpointStore::new()), settings());
        let messages = vec![message("what if there was an app for booking sauna slots", "(3)")];

        let stats = pipeline.run(&messages, "discussion-test").await.unwrap();

        assert_eq!(model.request_count(), 3);
        assert_eq!(stats.ideas.len(), 1);
        assert_eq!(stats.ideas[0].name, "Sauna booking");
        assert_eq!(stats.ideas[0].score, 5.0);
        assert_eq!(stats.apps[0].name, "Splitwise");
        assert_eq!(stats.first_date, "2024-10-01");
    }

    #[tokio::test]
    async fn consolidated_reply_is_used_when_valid() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"ideas": [{"name": "Sauna booking", "engagement": 5}], "apps": []}"#,
            r#"```json
{"ideas": [{"name": "Sauna scheduler", "description": "merged", "score": 9}], "apps": []}
```"#,
        ]));
        let pipeline = DiscussionPipeline::new(model, Arc::new(MemoryCheckpointStore::new()), settings());
        let messages = vec![message("what if there was an app for booking sauna slots", "")];

        let stats = pipeline.run(&messages, "discussion-ok").await.unwrap();
        assert_eq!(stats.ideas[0].name, "Sauna scheduler");
        assert!(stats.apps.is_empty());
    }

    #[tokio::test]
    async fn nothing_to_extract_skips_the_model() {
        let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
        let pipeline = DiscussionPipeline::new(model.clone(), Arc::new(MemoryCheckpointStore::new()), settings());

        let stats = pipeline.run(&[message("gm", "")], "discussion-empty").await.unwrap();
        assert_eq!(model.request_count(), 0);
        assert!(stats.ideas.is_empty());
    }
}
