//! Member-intro pipeline: classify reception messages, categorize the
//! skills and interests they mention, aggregate counts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use evsync_adapters::ClassificationModel;
use evsync_core::ChatMessage;
use evsync_storage::CheckpointStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::{BatchProcessor, BatchRunner};
use crate::chat::{as_ordered_map, date_range, ranked_counts};
use crate::classify::{
    clip, runner_config, MessageKind, ModelCaller, ReplyKind, TermCategorizer, TermType, UNKNOWN_MEMBER_CATEGORY,
};
use crate::PipelineSettings;

const RECEPTION_CLASSIFY_PROMPT: &str = "You classify Discord messages from a community reception channel. Each message has an index and a post date.

For each message, return a JSON object keyed by index with:
- \"type\": \"intro\" if the person is introducing themselves, otherwise \"skip\"
- \"country\": 2-letter ISO country code based on where they say they're from, or \"-\" if not stated or ambiguous
- \"skills\": comma-separated skills/expertise they mention, or \"-\"
- \"interests\": comma-separated interests/hobbies they mention, or \"-\"
- \"when\": the month they plan to attend in \"MMM YYYY\" format, or \"-\" if not mentioned. Use the post date to resolve relative dates.

Return ONLY valid JSON, no markdown or explanation.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroRecord {
    pub author: String,
    pub author_id: String,
    pub country: String,
    pub skills: String,
    pub interests: String,
    pub when: String,
}

/// Intros grouped by the month the member plans to arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthBreakdown {
    pub month: String,
    pub total_intros: usize,
    #[serde(serialize_with = "as_ordered_map")]
    pub countries: Vec<(String, u64)>,
    #[serde(serialize_with = "as_ordered_map")]
    pub skill_categories: Vec<(String, u64)>,
    #[serde(serialize_with = "as_ordered_map")]
    pub interest_categories: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStats {
    pub generated_at: DateTime<Utc>,
    pub total_messages: usize,
    pub total_intros: usize,
    pub first_date: String,
    pub last_date: String,
    #[serde(serialize_with = "as_ordered_map")]
    pub skill_categories: Vec<(String, u64)>,
    #[serde(serialize_with = "as_ordered_map")]
    pub interest_categories: Vec<(String, u64)>,
    pub months: Vec<MonthBreakdown>,
    pub skill_category_mapping: BTreeMap<String, String>,
    pub interest_category_mapping: BTreeMap<String, String>,
}

/// Lower-cased, trimmed, comma-separated terms; `-` means none.
pub fn split_terms(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return Vec::new();
    }
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn message_prompt_line(index: usize, message: &ChatMessage, content_limit: usize) -> String {
    format!(
        "[{index}] (posted {}): {}",
        message.day().unwrap_or("unknown"),
        clip(&message.content, content_limit)
    )
}

fn month_key(when: &str) -> String {
    let when = when.trim();
    if when.is_empty() {
        "-".to_string()
    } else {
        when.to_string()
    }
}

/// `MMM YYYY` (e.g. `Oct 2024`) as the first of that month.
fn parse_month(month: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("01 {month}"), "%d %b %Y").ok()
}

/// Chronological; unparseable months after dated ones, `-` last.
fn month_order(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a == "-", b == "-") {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    match (parse_month(a), parse_month(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn lookup_category(map: &BTreeMap<String, String>, term: &str) -> String {
    map.get(term)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_MEMBER_CATEGORY.to_string())
}

/// Per-month country, skill and interest counts. Countries given as `-` are not counted.
pub fn month_breakdown(
    intros: &[IntroRecord],
    skill_map: &BTreeMap<String, String>,
    interest_map: &BTreeMap<String, String>,
) -> Vec<MonthBreakdown> {
    let mut grouped: BTreeMap<String, Vec<&IntroRecord>> = BTreeMap::new();
    for intro in intros {
        grouped.entry(month_key(&intro.when)).or_default().push(intro);
    }

    let mut months = grouped
        .into_iter()
        .map(|(month, members)| {
            let countries = members
                .iter()
                .map(|i| i.country.trim())
                .filter(|c| !c.is_empty() && *c != "-")
                .collect::<Vec<_>>();
            let skills = members
                .iter()
                .flat_map(|i| split_terms(&i.skills))
                .map(|t| lookup_category(skill_map, &t))
                .collect::<Vec<_>>();
            let interests = members
                .iter()
                .flat_map(|i| split_terms(&i.interests))
                .map(|t| lookup_category(interest_map, &t))
                .collect::<Vec<_>>();
            MonthBreakdown {
                month,
                total_intros: members.len(),
                countries: ranked_counts(countries),
                skill_categories: ranked_counts(skills.iter().map(String::as_str)),
                interest_categories: ranked_counts(interests.iter().map(String::as_str)),
            }
        })
        .collect::<Vec<_>>();
    months.sort_by(|a, b| month_order(&a.month, &b.month));
    months
}

struct MessageBatch<'a> {
    caller: &'a ModelCaller,
    messages: &'a [ChatMessage],
    batch_size: usize,
    content_limit: usize,
}

#[async_trait]
impl<'a> BatchProcessor for MessageBatch<'a> {
    type Accumulator = Vec<IntroRecord>;

    async fn process_batch(
        &self,
        start: usize,
        mut acc: Self::Accumulator,
    ) -> anyhow::Result<Self::Accumulator> {
        let end = (start + self.batch_size).min(self.messages.len());
        let lines = (start..end)
            .map(|i| message_prompt_line(i, &self.messages[i], self.content_limit))
            .collect::<Vec<_>>();
        let user = format!("Classify these messages:\n\n{}", lines.join("\n\n"));

        let replies = self
            .caller
            .ask(ReplyKind::MessageClassifications, RECEPTION_CLASSIFY_PROMPT, user)
            .await?
            .into_message_classifications()
            .ok_or_else(|| anyhow!("expected message classifications"))?;

        // Indices outside this batch are ignored.
        for (index, class) in replies.range(start..end) {
            if class.kind != MessageKind::Intro {
                continue;
            }
            let message = &self.messages[*index];
            acc.push(IntroRecord {
                author: non_blank(&message.author),
                author_id: non_blank(&message.author_id),
                country: class.country.clone(),
                skills: class.skills.clone(),
                interests: class.interests.clone(),
                when: class.when.clone(),
            });
        }
        Ok(acc)
    }

    fn describe(&self, acc: &Self::Accumulator) -> String {
        format!("intros {}", acc.len())
    }
}

fn non_blank(value: &str) -> String {
    if value.trim().is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

pub struct ReceptionPipeline {
    caller: ModelCaller,
    terms: TermCategorizer,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: PipelineSettings,
}

impl ReceptionPipeline {
    pub fn new(
        model: Arc<dyn ClassificationModel>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            caller: ModelCaller::new(model.clone(), &settings),
            terms: TermCategorizer::new(model, checkpoints.clone(), settings.clone()),
            checkpoints,
            settings,
        }
    }

    /// `run_key` prefixes the progress key of each phase so an interrupted
    /// run over the same export resumes.
    pub async fn run(&self, messages: &[ChatMessage], run_key: &str) -> anyhow::Result<MemberStats> {
        let intros = self.classify_messages(messages, run_key).await?;
        info!(intros = intros.len(), messages = messages.len(), "messages classified");

        let skill_terms = distinct_terms(intros.iter().map(|i| i.skills.as_str()));
        let interest_terms = distinct_terms(intros.iter().map(|i| i.interests.as_str()));

        let skill_map = self
            .terms
            .categorize(&skill_terms, TermType::Skills, &format!("{run_key}-skills"))
            .await
            .context("categorizing skills")?;
        let interest_map = self
            .terms
            .categorize(&interest_terms, TermType::Interests, &format!("{run_key}-interests"))
            .await
            .context("categorizing interests")?;
        info!(
            skills = skill_map.len(),
            interests = interest_map.len(),
            "terms categorized"
        );

        let skill_labels = intros
            .iter()
            .flat_map(|i| split_terms(&i.skills))
            .map(|t| lookup_category(&skill_map, &t))
            .collect::<Vec<_>>();
        let interest_labels = intros
            .iter()
            .flat_map(|i| split_terms(&i.interests))
            .map(|t| lookup_category(&interest_map, &t))
            .collect::<Vec<_>>();
        let months = month_breakdown(&intros, &skill_map, &interest_map);

        let (first_date, last_date) = date_range(messages);
        Ok(MemberStats {
            generated_at: Utc::now(),
            total_messages: messages.len(),
            total_intros: intros.len(),
            first_date,
            last_date,
            skill_categories: ranked_counts(skill_labels.iter().map(String::as_str)),
            interest_categories: ranked_counts(interest_labels.iter().map(String::as_str)),
            months,
            skill_category_mapping: skill_map,
            interest_category_mapping: interest_map,
        })
    }

    async fn classify_messages(&self, messages: &[ChatMessage], run_key: &str) -> anyhow::Result<Vec<IntroRecord>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let processor = MessageBatch {
            caller: &self.caller,
            messages,
            batch_size: self.settings.message_batch_size,
            content_limit: self.settings.content_slice_limit,
        };
        let runner = BatchRunner::new(
            self.checkpoints.clone(),
            runner_config(
                &self.settings,
                "classify messages",
                &format!("{run_key}-classify"),
                processor.batch_size,
                messages.len(),
            ),
        );
        Ok(runner.run(&processor, Vec::new()).await?)
    }
}

fn distinct_terms<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    raw.flat_map(split_terms)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::testing::ScriptedModel;
    use evsync_storage::MemoryCheckpointStore;

    fn message(author: &str, date: &str, content: &str) -> ChatMessage {
        ChatMessage {
            author_id: format!("id-{author}"),
            author: author.into(),
            date: date.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    #[test]
    fn split_terms_normalizes_and_skips_dash() {
        assert_eq!(split_terms(" Rust, Design ,,go "), vec!["rust", "design", "go"]);
        assert!(split_terms("-").is_empty());
        assert!(split_terms("").is_empty());
    }

    #[test]
    fn prompt_line_carries_index_date_and_clipped_content() {
        let line = message_prompt_line(4, &message("bo", "2024-09-01T08:00:00Z", "hello there"), 5);
        assert_eq!(line, "[4] (posted 2024-09-01): hello");
        let undated = message_prompt_line(0, &message("bo", "", "hey"), 500);
        assert_eq!(undated, "[0] (posted unknown): hey");
    }

    fn intro(country: &str, when: &str, skills: &str) -> IntroRecord {
        IntroRecord {
            author: "m".into(),
            author_id: "id-m".into(),
            country: country.into(),
            skills: skills.into(),
            interests: "-".into(),
            when: when.into(),
        }
    }

    #[test]
    fn months_group_by_arrival_with_country_counts() {
        let skill_map = BTreeMap::from([("rust".to_string(), "Software Engineering".to_string())]);
        let intros = vec![
            intro("PT", "Oct 2024", "rust"),
            intro("-", "-", "-"),
            intro("DE", "Sep 2024", "-"),
            intro("PT", "Oct 2024", "cooking"),
            intro("US", "Oct 2024", "-"),
            intro("FR", "someday", "-"),
            intro("NL", "", "-"),
        ];

        let months = month_breakdown(&intros, &skill_map, &BTreeMap::new());

        let order = months.iter().map(|m| m.month.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["Sep 2024", "Oct 2024", "someday", "-"]);

        let oct = &months[1];
        assert_eq!(oct.total_intros, 3);
        assert_eq!(oct.countries, vec![("PT".to_string(), 2), ("US".to_string(), 1)]);
        assert_eq!(
            oct.skill_categories,
            vec![("Software Engineering".to_string(), 1), ("Unknown".to_string(), 1)]
        );

        // `-` and blank arrival months share one bucket; `-` countries are not counted.
        let undated = &months[3];
        assert_eq!(undated.total_intros, 2);
        assert_eq!(undated.countries, vec![("NL".to_string(), 1)]);
    }

    #[tokio::test]
    async fn end_to_end_counts_skill_and_interest_categories() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"0": {"type": "intro", "country": "PT", "skills": "Rust, design", "interests": "surfing", "when": "-"},
                "1": {"type": "skip"},
                "2": {"type": "intro", "country": "-", "skills": "rust", "interests": "-", "when": "Oct 2024"}}"#,
            r#"{"design": "Design & Creative", "rust": "Software Engineering"}"#,
            r#"{"surfing": "Water Sports"}"#,
        ]));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let pipeline = ReceptionPipeline::new(model.clone(), checkpoints.clone(), PipelineSettings::immediate());
        let messages = vec![
            message("ana", "2024-09-02T10:00:00Z", "Hi! I'm Ana from Lisbon, I write Rust and do design."),
            message("bo", "2024-09-01T10:00:00Z", "gm"),
            message("cy", "2024-09-05T10:00:00Z", "Cy here, rust dev, arriving October."),
        ];

        let stats = pipeline.run(&messages, "reception-test").await.unwrap();

        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.total_intros, 2);
        assert_eq!(stats.first_date, "2024-09-01");
        assert_eq!(stats.last_date, "2024-09-05");
        assert_eq!(
            stats.skill_categories,
            vec![
                ("Software Engineering".to_string(), 2),
                ("Design & Creative".to_string(), 1),
            ]
        );
        assert_eq!(stats.interest_categories, vec![("Unknown".to_string(), 1)]);
        assert_eq!(model.request_count(), 3);
        assert!(checkpoints.keys().await.is_empty());

        let months = stats.months.iter().map(|m| m.month.as_str()).collect::<Vec<_>>();
        assert_eq!(months, vec!["Oct 2024", "-"]);
        assert_eq!(stats.months[1].countries, vec![("PT".to_string(), 1)]);
        assert_eq!(stats.skill_category_mapping["rust"], "Software Engineering");

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["skillCategories"]["Software Engineering"], 2);
        assert_eq!(json["totalIntros"], 2);
        assert_eq!(json["months"][1]["countries"]["PT"], 1);
        assert_eq!(json["interestCategoryMapping"]["surfing"], "Unknown");
    }

    #[tokio::test]
    async fn classification_failure_leaves_resumable_checkpoint() {
        let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
        model.push_failure(500);
        model.push_failure(500);
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let pipeline = ReceptionPipeline::new(model, checkpoints.clone(), PipelineSettings::immediate());

        let err = pipeline
            .run(&[message("ana", "2024-09-02T10:00:00Z", "hi")], "reception-fail")
            .await
            .expect_err("model down");

        assert!(format!("{err:#}").contains("re-run to resume"));
        assert_eq!(checkpoints.keys().await, vec!["reception-fail-classify".to_string()]);
    }
}
