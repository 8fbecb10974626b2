//! Shared plumbing for the chat-export pipelines.

use std::path::Path;

use anyhow::Context;
use evsync_core::ChatMessage;
use serde::{Serialize, Serializer};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub async fn load_chat_export(path: &Path) -> anyhow::Result<Vec<ChatMessage>> {
    let raw = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let messages: Vec<ChatMessage> =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), messages = messages.len(), "loaded chat export");
    Ok(messages)
}

/// Pretty JSON written through a temp file and renamed into place.
pub async fn write_json_report<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value).context("serializing report")?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all().await?;
    }
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("moving report into {}", path.display()))?;
    info!(path = %path.display(), bytes = body.len(), "report written");
    Ok(())
}

/// Earliest and latest `YYYY-MM-DD` among the messages; empty strings when none carry a date.
pub fn date_range(messages: &[ChatMessage]) -> (String, String) {
    let mut days = messages.iter().filter_map(ChatMessage::day).collect::<Vec<_>>();
    days.sort_unstable();
    (
        days.first().map(|d| d.to_string()).unwrap_or_default(),
        days.last().map(|d| d.to_string()).unwrap_or_default(),
    )
}

/// Sum of every `(n)` count in a reactions column, e.g. `"🔥 (3), 👍 (2)"` is 5.
pub fn reaction_score(reactions: &str) -> u64 {
    reactions
        .split('(')
        .skip(1)
        .filter_map(|part| {
            let (digits, _) = part.split_once(')')?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            digits.parse::<u64>().ok()
        })
        .fold(0u64, u64::saturating_add)
}

/// Label counts sorted by count descending, then label.
pub fn ranked_counts<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<(String, u64)> {
    let mut counts = std::collections::HashMap::<&str, u64>::new();
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    let mut ranked = counts
        .into_iter()
        .map(|(label, n)| (label.to_string(), n))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Serialize ranked `(label, count)` pairs as a JSON object in rank order.
pub(crate) fn as_ordered_map<S: Serializer>(pairs: &[(String, u64)], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(pairs.iter().map(|(k, v)| (k, v)))
}
