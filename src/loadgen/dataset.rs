//! Benchmark prompts from a ShareGPT-format dataset.
//!
//! The dataset is a JSON array of conversations; the first human turn of
//! each conversation becomes one prompt. The file is downloaded once and
//! reused on later runs.

use crate::config::DatasetConfig;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Debug, Deserialize)]
struct Conversation {
    #[serde(default)]
    conversations: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct Turn {
    from: String,
    value: String,
}

/// Download the dataset if it is not present locally, then load its prompts.
pub async fn load_prompts(config: &DatasetConfig, client: &reqwest::Client) -> Result<Vec<String>> {
    if !tokio::fs::try_exists(&config.path).await.unwrap_or(false) {
        download(&config.url, &config.path, client).await?;
    }

    let contents = tokio::fs::read_to_string(&config.path)
        .await
        .with_context(|| format!("Failed to read dataset: {}", config.path.display()))?;
    let prompts = parse_prompts(&contents, config.max_prompts)
        .with_context(|| format!("Failed to parse dataset: {}", config.path.display()))?;

    info!(path = %config.path.display(), prompts = prompts.len(), "Loaded benchmark prompts");
    Ok(prompts)
}

pub fn parse_prompts(json: &str, max_prompts: Option<usize>) -> Result<Vec<String>> {
    let conversations: Vec<Conversation> = serde_json::from_str(json)?;

    let prompts: Vec<String> = conversations
        .into_iter()
        .filter_map(|c| {
            c.conversations
                .into_iter()
                .find(|turn| turn.from == "human")
                .map(|turn| turn.value)
        })
        .filter(|prompt| !prompt.trim().is_empty())
        .take(max_prompts.unwrap_or(usize::MAX))
        .collect();

    if prompts.is_empty() {
        bail!("dataset contains no human prompts");
    }
    Ok(prompts)
}

/// Stream `url` into `dest`, via a temporary file so an interrupted download
/// never leaves a truncated dataset behind.
async fn download(url: &str, dest: &Path, client: &reqwest::Client) -> Result<()> {
    info!(url = %url, dest = %dest.display(), "Downloading dataset");

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to download dataset from {}", url))?;

    let partial = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("Failed to create {}", partial.display()))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed to download dataset from {}", url))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("Failed to move dataset into {}", dest.display()))?;

    info!(bytes = written, "Dataset downloaded");
    Ok(())
}
