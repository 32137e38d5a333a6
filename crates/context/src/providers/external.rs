//! External knowledge sources
//!
//! Provides:
//! - GitHub repository lookups (REST, JSON)
//! - arXiv paper lookups (Atom feed, XML)
//! - MDN documentation search (JSON)
//! - [`ExternalFetcher`], which runs the selected lookups concurrently

use super::{ContextItem, ExternalKnowledge};
use crate::query_analyzer::{ExternalSource, Lookup};
use async_trait::async_trait;
use futures::future::join_all;
use hal_common::config::ExternalConfig;
use hal_common::errors::{AppError, Result};
use hal_common::metrics;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest snippet taken from a single external result
const MAX_SNIPPET_CHARS: usize = 600;

const MDN_SITE: &str = "https://developer.mozilla.org";

/// A single networked knowledge source
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn source(&self) -> ExternalSource;

    /// Up to `limit` snippets for a lookup term
    async fn fetch(&self, term: &str, limit: usize) -> Result<Vec<ContextItem>>;
}

fn provider_error(source: ExternalSource, message: impl Into<String>) -> AppError {
    AppError::Provider {
        provider: source.as_str().to_string(),
        message: message.into(),
    }
}

async fn checked(source: ExternalSource, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(provider_error(source, format!("HTTP {}", response.status())))
}

/// Collapse whitespace and cap length
fn snippet(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= MAX_SNIPPET_CHARS {
        return normalized;
    }
    let mut cut: String = normalized.chars().take(MAX_SNIPPET_CHARS).collect();
    cut.push('…');
    cut
}

/// Earlier results rank higher
fn rank_score(rank: usize) -> f32 {
    1.0 / (rank as f32 + 1.0)
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

pub struct GithubSource {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct GithubSearch {
    items: Vec<GithubRepo>,
}

#[derive(Deserialize)]
struct GithubRepo {
    full_name: String,
    html_url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
}

impl GithubRepo {
    fn into_item(self, rank: usize) -> ContextItem {
        let language = self.language.as_deref().unwrap_or("unknown language");
        let description = self.description.as_deref().unwrap_or("no description");
        ContextItem::external(
            snippet(&format!(
                "GitHub {} ({}, {} stars): {}",
                self.full_name, language, self.stargazers_count, description
            )),
            rank_score(rank),
            self.html_url,
        )
    }
}

impl GithubSource {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for GithubSource {
    fn source(&self) -> ExternalSource {
        ExternalSource::Github
    }

    async fn fetch(&self, term: &str, limit: usize) -> Result<Vec<ContextItem>> {
        let is_repo_ref = term.contains('/') && !term.contains(char::is_whitespace);

        if is_repo_ref {
            let response = self
                .client
                .get(format!("{}/repos/{}", self.api_base, term))
                .header("Accept", "application/vnd.github+json")
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let repo: GithubRepo = checked(self.source(), response).await?.json().await?;
            return Ok(vec![repo.into_item(0)]);
        }

        let per_page = limit.to_string();
        let response = self
            .client
            .get(format!("{}/search/repositories", self.api_base))
            .header("Accept", "application/vnd.github+json")
            .query(&[("q", term), ("per_page", per_page.as_str())])
            .send()
            .await?;
        let search: GithubSearch = checked(self.source(), response).await?.json().await?;

        Ok(search
            .items
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, repo)| repo.into_item(rank))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// arXiv
// ---------------------------------------------------------------------------

pub struct ArxivSource {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Deserialize)]
struct AtomEntry {
    id: String,
    title: String,
    #[serde(default)]
    summary: String,
}

impl ArxivSource {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn is_paper_id(term: &str) -> bool {
        let mut parts = term.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(year), Some(num), None) => {
                year.len() == 4
                    && (4..=5).contains(&num.len())
                    && year.chars().chain(num.chars()).all(|c| c.is_ascii_digit())
            }
            _ => false,
        }
    }

    fn parse_feed(xml: &str) -> Result<Vec<AtomEntry>> {
        let feed: AtomFeed = quick_xml::de::from_str(xml).map_err(|e| {
            provider_error(ExternalSource::Arxiv, format!("invalid Atom feed: {}", e))
        })?;
        Ok(feed.entries)
    }
}

#[async_trait]
impl KnowledgeSource for ArxivSource {
    fn source(&self) -> ExternalSource {
        ExternalSource::Arxiv
    }

    async fn fetch(&self, term: &str, limit: usize) -> Result<Vec<ContextItem>> {
        let limit_param = limit.to_string();
        let search_query = format!("all:{}", term);
        let query: Vec<(&str, &str)> = if Self::is_paper_id(term) {
            vec![("id_list", term), ("max_results", limit_param.as_str())]
        } else {
            vec![("search_query", search_query.as_str()), ("max_results", limit_param.as_str())]
        };

        let response = self
            .client
            .get(format!("{}/query", self.api_base))
            .query(&query)
            .send()
            .await?;
        let body = checked(self.source(), response).await?.text().await?;

        Ok(Self::parse_feed(&body)?
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, entry)| {
                let title = snippet(&entry.title);
                ContextItem::external(
                    snippet(&format!("arXiv paper \"{}\": {}", title, entry.summary)),
                    rank_score(rank),
                    entry.id.trim().to_string(),
                )
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MDN
// ---------------------------------------------------------------------------

pub struct MdnSource {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct MdnSearch {
    documents: Vec<MdnDocument>,
}

#[derive(Deserialize)]
struct MdnDocument {
    title: String,
    mdn_url: String,
    #[serde(default)]
    summary: String,
}

impl MdnSource {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for MdnSource {
    fn source(&self) -> ExternalSource {
        ExternalSource::Mdn
    }

    async fn fetch(&self, term: &str, limit: usize) -> Result<Vec<ContextItem>> {
        let size = limit.to_string();
        let response = self
            .client
            .get(format!("{}/search", self.api_base))
            .query(&[("q", term), ("size", size.as_str()), ("locale", "en-US")])
            .send()
            .await?;
        let search: MdnSearch = checked(self.source(), response).await?.json().await?;

        Ok(search
            .documents
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, doc)| {
                ContextItem::external(
                    snippet(&format!("MDN {}: {}", doc.title, doc.summary)),
                    rank_score(rank),
                    format!("{}{}", MDN_SITE, doc.mdn_url),
                )
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Runs the lookups chosen for a query against the registered sources
pub struct ExternalFetcher {
    sources: Vec<Arc<dyn KnowledgeSource>>,
    per_source_limit: usize,
}

impl ExternalFetcher {
    pub fn new(sources: Vec<Arc<dyn KnowledgeSource>>, per_source_limit: usize) -> Self {
        Self {
            sources,
            per_source_limit,
        }
    }

    /// Build the GitHub, arXiv and MDN sources; none when lookups are disabled
    pub fn from_config(config: &ExternalConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::new(Vec::new(), config.per_source_limit));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let sources: Vec<Arc<dyn KnowledgeSource>> = vec![
            Arc::new(ArxivSource::new(client.clone(), config.arxiv_api.clone())),
            Arc::new(MdnSource::new(client.clone(), config.mdn_api.clone())),
            Arc::new(GithubSource::new(client, config.github_api.clone())),
        ];
        Ok(Self::new(sources, config.per_source_limit))
    }

    fn source_for(&self, kind: ExternalSource) -> Option<&Arc<dyn KnowledgeSource>> {
        self.sources.iter().find(|s| s.source() == kind)
    }
}

#[async_trait]
impl ExternalKnowledge for ExternalFetcher {
    async fn fetch(&self, lookups: &[Lookup]) -> Result<Vec<ContextItem>> {
        let runnable: Vec<(&Lookup, &Arc<dyn KnowledgeSource>)> = lookups
            .iter()
            .filter_map(|lookup| self.source_for(lookup.source).map(|s| (lookup, s)))
            .collect();

        if runnable.is_empty() {
            return Ok(Vec::new());
        }

        let results = join_all(runnable.iter().map(|(lookup, source)| async move {
            let started = Instant::now();
            let result = source.fetch(&lookup.term, self.per_source_limit).await;
            let failure = result.as_ref().err().map(|_| "error");
            metrics::record_provider(
                &format!("external_{}", lookup.source),
                started.elapsed().as_secs_f64(),
                failure,
            );
            (lookup, result)
        }))
        .await;

        let attempted = results.len();
        let mut failed = Vec::new();
        let mut items = Vec::new();

        // join_all keeps lookup order, so items stay deterministic
        for (lookup, result) in results {
            match result {
                Ok(found) => {
                    debug!(
                        source = %lookup.source,
                        term = %lookup.term,
                        count = found.len(),
                        "External lookup complete"
                    );
                    items.extend(found);
                }
                Err(e) => {
                    warn!(
                        source = %lookup.source,
                        term = %lookup.term,
                        error = %e,
                        "External lookup failed"
                    );
                    failed.push(lookup.source.as_str());
                }
            }
        }

        if failed.len() == attempted {
            return Err(AppError::Provider {
                provider: "external".to_string(),
                message: format!("all lookups failed: {}", failed.join(", ")),
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="html">ArXiv Query</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/2106.09685v2</id>
    <title>LoRA: Low-Rank Adaptation of
      Large Language Models</title>
    <summary>  We propose Low-Rank Adaptation, or LoRA.  </summary>
    <author><name>Edward Hu</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_atom_feed() {
        let entries = ArxivSource::parse_feed(ATOM).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "http://arxiv.org/abs/2106.09685v2");
        assert_eq!(
            snippet(&entries[0].title),
            "LoRA: Low-Rank Adaptation of Large Language Models"
        );
    }

    #[test]
    fn test_paper_id_detection() {
        assert!(ArxivSource::is_paper_id("2106.09685"));
        assert!(ArxivSource::is_paper_id("1706.0376"));
        assert!(!ArxivSource::is_paper_id("attention is all you need"));
        assert!(!ArxivSource::is_paper_id("21.09685"));
    }

    #[tokio::test]
    async fn test_arxiv_lookup_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("id_list", "2106.09685"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ATOM))
            .mount(&server)
            .await;

        let source = ArxivSource::new(reqwest::Client::new(), format!("{}/api", server.uri()));
        let items = source.fetch("2106.09685", 3).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].content.starts_with("arXiv paper \"LoRA"));
        assert_eq!(items[0].origin, "http://arxiv.org/abs/2106.09685v2");
    }

    #[tokio::test]
    async fn test_github_search_and_repo() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/repositories"))
            .and(query_param("q", "async runtime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 2,
                "items": [
                    {
                        "full_name": "tokio-rs/tokio",
                        "html_url": "https://github.com/tokio-rs/tokio",
                        "description": "A runtime",
                        "language": "Rust",
                        "stargazers_count": 25000
                    },
                    {
                        "full_name": "smol-rs/smol",
                        "html_url": "https://github.com/smol-rs/smol",
                        "description": null,
                        "language": null,
                        "stargazers_count": 3000
                    }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/serde-rs/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "full_name": "serde-rs/json", "html_url": "https://github.com/serde-rs/json",
                "description": "Strongly typed JSON", "language": "Rust", "stargazers_count": 4000
            })))
            .mount(&server)
            .await;

        let source = GithubSource::new(reqwest::Client::new(), server.uri());
        let items = source.fetch("async runtime", 3).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].relevance_score > items[1].relevance_score);
        assert!(items[1].content.contains("no description"));

        let items = source.fetch("serde-rs/json", 3).await.unwrap();
        assert_eq!(items[0].origin, "https://github.com/serde-rs/json");
    }

    #[tokio::test]
    async fn test_mdn_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [
                    {
                        "title": "Array.prototype.map()",
                        "mdn_url": "/en-US/docs/Web/JavaScript/Reference/Global_Objects/Array/map",
                        "summary": "Creates a new array."
                    }
                ]
            })))
            .mount(&server)
            .await;

        let source = MdnSource::new(reqwest::Client::new(), format!("{}/api/v1", server.uri()));
        let items = source.fetch("array map", 3).await.unwrap();
        assert_eq!(items[0].content, "MDN Array.prototype.map(): Creates a new array.");
        assert!(items[0].origin.starts_with("https://developer.mozilla.org/en-US/docs"));
    }

    #[tokio::test]
    async fn test_fetcher_skips_failed_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gh/search/repositories"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mdn/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [
                    {
                        "title": "let",
                        "mdn_url": "/en-US/docs/let",
                        "summary": "Declares a variable."
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let fetcher = ExternalFetcher::new(
            vec![
                Arc::new(GithubSource::new(client.clone(), format!("{}/gh", server.uri()))),
                Arc::new(MdnSource::new(client, format!("{}/mdn", server.uri()))),
            ],
            3,
        );

        let lookups = vec![
            Lookup { source: ExternalSource::Mdn, term: "let syntax".into() },
            Lookup { source: ExternalSource::Github, term: "let syntax".into() },
        ];
        let items = fetcher.fetch(&lookups).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].origin, "https://developer.mozilla.org/en-US/docs/let");

        let err = fetcher.fetch(&lookups[1..]).await.unwrap_err();
        assert!(matches!(err, AppError::Provider { ref provider, .. } if provider == "external"));
    }

    #[tokio::test]
    async fn test_no_lookups_no_requests() {
        let fetcher = ExternalFetcher::new(Vec::new(), 3);
        let lookups = vec![Lookup { source: ExternalSource::Arxiv, term: "x".into() }];
        assert!(fetcher.fetch(&lookups).await.unwrap().is_empty());
        assert!(fetcher.fetch(&[]).await.unwrap().is_empty());
    }
}
