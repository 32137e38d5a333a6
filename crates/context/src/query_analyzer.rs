//! Query Analyzer - Lightweight heuristics over the raw query text
//!
//! Provides:
//! - Keyword extraction for external lookups
//! - External source selection (trigger words and reference detection)
//! - Sentiment scoring used to bias answer style
//! - User fact extraction from first-person statements

use hal_common::errors::{AppError, Result};
use hal_common::UserFact;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// External knowledge sources a query can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSource {
    Arxiv,
    Mdn,
    Github,
}

impl ExternalSource {
    pub const ALL: [ExternalSource; 3] = [
        ExternalSource::Arxiv,
        ExternalSource::Mdn,
        ExternalSource::Github,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSource::Arxiv => "arxiv",
            ExternalSource::Mdn => "mdn",
            ExternalSource::Github => "github",
        }
    }

    fn triggers(&self) -> &'static [&'static str] {
        match self {
            ExternalSource::Arxiv => &["latest", "paper", "papers", "research", "study"],
            ExternalSource::Mdn => &["doc", "docs", "syntax", "explain", "api"],
            ExternalSource::Github => &["code", "example", "build", "repo", "library"],
        }
    }
}

impl fmt::Display for ExternalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One external lookup chosen for a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub source: ExternalSource,

    /// Detected reference (arXiv id, `owner/repo`) or the keyword string
    pub term: String,
}

/// Coarse tone of the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }
}

/// Everything derived from a query before context assembly
#[derive(Debug, Clone, Default)]
pub struct QueryAnalysis {
    pub keywords: Vec<String>,
    pub lookups: Vec<Lookup>,
    pub sentiment: Sentiment,
}

/// Keywords carried into a lookup term
const MAX_TERM_KEYWORDS: usize = 8;

/// Upper bound on a stored fact value
const MAX_FACT_LEN: usize = 64;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "in", "on", "at", "to", "for",
    "of", "with", "by", "from", "and", "or", "but", "not", "this", "that", "these", "those",
    "it", "its", "as", "do", "does", "did", "has", "have", "had", "can", "could", "will",
    "would", "should", "may", "might", "what", "which", "who", "how", "why", "when", "where",
    "i", "me", "my", "you", "your", "we", "our", "about", "some", "any", "there", "please",
];

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "awesome", "love", "cool", "nice", "curious", "interesting",
    "excited", "amazing", "fascinating", "helpful", "wonderful", "glad",
];

const NEGATIVE_WORDS: &[&str] = &[
    "broken", "hate", "annoying", "frustrated", "frustrating", "stupid", "useless", "wrong",
    "fails", "failing", "stuck", "ugh", "terrible", "confusing", "confused", "awful", "again",
    "doesnt", "won't", "wont", "cant",
];

/// Slash-separated words that are not repository references
const NOT_REPOS: &[&str] = &[
    "and/or",
    "tcp/ip",
    "i/o",
    "input/output",
    "client/server",
    "read/write",
    "on/off",
];

/// Query analyzer holding the compiled detectors
pub struct QueryAnalyzer {
    arxiv_id: Regex,
    github_url: Regex,
    bare_repo: Regex,
    fact_patterns: Vec<(FactKey, Regex)>,
}

/// How a fact pattern names its key
#[derive(Debug, Clone, Copy)]
enum FactKey {
    Fixed(&'static str),
    /// Key taken from `I work on|at|as`
    Work,
    /// Key derived from `my favorite <thing>`
    Favorite,
}

impl QueryAnalyzer {
    pub fn new() -> Result<Self> {
        // Value captures stop at punctuation or a joining word
        const VALUE: &str = concat!(
            r"([a-z0-9][a-z0-9 +#./'-]*?)",
            r"(?:\s+(?:and|but|so|because|who|which)\b|[,;!?]|\.(?:\s|$)|$)",
        );

        let with_value = |prefix: &str| compile(&format!("{}{}", prefix, VALUE));
        let fact_patterns = vec![
            (FactKey::Fixed("name"), compile(r"(?i)\bmy name is ([a-z][a-z'-]*)")?),
            (FactKey::Fixed("name"), compile(r"(?i)\bcall me ([a-z][a-z'-]*)")?),
            (FactKey::Favorite, with_value(r"(?i)\bmy favou?rite ([a-z ]+?) is ")?),
            (FactKey::Work, with_value(r"(?i)\bi work (on|at|as an?|as) ")?),
            (FactKey::Fixed("role"), with_value(r"(?i)\bi(?: am|'m) an? ")?),
            (
                FactKey::Fixed("likes"),
                with_value(r"(?i)\bi (?:really )?(?:like|love|prefer|enjoy) ")?,
            ),
            (FactKey::Fixed("uses"), with_value(r"(?i)\bi(?: mostly| mainly)? use ")?),
        ];

        Ok(Self {
            arxiv_id: compile(r"(?i)(?:\barxiv:\s*)?\b(\d{4}\.\d{4,5})(?:v\d+)?\b")?,
            github_url: compile(r"(?i)github\.com/([a-z0-9][a-z0-9_.-]*)/([a-z0-9_.-]+)")?,
            bare_repo: compile(r"^([A-Za-z0-9][A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]{2,})$")?,
            fact_patterns,
        })
    }

    /// Analyze a query
    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        let keywords = keywords(query);
        let lookups = self.select_sources(query, &keywords);
        let sentiment = sentiment(query);

        QueryAnalysis {
            keywords,
            lookups,
            sentiment,
        }
    }

    /// Choose external lookups; no trigger and no reference means none
    pub fn select_sources(&self, query: &str, keywords: &[String]) -> Vec<Lookup> {
        let keyword_term = keywords
            .iter()
            .take(MAX_TERM_KEYWORDS)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");

        let references = |source: ExternalSource| -> Option<String> {
            match source {
                ExternalSource::Arxiv => self.arxiv_reference(query),
                ExternalSource::Github => self.github_reference(query),
                ExternalSource::Mdn => None,
            }
        };

        ExternalSource::ALL
            .iter()
            .filter_map(|&source| {
                if let Some(reference) = references(source) {
                    return Some(Lookup { source, term: reference });
                }
                let triggered = keywords
                    .iter()
                    .any(|k| source.triggers().contains(&k.as_str()));
                (triggered && !keyword_term.is_empty()).then(|| Lookup {
                    source,
                    term: keyword_term.clone(),
                })
            })
            .collect()
    }

    fn arxiv_reference(&self, query: &str) -> Option<String> {
        self.arxiv_id
            .captures(query)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn github_reference(&self, query: &str) -> Option<String> {
        if let Some(caps) = self.github_url.captures(query) {
            let owner = caps.get(1)?.as_str();
            let repo = caps.get(2)?.as_str().trim_end_matches(".git").trim_end_matches('.');
            return Some(format!("{}/{}", owner, repo));
        }

        query
            .split_whitespace()
            .map(|token| {
                token.trim_matches(|c: char| {
                    matches!(c, ',' | ';' | '?' | '!' | '(' | ')' | '"' | '\'' | '`')
                })
            })
            .map(|token| token.trim_end_matches('.'))
            .filter(|token| {
                !token.contains("://") && !NOT_REPOS.contains(&token.to_lowercase().as_str())
            })
            .find_map(|token| {
                let caps = self.bare_repo.captures(token)?;
                Some(format!("{}/{}", caps.get(1)?.as_str(), caps.get(2)?.as_str()))
            })
    }

    /// Extract key/value facts from first-person statements
    pub fn extract_user_facts(&self, query: &str) -> Vec<UserFact> {
        let mut facts: Vec<UserFact> = Vec::new();

        for (key, pattern) in &self.fact_patterns {
            for caps in pattern.captures_iter(query) {
                let fact = match key {
                    FactKey::Fixed(name) => caps.get(1).map(|v| (name.to_string(), v.as_str())),
                    FactKey::Work => match (caps.get(1), caps.get(2)) {
                        (Some(kind), Some(v)) => {
                            let kind = kind.as_str().to_lowercase();
                            let key = if kind.starts_with("as") {
                                "role"
                            } else if kind == "at" {
                                "works_at"
                            } else {
                                "works_on"
                            };
                            Some((key.to_string(), v.as_str()))
                        }
                        _ => None,
                    },
                    FactKey::Favorite => match (caps.get(1), caps.get(2)) {
                        (Some(thing), Some(v)) => {
                            let thing = thing.as_str().trim().to_lowercase().replace(' ', "_");
                            Some((format!("favorite_{}", thing), v.as_str()))
                        }
                        _ => None,
                    },
                };

                if let Some((key, value)) = fact {
                    let value = clean_value(value);
                    if value.is_empty() {
                        continue;
                    }
                    facts.retain(|f| f.key != key);
                    facts.push(UserFact::new(key, value));
                }
            }
        }

        facts
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| AppError::Configuration {
        message: format!("invalid analyzer pattern: {}", e),
    })
}

fn clean_value(value: &str) -> String {
    let value = value.trim().trim_end_matches(['.', '\'']).trim();
    value.chars().take(MAX_FACT_LEN).collect()
}

/// Lower-cased keywords without stop words, in first-seen order
pub fn keywords(query: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();

    for raw in query.split_whitespace() {
        let token = raw
            .trim_matches(|c: char| !c.is_alphanumeric() && !matches!(c, '#' | '+'))
            .to_lowercase();
        if token.is_empty() || STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        if !token.chars().any(char::is_alphanumeric) {
            continue;
        }
        if !seen.contains(&token) {
            seen.push(token);
        }
    }

    seen
}

/// Lexicon-based tone of the query
pub fn sentiment(query: &str) -> Sentiment {
    let mut score: i32 = 0;
    for raw in query.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .collect::<String>()
            .to_lowercase();
        let bare = word.replace('\'', "");
        if POSITIVE_WORDS.contains(&word.as_str()) || POSITIVE_WORDS.contains(&bare.as_str()) {
            score += 1;
        }
        if NEGATIVE_WORDS.contains(&word.as_str()) || NEGATIVE_WORDS.contains(&bare.as_str()) {
            score -= 1;
        }
    }

    match score {
        s if s > 0 => Sentiment::Positive,
        s if s < 0 => Sentiment::Negative,
        _ => Sentiment::Neutral,
    }
}
