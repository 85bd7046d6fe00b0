//! What the warmer warms.

use std::fs;
use std::path::Path;

use crate::Result;
use crate::services::{Intent, IntentKind};

/// Log lines scanned from the end of a query log.
const LOG_TAIL_LINES: usize = 1000;
/// Query patterns kept from a log.
const MAX_LOGGED_QUERIES: usize = 20;
/// Logged queries at or below this many characters are ignored.
const MIN_LOGGED_QUERY_CHARS: usize = 10;

/// Frequently asked queries and structured intents to keep warm.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmingCorpus {
    pub queries: Vec<String>,
    pub intents: Vec<Intent>,
}

impl Default for WarmingCorpus {
    fn default() -> Self {
        let queries = [
            "What are the main causes of wildfires?",
            "How does climate change affect oil production?",
            "What are DOI environmental regulations?",
            "Tell me about renewable energy on federal lands",
            "What is the Bureau of Land Management?",
            "How many websites mention climate change?",
            "What are the statistics about the database?",
            "Show me websites about oil drilling",
            "Find pages about environmental protection",
        ];
        Self {
            queries: queries.into_iter().map(String::from).collect(),
            intents: vec![
                Intent::new(IntentKind::WebsiteStats),
                Intent::with_term(IntentKind::CountWebsites, "oil"),
                Intent::with_term(IntentKind::CountWebsites, "climate"),
                Intent::with_term(IntentKind::CountWebsites, "energy"),
                Intent::with_term(IntentKind::SearchContent, "usgs.gov"),
                Intent::with_term(IntentKind::SearchContent, "doi.gov"),
            ],
        }
    }
}

impl WarmingCorpus {
    pub fn empty() -> Self {
        Self {
            queries: Vec::new(),
            intents: Vec::new(),
        }
    }

    /// Append queries not already in the corpus. Returns how many were added.
    pub fn extend_queries<I, S>(&mut self, queries: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.queries.len();
        for query in queries {
            let query = query.into();
            if !self.queries.contains(&query) {
                self.queries.push(query);
            }
        }
        self.queries.len() - before
    }

    /// Queries worth a knowledge-base warm: the first five, minus the ones
    /// phrased as structured questions.
    pub(crate) fn knowledge_queries(&self) -> impl Iterator<Item = &str> {
        self.queries
            .iter()
            .take(5)
            .map(String::as_str)
            .filter(|q| !q.starts_with("How many") && !q.starts_with("Show me"))
    }
}

/// Recent distinct queries recorded in a log file.
///
/// Scans the last thousand lines for `query:` (any case) and takes the
/// rest of the line. Texts of ten characters or fewer are skipped; at most
/// twenty are returned, first occurrence first.
pub fn load_query_patterns(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(query_patterns(&contents))
}

fn query_patterns(log: &str) -> Vec<String> {
    let lines: Vec<&str> = log.lines().collect();
    let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];

    let mut queries: Vec<String> = Vec::new();
    for line in tail {
        // ASCII lowering keeps byte offsets valid for slicing `line`.
        let Some(at) = line.to_ascii_lowercase().find("query:") else {
            continue;
        };
        let query = line[at + "query:".len()..].trim();
        if query.chars().count() > MIN_LOGGED_QUERY_CHARS && !queries.iter().any(|q| q == query) {
            queries.push(query.to_string());
            if queries.len() == MAX_LOGGED_QUERIES {
                break;
            }
        }
    }
    queries
}
