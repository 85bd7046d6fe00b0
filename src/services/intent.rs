//! Structured-query intents and the pattern-based classifier.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The kind of structured query a free-text question maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CountWebsites,
    SearchContent,
    FindLinks,
    ListWebsites,
    WebsiteStats,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::CountWebsites => "count_websites",
            IntentKind::SearchContent => "search_content",
            IntentKind::FindLinks => "find_links",
            IntentKind::ListWebsites => "list_websites",
            IntentKind::WebsiteStats => "website_stats",
        }
    }

    /// Whether intents of this kind carry a search term.
    pub fn takes_term(&self) -> bool {
        matches!(
            self,
            IntentKind::CountWebsites | IntentKind::SearchContent | IntentKind::FindLinks
        )
    }
}

/// A detected structured query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub kind: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
}

impl Intent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            search_term: None,
        }
    }

    pub fn with_term(kind: IntentKind, term: impl Into<String>) -> Self {
        Self {
            kind,
            search_term: Some(term.into()),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.search_term {
            Some(term) => write!(f, "{}({term})", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// Maps a free-text query to an [`Intent`], if it has one.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, query: &str) -> Option<Intent>;
}

const SUBJECT: &str = r"(?:the\s+(?:word|term|keyword|phrase)\s+)?['\x22]?([^'\x22?!.]+)";

/// Intent patterns in match order; link searches come before content
/// searches so that "pages that have links to x" is not read as a content
/// search for "links to x".
static PATTERNS: LazyLock<Vec<(IntentKind, Regex)>> = LazyLock::new(|| {
    let sources = [
        (
            IntentKind::CountWebsites,
            format!(
                r"(?i)(?:how\s+many|count|number\s+of)\s+(?:websites?|pages?|sites?)\s+(?:have|contain|include|about|mention|discuss)\s+{SUBJECT}"
            ),
        ),
        (
            IntentKind::FindLinks,
            r"(?i)(?:find|show|list|get)\s+(?:me\s+)?(?:websites?|pages?|sites?)\s+(?:that\s+)?(?:have|contain|include|with)\s+(?:links?\s+to|hrefs?\s+to|references?\s+to)\s+['\x22]?([^'\x22?!\s]+)"
                .to_string(),
        ),
        (
            IntentKind::SearchContent,
            format!(
                r"(?i)(?:find|search|show|list|get)\s+(?:me\s+)?(?:websites?|pages?|sites?|content)\s+(?:that\s+)?(?:contain|include|have|about|mention|discuss|with)\s+{SUBJECT}"
            ),
        ),
        (
            IntentKind::ListWebsites,
            r"(?i)(?:list|show|get)\s+(?:me\s+)?(?:all\s+)?(?:websites?|domains?|sites?)".to_string(),
        ),
        (
            IntentKind::WebsiteStats,
            r"(?i)(?:statistics|stats|info|information)\s+(?:about|on|for)\s+(?:the\s+)?(?:websites?|pages?|database)"
                .to_string(),
        ),
    ];

    sources
        .into_iter()
        .map(|(kind, source)| {
            let regex = Regex::new(&source).expect("Invalid intent regex");
            (kind, regex)
        })
        .collect()
});

/// Regex classifier covering the five [`IntentKind`]s.
///
/// Patterns are tried in a fixed order and the first match wins. They are
/// compiled once per process and shared by every classifier.
pub struct PatternClassifier {
    patterns: &'static [(IntentKind, Regex)],
}

impl PatternClassifier {
    pub fn new() -> Self {
        Self {
            patterns: PATTERNS.as_slice(),
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier for PatternClassifier {
    fn classify(&self, query: &str) -> Option<Intent> {
        for (kind, regex) in self.patterns {
            let Some(captures) = regex.captures(query) else {
                continue;
            };
            if !kind.takes_term() {
                return Some(Intent::new(*kind));
            }
            let term = captures
                .get(1)
                .map(|m| m.as_str().trim().to_lowercase())
                .filter(|term| !term.is_empty());
            if let Some(term) = term {
                return Some(Intent::with_term(*kind, term));
            }
        }
        None
    }
}
