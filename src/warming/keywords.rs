//! Keyword extraction and related-query generation.

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "what", "how", "when", "where", "why", "who",
];

const MAX_KEYWORDS: usize = 5;
const MAX_RELATED: usize = 3;

/// Up to five content words from `query`, lowercased, in order.
///
/// Stopwords and words of two characters or fewer are dropped before
/// trailing punctuation (`.,!?;:`) is stripped.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|word| word.chars().count() > 2 && !STOPWORDS.contains(word))
        .map(|word| word.trim_matches(|c| ".,!?;:".contains(c)).to_string())
        .filter(|word| !word.is_empty())
        .take(MAX_KEYWORDS)
        .collect()
}

/// Structured-sounding queries about `keywords`, at most three.
pub fn related_queries(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .flat_map(|k| {
            [
                format!("How many websites mention {k}?"),
                format!("Show me websites about {k}"),
            ]
        })
        .take(MAX_RELATED)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_stopwords_and_short_words() {
        assert_eq!(
            extract_keywords("What is the impact of oil drilling on wildlife?"),
            vec!["impact", "oil", "drilling", "wildlife"]
        );
    }

    #[test]
    fn caps_at_five() {
        let keywords = extract_keywords("alpha beta gamma delta epsilon zeta eta");
        assert_eq!(keywords, vec!["alpha", "beta", "gamma", "delta", "epsilon"]);
    }

    #[test]
    fn strips_punctuation() {
        assert_eq!(extract_keywords("Wildfires! Drought; floods."), vec![
            "wildfires",
            "drought",
            "floods"
        ]);
    }

    #[test]
    fn related_queries_cap_at_three() {
        let related = related_queries(&["oil".to_string(), "gas".to_string()]);
        assert_eq!(related, vec![
            "How many websites mention oil?",
            "Show me websites about oil",
            "How many websites mention gas?",
        ]);
    }

    #[test]
    fn no_keywords_no_queries() {
        assert!(related_queries(&extract_keywords("what is it")).is_empty());
    }
}
