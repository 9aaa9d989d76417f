use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_EXPLANATION: &str = "No explanation provided.";

/// Score and explanation read from free text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScore {
    pub score: u8,
    pub explanation: String,
    /// No usable score was found
    pub fallback: bool,
}

impl ParsedScore {
    pub fn fallback() -> Self {
        Self {
            score: 0,
            explanation: DEFAULT_EXPLANATION.to_string(),
            fallback: true,
        }
    }
}

fn score_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b(\d{1,3})\b(\s*(?:/\s*100|out of 100))?").ok())
        .as_ref()
}

fn label_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(?:safety\s+|risk\s+)?score\s*(?:is)?\s*[:=]?\s*$").ok())
        .as_ref()
}

/// Takes the first standalone integer within 0..=100 as the score.
///
/// Everything else, minus a leading "Score:" label and separators, is the
/// explanation.
pub fn parse_score(text: &str) -> ParsedScore {
    let Some(pattern) = score_pattern() else {
        return ParsedScore::fallback();
    };
    let found = pattern.captures_iter(text).find_map(|caps| {
        let whole = caps.get(0)?;
        let score = caps.get(1)?.as_str().parse::<u16>().ok()?;
        (score <= 100).then_some((score as u8, whole.start(), whole.end()))
    });

    let Some((score, start, end)) = found else {
        return ParsedScore::fallback();
    };

    let before = match label_pattern() {
        Some(label) => label.replace(&text[..start], "").trim().to_string(),
        None => text[..start].trim().to_string(),
    };
    let after = text[end..].trim_start_matches(|c: char| c.is_whitespace() || ".,:;-|)".contains(c));

    let explanation = match (before.is_empty(), after.trim().is_empty()) {
        (true, true) => DEFAULT_EXPLANATION.to_string(),
        (true, false) => after.trim().to_string(),
        (false, true) => before,
        (false, false) => format!("{} {}", before, after.trim()),
    };

    ParsedScore {
        score,
        explanation,
        fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_then_explanation() {
        let parsed = parse_score("85\nThe site uses HTTPS and nothing was flagged.");
        assert_eq!(parsed.score, 85);
        assert_eq!(parsed.explanation, "The site uses HTTPS and nothing was flagged.");
        assert!(!parsed.fallback);
    }

    #[test]
    fn test_labelled_score_out_of_100() {
        let parsed = parse_score("Score: 42/100. Unusual CPU spikes during load.");
        assert_eq!(parsed.score, 42);
        assert_eq!(parsed.explanation, "Unusual CPU spikes during load.");
    }

    #[test]
    fn test_no_integer_falls_back() {
        assert_eq!(parse_score("not sure"), ParsedScore::fallback());
        assert_eq!(parse_score("not sure").explanation, "No explanation provided.");
        assert_eq!(parse_score("").score, 0);
    }

    #[test]
    fn test_out_of_range_numbers_are_skipped() {
        let parsed = parse_score("999 is out of range, final answer 64");
        assert_eq!(parsed.score, 64);

        assert_eq!(parse_score("In 2024 this domain scored 77").score, 77);
        assert!(parse_score("rated 250").fallback);
    }

    #[test]
    fn test_bare_score() {
        let parsed = parse_score("  100 ");
        assert_eq!(parsed.score, 100);
        assert_eq!(parsed.explanation, DEFAULT_EXPLANATION);
    }
}
