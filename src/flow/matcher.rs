use log::warn;
use regex::RegexBuilder;

use crate::shared::models::{MatchKind, Trigger};

/// Priority-based trigger matching: EQUALS → STARTS_WITH → CONTAINS → REGEX.
/// Comparison is case-insensitive on trimmed content. Invalid regex
/// patterns never match.
pub fn find_match<'a>(content: &str, triggers: &'a [Trigger]) -> Option<&'a Trigger> {
    let normalized = content.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }

    for kind in [
        MatchKind::Equals,
        MatchKind::StartsWith,
        MatchKind::Contains,
        MatchKind::Regex,
    ] {
        for trigger in triggers {
            if MatchKind::parse(&trigger.match_type) != Some(kind) {
                continue;
            }
            let keyword = trigger.keyword.to_lowercase();
            let matched = match kind {
                MatchKind::Equals => normalized == keyword,
                MatchKind::StartsWith => normalized.starts_with(&keyword),
                MatchKind::Contains => normalized.contains(&keyword),
                MatchKind::Regex => match RegexBuilder::new(&trigger.keyword)
                    .case_insensitive(true)
                    .build()
                {
                    Ok(pattern) => pattern.is_match(content.trim()),
                    Err(e) => {
                        warn!("Invalid trigger regex {:?}: {}", trigger.keyword, e);
                        false
                    }
                },
            };
            if matched {
                return Some(trigger);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_trigger(keyword: &str, match_type: &str) -> Trigger {
        let now = Utc::now();
        Trigger {
            id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            keyword: keyword.to_string(),
            match_type: match_type.to_string(),
            scope: "INCOMING".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn equals_match_case_insensitive() {
        let triggers = vec![make_trigger("hola", "EQUALS")];
        assert!(find_match("HOLA", &triggers).is_some());
    }

    #[test]
    fn equals_match_with_whitespace() {
        let triggers = vec![make_trigger("hola", "EQUALS")];
        assert!(find_match("  hola  ", &triggers).is_some());
    }

    #[test]
    fn equals_no_partial_match() {
        let triggers = vec![make_trigger("hola", "EQUALS")];
        assert!(find_match("hola mundo", &triggers).is_none());
    }

    #[test]
    fn starts_with_match() {
        let triggers = vec![make_trigger("promo", "STARTS_WITH")];
        assert!(find_match("PROMO de verano", &triggers).is_some());
        assert!(find_match("quiero la promo", &triggers).is_none());
    }

    #[test]
    fn contains_match() {
        let triggers = vec![make_trigger("promo", "CONTAINS")];
        assert!(find_match("quiero el codigo promo ya", &triggers).is_some());
    }

    #[test]
    fn regex_match_is_case_insensitive() {
        let triggers = vec![make_trigger(r"^folio\s+\d+$", "REGEX")];
        assert!(find_match("Folio 1234", &triggers).is_some());
        assert!(find_match("folio abc", &triggers).is_none());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let triggers = vec![make_trigger(r"promo(", "REGEX")];
        assert!(find_match("promo(", &triggers).is_none());
    }

    #[test]
    fn equals_has_priority_over_contains() {
        let contains = make_trigger("hola", "CONTAINS");
        let equals = make_trigger("hola", "EQUALS");
        let equals_id = equals.id;
        let triggers = vec![contains, equals];
        assert_eq!(find_match("hola", &triggers).unwrap().id, equals_id);
    }

    #[test]
    fn starts_with_beats_contains() {
        let contains = make_trigger("hola", "CONTAINS");
        let starts = make_trigger("hola", "STARTS_WITH");
        let starts_id = starts.id;
        let triggers = vec![contains, starts];
        assert_eq!(find_match("hola mundo", &triggers).unwrap().id, starts_id);
    }

    #[test]
    fn empty_content_returns_none() {
        let triggers = vec![make_trigger("hola", "EQUALS")];
        assert!(find_match("", &triggers).is_none());
        assert!(find_match("   ", &triggers).is_none());
    }

    #[test]
    fn no_triggers_returns_none() {
        assert!(find_match("hola", &[]).is_none());
    }
}
