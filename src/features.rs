//! Model-name feature decoding.
//!
//! A requested model name is a base model plus zero or more recognized
//! suffix markers, e.g. `gemini-2.5-pro-search-fake-stream`. The base name
//! is what goes to the backend; the markers toggle gateway behavior.
//! Unrecognized suffixes stay part of the base name.

/// Feature flags decoded from a model name.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFeatures {
    /// Model name with all recognized suffixes stripped.
    pub base_model: String,
    /// Serve `stream:true` via heartbeats + one unary call.
    pub fake_streaming: bool,
    /// Continue transparently across truncated streams.
    pub anti_truncation: bool,
    /// Attach the googleSearch tool.
    pub search: bool,
    /// Thinking budget, when a thinking marker was present.
    pub thinking_budget: Option<i64>,
    /// Ask the backend to include thought parts.
    pub include_thoughts: bool,
}

const MAX_THINKING_BUDGET: i64 = 32768;

/// Decode feature markers off the end of a model name.
///
/// Markers may appear in any order and combine; stripping repeats until the
/// remaining name ends with no recognized marker.
pub fn decode(model: &str) -> ModelFeatures {
    let mut features = ModelFeatures {
        base_model: String::new(),
        fake_streaming: false,
        anti_truncation: false,
        search: false,
        thinking_budget: None,
        include_thoughts: false,
    };

    let mut rest = model;
    loop {
        if let Some(stripped) = rest
            .strip_suffix("-search")
            .filter(|s| !s.is_empty())
        {
            features.search = true;
            rest = stripped;
        } else if let Some(stripped) = rest
            .strip_suffix("-fake-stream")
            .or_else(|| rest.strip_suffix("-假流式"))
            .filter(|s| !s.is_empty())
        {
            features.fake_streaming = true;
            rest = stripped;
        } else if let Some(stripped) = rest
            .strip_suffix("-anti-trunc")
            .or_else(|| rest.strip_suffix("-防截断"))
            .filter(|s| !s.is_empty())
        {
            features.anti_truncation = true;
            rest = stripped;
        } else if let Some(stripped) = rest
            .strip_suffix("-nothinking")
            .filter(|s| !s.is_empty())
        {
            features.thinking_budget = Some(0);
            features.include_thoughts = false;
            rest = stripped;
        } else if let Some(stripped) = rest
            .strip_suffix("-maxthinking")
            .filter(|s| !s.is_empty())
        {
            features.thinking_budget = Some(MAX_THINKING_BUDGET);
            features.include_thoughts = true;
            rest = stripped;
        } else if let Some((stripped, budget)) = strip_thinking_budget(rest) {
            features.thinking_budget = Some(budget);
            features.include_thoughts = true;
            rest = stripped;
        } else {
            break;
        }
    }

    features.base_model = rest.to_string();
    features
}

/// Match a trailing `-thinking-<n>` marker.
fn strip_thinking_budget(model: &str) -> Option<(&str, i64)> {
    let idx = model.rfind("-thinking-")?;
    let digits = &model[idx + "-thinking-".len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let base = &model[..idx];
    if base.is_empty() {
        return None;
    }
    let budget: i64 = digits.parse().ok()?;
    Some((base, budget.min(MAX_THINKING_BUDGET)))
}

/// Suffixes advertised in the model listing, one per feature.
const ADVERTISED_SUFFIXES: &[&str] = &[
    "",
    "-search",
    "-fake-stream",
    "-anti-trunc",
    "-nothinking",
    "-maxthinking",
];

/// Cross the configured base models with the advertised feature suffixes.
pub fn feature_model_ids(base_models: &[String]) -> Vec<String> {
    let mut ids = Vec::with_capacity(base_models.len() * ADVERTISED_SUFFIXES.len());
    for base in base_models {
        for suffix in ADVERTISED_SUFFIXES {
            ids.push(format!("{base}{suffix}"));
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_model_has_no_features() {
        let f = decode("gemini-2.5-pro");
        assert_eq!(f.base_model, "gemini-2.5-pro");
        assert!(!f.fake_streaming);
        assert!(!f.anti_truncation);
        assert!(!f.search);
        assert_eq!(f.thinking_budget, None);
    }

    #[test]
    fn single_markers_decode() {
        assert!(decode("gemini-2.5-flash-search").search);
        assert!(decode("gemini-2.5-flash-fake-stream").fake_streaming);
        assert!(decode("gemini-2.5-flash-anti-trunc").anti_truncation);
        assert!(decode("gemini-2.5-flash-假流式").fake_streaming);
        assert!(decode("gemini-2.5-flash-防截断").anti_truncation);
    }

    #[test]
    fn thinking_budget_decodes_with_thoughts() {
        let f = decode("gemini-2.5-pro-search-thinking-8192");
        assert_eq!(f.base_model, "gemini-2.5-pro");
        assert!(f.search);
        assert_eq!(f.thinking_budget, Some(8192));
        assert!(f.include_thoughts);
    }

    #[test]
    fn nothinking_and_maxthinking() {
        let f = decode("gemini-2.5-pro-nothinking");
        assert_eq!(f.thinking_budget, Some(0));
        assert!(!f.include_thoughts);

        let f = decode("gemini-2.5-pro-maxthinking");
        assert_eq!(f.thinking_budget, Some(32768));
        assert!(f.include_thoughts);
    }

    #[test]
    fn markers_combine_in_any_order() {
        let f = decode("gemini-2.5-pro-fake-stream-search");
        assert!(f.fake_streaming);
        assert!(f.search);
        assert_eq!(f.base_model, "gemini-2.5-pro");

        let f = decode("gemini-2.5-pro-search-fake-stream");
        assert!(f.fake_streaming);
        assert!(f.search);
        assert_eq!(f.base_model, "gemini-2.5-pro");
    }

    #[test]
    fn unrecognized_suffix_stays_in_base_name() {
        let f = decode("gemini-2.5-pro-preview-0325");
        assert_eq!(f.base_model, "gemini-2.5-pro-preview-0325");
    }

    #[test]
    fn oversized_thinking_budget_is_clamped() {
        let f = decode("gemini-2.5-pro-thinking-999999");
        assert_eq!(f.thinking_budget, Some(32768));
    }

    #[test]
    fn model_ids_cross_bases_with_suffixes() {
        let ids = feature_model_ids(&["gemini-2.5-pro".to_string()]);
        assert!(ids.contains(&"gemini-2.5-pro".to_string()));
        assert!(ids.contains(&"gemini-2.5-pro-search".to_string()));
        assert!(ids.contains(&"gemini-2.5-pro-fake-stream".to_string()));
        assert_eq!(ids.len(), 6);
    }
}
