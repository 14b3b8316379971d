use crate::models::{RankedResult, UserProfile};
use crate::rerank::truncate_chars;
use crate::traits::ContextProvider;
use tracing::error;

/// Returned instead of an empty block when nothing relevant was retrieved.
pub const NO_DOMAIN_DATA: &str = "<status>NO_DOMAIN_DATA</status>";

/// Injected by consumers when retrieval itself failed.
pub const KNOWLEDGE_BASE_OFFLINE: &str = "<status>KNOWLEDGE_BASE_OFFLINE</status>";

const ELLIPSIS: &str = "...";

/// Appends profile signals to the query for the coarse stage only.
pub fn expand_query(query: &str, profile: Option<&UserProfile>) -> String {
    let Some(profile) = profile else {
        return query.to_string();
    };

    let mut expanded = query.trim().to_string();
    if let Some(education) = profile.education.as_deref().map(str::trim) {
        if !education.is_empty() {
            expanded.push_str(" | education: ");
            expanded.push_str(education);
        }
    }

    let interests = profile
        .interest_domains
        .iter()
        .map(|domain| domain.trim())
        .filter(|domain| !domain.is_empty())
        .collect::<Vec<_>>();
    if !interests.is_empty() {
        expanded.push_str(" | interests: ");
        expanded.push_str(&interests.join(", "));
    }

    expanded
}

/// Numbered, source-attributed entries. Each entry body, including the
/// trailing `...` of a cut entry, is at most `max_chars` characters.
pub fn format_context(results: &[RankedResult], max_chars: usize) -> String {
    if results.is_empty() {
        return NO_DOMAIN_DATA.to_string();
    }

    results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            format!(
                "[{}] (source: {})\n{}",
                index + 1,
                result.metadata.source,
                excerpt(result.content.trim(), max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `content` cut to at most `max_chars` characters, marker included.
fn excerpt(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let kept = truncate_chars(content, max_chars.saturating_sub(ELLIPSIS.len()));
    format!("{kept}{ELLIPSIS}")
}

/// Context for a generation request that never fails: retrieval errors are
/// logged and replaced with [`KNOWLEDGE_BASE_OFFLINE`].
pub async fn context_or_offline(
    provider: &dyn ContextProvider,
    query: &str,
    profile: Option<&UserProfile>,
    k: usize,
) -> String {
    match provider.context_for_query(query, profile, k).await {
        Ok(context) => context,
        Err(failure) => {
            error!(
                error = %failure,
                model_unavailable = failure.is_model_unavailable(),
                "knowledge retrieval failed, continuing without domain data"
            );
            KNOWLEDGE_BASE_OFFLINE.to_string()
        }
    }
}
