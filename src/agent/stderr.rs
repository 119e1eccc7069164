// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed taxonomy of agent stderr error patterns.
//!
//! Every stderr line is scanned against these patterns; a match is promoted
//! to a session-scoped error envelope by the dispatcher. The user-visible
//! message is short and actionable; the raw line travels in `details`.

/// Classified stderr failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrKind {
    RateLimit,
    InvalidApiKey,
    Unauthorized,
    QuotaExceeded,
    ApiError,
}

/// Scan one stderr line against the taxonomy. More specific patterns win
/// over broader ones (an invalid-key 401 classifies as `InvalidApiKey`).
pub fn classify(line: &str) -> Option<StderrKind> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
        Some(StderrKind::RateLimit)
    } else if lower.contains("invalid api key") || lower.contains("invalid_api_key") {
        Some(StderrKind::InvalidApiKey)
    } else if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("401")
        || lower.contains("403")
    {
        Some(StderrKind::Unauthorized)
    } else if lower.contains("quota") {
        Some(StderrKind::QuotaExceeded)
    } else if line.contains("AI_APICallError") {
        Some(StderrKind::ApiError)
    } else {
        None
    }
}

impl StderrKind {
    /// Human-readable message surfaced to the client.
    pub fn user_message(&self) -> &'static str {
        match self {
            StderrKind::RateLimit => "Rate limit exceeded. Please try again later.",
            StderrKind::InvalidApiKey => "Invalid API key. Update your provider configuration.",
            StderrKind::Unauthorized => {
                "Authentication with the AI provider failed. Check your credentials."
            }
            StderrKind::QuotaExceeded => "Usage quota exceeded. Check your plan and billing.",
            StderrKind::ApiError => "The AI provider returned an error.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_patterns() {
        assert_eq!(
            classify("Rate limit exceeded at 2025-01-01T00:00:00Z"),
            Some(StderrKind::RateLimit)
        );
        assert_eq!(classify("HTTP 429 Too Many Requests"), Some(StderrKind::RateLimit));
        assert_eq!(classify("error: 401 Unauthorized"), Some(StderrKind::Unauthorized));
        assert_eq!(classify("403 Forbidden"), Some(StderrKind::Unauthorized));
        assert_eq!(
            classify("provider rejected request: invalid API key"),
            Some(StderrKind::InvalidApiKey)
        );
        assert_eq!(
            classify("monthly quota exhausted"),
            Some(StderrKind::QuotaExceeded)
        );
        assert_eq!(
            classify("AI_APICallError: upstream failure"),
            Some(StderrKind::ApiError)
        );
    }

    #[test]
    fn specific_patterns_beat_broad_ones() {
        // A 401 caused by a bad key should surface the key problem.
        assert_eq!(
            classify("401 unauthorized: invalid api key supplied"),
            Some(StderrKind::InvalidApiKey)
        );
    }

    #[test]
    fn ordinary_log_lines_pass_through() {
        assert_eq!(classify("INFO starting model stream"), None);
        assert_eq!(classify(""), None);
        // Case-sensitive marker: lowercase variants are not the marker.
        assert_eq!(classify("ai_apicallerror"), None);
    }
}
