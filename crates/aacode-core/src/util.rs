use std::time::Duration;

/// Approximate a token count for `text` when no real tokenizer is wired in.
///
/// spec.md §4.4 calls for "a tokenizer library when available and otherwise
/// the approximation `len(text)/4`". This core treats the approximation as
/// the only implementation, since the concrete tokenizer is a model-provider
/// detail the spec places out of scope; callers that have a real tokenizer
/// available can bypass this by constructing `Message`s with a precomputed
/// token count.
pub fn approximate_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// First 8 hex characters of the MD5 digest of `payload`, matching the
/// content-hash scheme ArchiveEntry (spec.md §3) uses for deduplication.
pub fn content_hash(payload: &[u8]) -> String {
    let digest = md5::compute(payload);
    format!("{digest:x}")[..8].to_string()
}

/// Returns up to `max` candidates from `pool` whose normalized similarity to
/// `needle` is at least `cutoff`, ordered by descending similarity. Mirrors
/// `difflib.get_close_matches`'s cutoff/count defaults, which the teacher
/// material leans on uniformly for tool-name, parameter-alias, and
/// shell-command suggestions.
pub fn closest_matches<'a>(
    needle: &str,
    pool: impl IntoIterator<Item = &'a str>,
    max: usize,
    cutoff: f64,
) -> Vec<&'a str> {
    let mut scored: Vec<(f64, &'a str)> = pool
        .into_iter()
        .map(|candidate| (strsim::normalized_levenshtein(needle, candidate), candidate))
        .filter(|(score, _)| *score >= cutoff)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max);
    scored.into_iter().map(|(_, candidate)| candidate).collect()
}

/// Exponential backoff used between tool-call retries: `base * 2^(attempt-1)`.
pub fn retry_backoff(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn token_count_rounds_up() {
        assert_eq!(approximate_token_count(""), 0);
        assert_eq!(approximate_token_count("abc"), 1);
        assert_eq!(approximate_token_count("abcde"), 2);
    }

    #[test]
    fn hash_is_stable_and_eight_chars() {
        let a = content_hash(b"hello world");
        let b = content_hash(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        let c = content_hash(b"different");
        assert_ne!(a, c);
    }

    #[test]
    fn closest_matches_finds_typo() {
        let pool = ["read_file", "write_file", "run_shell"];
        let matches = closest_matches("read_fiel", pool, 3, 0.6);
        assert_eq!(matches.first(), Some(&"read_file"));
    }

    #[test]
    fn closest_matches_respects_cutoff() {
        let pool = ["read_file", "write_file"];
        let matches = closest_matches("completely_unrelated_name", pool, 3, 0.6);
        assert!(matches.is_empty());
    }
}
