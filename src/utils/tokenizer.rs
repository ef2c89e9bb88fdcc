use std::collections::HashSet;

/// Extract the token set of a message body.
///
/// The text is lower-cased first, then every maximal run of ASCII letters and
/// digits is a token; everything else separates tokens. Lower-casing before
/// splitting keeps the tokenizer consistent with the case-insensitive
/// substring matcher, so any query token is always contained in some body
/// token of a matching message.
pub fn extract_tokens(content: &str) -> HashSet<String> {
    let lowered = content.to_lowercase();
    let bytes = lowered.as_bytes();

    let mut tokens = HashSet::with_capacity(bytes.len() / 6 + 1);
    let mut token_start: Option<usize> = None;

    for (i, &byte) in bytes.iter().enumerate() {
        if byte.is_ascii_alphanumeric() {
            if token_start.is_none() {
                token_start = Some(i);
            }
        } else if let Some(start) = token_start.take() {
            tokens.insert(lowered[start..i].to_string());
        }
    }

    if let Some(start) = token_start {
        tokens.insert(lowered[start..].to_string());
    }

    tokens
}

/// Extract tokens suitable for query matching, sorted and deduplicated
pub fn tokenize_query(query: &str) -> Vec<String> {
    let mut result: Vec<_> = extract_tokens(query).into_iter().collect();
    result.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tokens() {
        let tokens = extract_tokens("Deploy READY: build-42 ok");
        assert!(tokens.contains("deploy"));
        assert!(tokens.contains("ready"));
        assert!(tokens.contains("build"));
        assert!(tokens.contains("42"));
        assert!(tokens.contains("ok"));
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn test_single_char_tokens_kept() {
        let tokens = extract_tokens("a b c");
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_non_ascii_separates() {
        let tokens = extract_tokens("café au lait");
        assert!(tokens.contains("caf"));
        assert!(tokens.contains("au"));
        assert!(tokens.contains("lait"));
    }

    #[test]
    fn test_punctuation_only_query_has_no_tokens() {
        assert!(tokenize_query("!?-- ...").is_empty());
        assert_eq!(tokenize_query("b a a"), vec!["a", "b"]);
    }

    #[test]
    fn test_long_runs_are_single_tokens() {
        let long = "x".repeat(300);
        let tokens = extract_tokens(&format!("{} short", long));
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&long));
    }
}
