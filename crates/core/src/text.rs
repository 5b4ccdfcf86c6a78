//! Tokenization shared by query building, relevance scoring, and keyword
//! classification.

const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "am", "an", "and", "any", "are", "aren", "as", "at", "be", "been", "but",
    "by", "can", "could", "did", "do", "does", "don", "for", "from", "get", "got", "had", "has",
    "have", "he", "her", "him", "his", "how", "i", "if", "im", "in", "is", "it", "its", "ll", "m",
    "me", "my", "of", "on", "or", "our", "please", "s", "she", "so", "t", "that", "the", "their",
    "them", "they", "this", "to", "us", "ve", "was", "we", "were", "what", "when", "will", "with",
    "would", "y", "you", "your",
];

pub fn normalize(text: &str) -> String {
    text.to_lowercase()
}

/// Lowercased alphanumeric tokens in input order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in normalize(text).chars() {
        if character.is_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Tokens with stop words removed and duplicates dropped, first occurrence
/// wins.
pub fn content_tokens(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in tokenize(text) {
        if is_stop_word(&token) || seen.contains(&token) {
            continue;
        }
        seen.push(token);
    }
    seen
}
