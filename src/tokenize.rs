//! Splitting values into catalog terms.
use std::collections::HashMap;

use lazy_static::lazy_static;
use sha1::{Digest, Sha1};

use crate::datatype::{FieldType, Value};

/// Terms longer than this (in bytes) are replaced by their SHA-1 digest.
pub const MAX_TERM_SIZE: usize = 240;

lazy_static! {
    static ref TRANSLATE_MAP: HashMap<char, char> = {
        let mut map = HashMap::new();
        for (from, to) in [
            ('À', 'A'), ('Â', 'A'), ('â', 'a'), ('à', 'a'),
            ('Ç', 'C'), ('ç', 'c'),
            ('É', 'E'), ('Ê', 'E'), ('é', 'e'), ('ê', 'e'), ('è', 'e'), ('ë', 'e'),
            ('Î', 'I'), ('î', 'i'), ('ï', 'i'),
            ('ô', 'o'),
            ('û', 'u'), ('ù', 'u'), ('ü', 'u'),
            ('\'', ' '),
        ] {
            map.insert(from, to);
        }
        map
    };
}

/// Strips the accents the catalog ignores.
pub fn translate(text: &str) -> String {
    text.chars().map(|c| *TRANSLATE_MAP.get(&c).unwrap_or(&c)).collect()
}

pub fn is_cjk_language(language: &str) -> bool {
    matches!(language, "ja" | "zh" | "ko")
}

/// Reduces an identity or scalar term to at most 40 hex digits when it
/// would not fit in the index.
pub fn reduce_size(data: &[u8]) -> Vec<u8> {
    if data.len() > MAX_TERM_SIZE {
        let digest = Sha1::digest(data);
        return digest.iter().map(|b| format!("{b:02x}")).collect::<String>().into_bytes();
    }
    data.to_vec()
}

/// Words: runs of alphanumeric characters, accent-stripped and lowercased.
pub fn words(text: &str) -> Vec<String> {
    translate(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Bigrams over runs of letters, digits and ideographs. A run of a single
/// character is emitted as is; anything else closes the run.
pub fn cjk_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut state = 0;
    let mut previous: Option<String> = None;
    for c in text.chars() {
        if !c.is_alphanumeric() {
            if let (Some(p), 1) = (previous.take(), state) {
                tokens.push(p);
            }
            state = 0;
            continue;
        }
        let c: String = c.to_lowercase().collect();
        match previous.take() {
            Some(p) => {
                tokens.push(format!("{p}{c}"));
                state = 2;
            }
            None => state = 1,
        }
        previous = Some(c);
    }
    if let (Some(p), 1) = (previous, state) {
        tokens.push(p);
    }
    tokens
}

pub fn tokenize_text(text: &str, language: &str) -> Vec<String> {
    if is_cjk_language(language) {
        cjk_tokens(text)
    } else {
        words(text)
    }
}

/// `(term without prefix, position)` pairs for one or several values of a
/// field. Positions start at 1 and keep growing across values.
pub fn postings(datatype: FieldType, values: &[&Value], language: &str) -> Vec<(Vec<u8>, u32)> {
    let mut postings = Vec::new();
    if datatype == FieldType::Unicode {
        let mut position = 1;
        for value in values {
            for token in tokenize_text(&value.encode(), language) {
                postings.push((token.into_bytes(), position));
                position += 1;
            }
            // a gap so phrases never span two values
            position += 1;
        }
        return postings;
    }
    for (idx, value) in values.iter().enumerate() {
        postings.push((reduce_size(&value.to_catalog_bytes()), idx as u32 + 1));
    }
    postings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_tokens() {
        assert_eq!(words("L'Été, à Paris!"), vec!["l", "ete", "a", "paris"]);
        assert_eq!(words("  "), Vec::<String>::new());
    }

    #[test]
    fn cjk_bigrams() {
        assert_eq!(cjk_tokens("東京都"), vec!["東京", "京都"]);
        assert_eq!(cjk_tokens("東。京都"), vec!["東", "京都"]);
        assert_eq!(cjk_tokens("A"), vec!["a"]);
    }

    #[test]
    fn long_terms_are_reduced() {
        let long = vec![b'a'; 241];
        assert_eq!(reduce_size(&long).len(), 40);
        assert_eq!(reduce_size(b"short"), b"short".to_vec());
    }

    #[test]
    fn positions_continue_across_values() {
        let a = Value::from("big bad");
        let b = Value::from("wolf");
        let postings = postings(FieldType::Unicode, &[&a, &b], "en");
        let positions: Vec<_> = postings.iter().map(|(_, p)| *p).collect();
        assert_eq!(positions, vec![1, 2, 4]);
    }
}
