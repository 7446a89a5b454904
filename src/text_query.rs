//! Parsing of free text queries.
//!
//! `wolf "big bad" -dog +forest hou*`: plain terms are alternatives,
//! `+` terms are required, `-` terms are excluded, quoted text is an exact
//! phrase and a trailing `*` matches every term starting with the word.
//! Terms are accent-stripped and lowercased like indexed text.
use pest::Parser;
use pest_derive::Parser;

use crate::error::{FolioError, Result};
use crate::tokenize::{tokenize_text, translate};

#[derive(Parser)]
#[grammar = "text_query.pest"]
struct TextQueryParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Required,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// One or more words; several words must appear in sequence.
    Words(Vec<String>),
    /// Every term starting with the prefix.
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub modifier: Option<Modifier>,
    pub term: Term,
}

/// Words and phrases are tokenized the way values of `language` are
/// indexed.
pub fn parse_text_query(text: &str, language: &str) -> Result<Vec<Clause>> {
    let query = TextQueryParser::parse(Rule::query, text)
        .map_err(|e| FolioError::InvalidQuery(format!("cannot parse '{text}': {}", e.variant.message())))?
        .next()
        .ok_or_else(|| FolioError::InvalidQuery(format!("cannot parse '{text}'")))?;

    let mut clauses = Vec::new();
    for clause in query.into_inner().filter(|p| p.as_rule() == Rule::clause) {
        let mut modifier = None;
        let mut term = None;
        for pair in clause.into_inner() {
            match pair.as_rule() {
                Rule::modifier => {
                    modifier = Some(if pair.as_str() == "+" {
                        Modifier::Required
                    } else {
                        Modifier::Excluded
                    })
                }
                Rule::word | Rule::phrase => {
                    let words = tokenize_text(pair.as_str(), language);
                    if !words.is_empty() {
                        term = Some(Term::Words(words));
                    }
                }
                Rule::wildcard => {
                    let prefix = translate(pair.as_str().trim_end_matches('*')).to_lowercase();
                    if !prefix.is_empty() {
                        term = Some(Term::Prefix(prefix));
                    }
                }
                _ => {}
            }
        }
        if let Some(term) = term {
            clauses.push(Clause { modifier, term });
        }
    }
    Ok(clauses)
}
