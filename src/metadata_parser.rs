//! Reading and writing of metadata content lines.
//!
//! A metadata file is a sequence of content lines. Physical lines longer
//! than 75 bytes are folded; a line starting with a space or a tab
//! continues the previous one.
use std::collections::BTreeMap;

use pest::Parser;
use pest_derive::Parser;

use crate::error::{FolioError, Result};

#[derive(Parser)]
#[grammar = "metadata.pest"]
struct ContentLineParser;

pub const FOLD_WIDTH: usize = 75;

pub type Parameters = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLine {
    pub name: String,
    pub parameters: Parameters,
    /// Unescaped value.
    pub value: String,
}

/// Joins folded lines back together. Returns `(line number, logical line)`
/// pairs, skipping blank lines.
pub fn unfold_lines(data: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (number, line) in data.lines().enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push((number + 1, line.to_string()));
    }
    lines.retain(|(_, line)| !line.trim().is_empty());
    lines
}

pub fn parse_content_line(line: &str) -> Result<ContentLine> {
    let pair = ContentLineParser::parse(Rule::content_line, line)?
        .next()
        .ok_or_else(|| FolioError::parse("empty content line"))?;
    let mut content = ContentLine {
        name: String::new(),
        parameters: Parameters::new(),
        value: String::new(),
    };
    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::name => content.name = pair.as_str().to_string(),
            Rule::parameter => {
                let mut inner = pair.into_inner();
                let Some(name) = inner.next() else { continue };
                let values = inner
                    .map(|value| value.into_inner().map(|p| p.as_str().to_string()).collect::<String>())
                    .collect::<Vec<_>>();
                content
                    .parameters
                    .entry(name.as_str().to_string())
                    .or_default()
                    .extend(values);
            }
            Rule::value => content.value = unescape_data(pair.as_str()),
            _ => {}
        }
    }
    Ok(content)
}

/// Parses a whole metadata file into content lines, in file order.
pub fn read_content_lines(data: &str) -> Result<Vec<ContentLine>> {
    unfold_lines(data)
        .into_iter()
        .map(|(number, line)| {
            parse_content_line(&line).map_err(|e| match e {
                FolioError::Parse { message, col, .. } => {
                    FolioError::Parse { message, line: Some(number), col }
                }
                other => other,
            })
        })
        .collect()
}

pub fn escape_data(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

pub fn unescape_data(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('r') => unescaped.push('\r'),
            Some('\\') => unescaped.push('\\'),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

fn format_parameter_value(value: &str) -> Result<String> {
    if value.contains('"') || value.contains('\n') || value.contains('\r') {
        return Err(FolioError::InvalidValue(format!(
            "the parameter value '{value}' contains a double quote or a newline"
        )));
    }
    if value.contains([';', ':', ',']) {
        Ok(format!("\"{value}\""))
    } else {
        Ok(value.to_string())
    }
}

/// Splits a logical line into physical lines of at most [`FOLD_WIDTH`]
/// bytes; continuation lines start with a space.
pub fn fold_line(line: &str) -> String {
    if line.len() <= FOLD_WIDTH {
        return line.to_string();
    }
    let mut folded = String::with_capacity(line.len() + line.len() / FOLD_WIDTH * 2);
    let mut width = FOLD_WIDTH;
    let mut current = 0;
    for c in line.chars() {
        if current + c.len_utf8() > width {
            folded.push_str("\n ");
            current = 0;
            // the leading space counts
            width = FOLD_WIDTH - 1;
        }
        folded.push(c);
        current += c.len_utf8();
    }
    folded
}

/// Writes one content line (folded, with a trailing newline).
pub fn write_content_line(name: &str, parameters: &Parameters, value: &str) -> Result<String> {
    let mut line = name.to_string();
    for (parameter, values) in parameters {
        if values.is_empty() {
            continue;
        }
        let values = values
            .iter()
            .map(|v| format_parameter_value(v))
            .collect::<Result<Vec<_>>>()?;
        line.push(';');
        line.push_str(parameter);
        line.push('=');
        line.push_str(&values.join(","));
    }
    line.push(':');
    line.push_str(&escape_data(value));
    let mut folded = fold_line(&line);
    folded.push('\n');
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_and_escapes() {
        let line = parse_content_line("title;lang=fr;x-type=\"a;b\",c:Bonjour\\nle monde").unwrap();
        assert_eq!(line.name, "title");
        assert_eq!(line.parameters["lang"], vec!["fr".to_string()]);
        assert_eq!(line.parameters["x-type"], vec!["a;b".to_string(), "c".to_string()]);
        assert_eq!(line.value, "Bonjour\nle monde");
    }

    #[test]
    fn value_may_contain_colons() {
        let line = parse_content_line("uri:http://example.com/a;b").unwrap();
        assert_eq!(line.value, "http://example.com/a;b");
    }

    #[test]
    fn bad_names_fail() {
        assert!(parse_content_line("_title:x").is_err());
        assert!(parse_content_line("title").is_err());
        assert!(parse_content_line("title;lang=\"fr:x").is_err());
    }

    #[test]
    fn folding_round_trip() {
        let value = "word ".repeat(40);
        let text = write_content_line("description", &Parameters::new(), &value).unwrap();
        assert!(text.lines().all(|l| l.len() <= FOLD_WIDTH));
        let lines = read_content_lines(&text).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].value, value);
    }

    #[test]
    fn quoting_rules() {
        let mut parameters = Parameters::new();
        parameters.insert("p".to_string(), vec!["a,b".to_string()]);
        let text = write_content_line("x", &parameters, "v").unwrap();
        assert_eq!(text, "x;p=\"a,b\":v\n");
        parameters.insert("q".to_string(), vec!["say \"hi\"".to_string()]);
        assert!(write_content_line("x", &parameters, "v").is_err());
    }
}
