//! The query algebra.
//!
//! ```
//! use folio::query::Query;
//! let q = Query::and([
//!     Query::phrase("format", "text/plain"),
//!     Query::All,
//!     Query::text("title", "+wolf -dog"),
//! ]);
//! assert_eq!(q.atoms().len(), 2);
//! ```
use std::fmt;

use crate::datatype::Value;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    All,
    /// Exact phrase on an indexed field.
    Phrase { name: String, value: Value },
    /// `left <= value <= right` on a stored field, either end open.
    Range { name: String, left: Option<Value>, right: Option<Value> },
    /// Stored value starting with the given one.
    Start { name: String, value: Value },
    /// Free text on an indexed field, see [`crate::text_query`].
    Text { name: String, value: String },
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    pub fn phrase(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Phrase { name: name.into(), value: value.into() }
    }
    pub fn range(name: impl Into<String>, left: Option<Value>, right: Option<Value>) -> Self {
        Query::Range { name: name.into(), left, right }
    }
    pub fn start(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Start { name: name.into(), value: value.into() }
    }
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Text { name: name.into(), value: value.into() }
    }
    pub fn not(query: Query) -> Self {
        Query::Not(Box::new(query))
    }

    /// Intersection. Nested intersections are flattened and `All` is
    /// dropped unless it is the only atom.
    pub fn and(queries: impl IntoIterator<Item = Query>) -> Self {
        let mut atoms = Vec::new();
        for query in queries {
            match query {
                Query::And(inner) => inner.into_iter().for_each(|q| and_append(&mut atoms, q)),
                other => and_append(&mut atoms, other),
            }
        }
        Query::And(atoms)
    }

    /// Union. Nested unions are flattened; any `All` makes the whole
    /// union `All`.
    pub fn or(queries: impl IntoIterator<Item = Query>) -> Self {
        let mut atoms = Vec::new();
        for query in queries {
            match query {
                Query::Or(inner) => inner.into_iter().for_each(|q| or_append(&mut atoms, q)),
                other => or_append(&mut atoms, other),
            }
        }
        Query::Or(atoms)
    }

    pub fn atoms(&self) -> &[Query] {
        match self {
            Query::And(atoms) | Query::Or(atoms) => atoms,
            _ => std::slice::from_ref(self),
        }
    }

    pub fn fold<F: QueryFolder>(&self, folder: &mut F) -> Result<F::Output> {
        match self {
            Query::All => folder.all(),
            Query::Phrase { name, value } => folder.phrase(name, value),
            Query::Range { name, left, right } => folder.range(name, left.as_ref(), right.as_ref()),
            Query::Start { name, value } => folder.start(name, value),
            Query::Text { name, value } => folder.text(name, value),
            Query::Not(query) => {
                let inner = query.fold(folder)?;
                folder.not(inner)
            }
            Query::And(atoms) | Query::Or(atoms) if atoms.len() == 1 => atoms[0].fold(folder),
            Query::And(atoms) => {
                let atoms = atoms.iter().map(|q| q.fold(folder)).collect::<Result<Vec<_>>>()?;
                folder.and(atoms)
            }
            Query::Or(atoms) => {
                let atoms = atoms.iter().map(|q| q.fold(folder)).collect::<Result<Vec<_>>>()?;
                folder.or(atoms)
            }
        }
    }

    fn pretty(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Query::All => write!(f, "{pad}All"),
            Query::Phrase { name, value } => write!(f, "{pad}Phrase({name:?}, {:?})", value.encode()),
            Query::Range { name, left, right } => write!(
                f,
                "{pad}Range({name:?}, {}, {})",
                left.as_ref().map_or("*".to_string(), |v| format!("{:?}", v.encode())),
                right.as_ref().map_or("*".to_string(), |v| format!("{:?}", v.encode())),
            ),
            Query::Start { name, value } => write!(f, "{pad}Start({name:?}, {:?})", value.encode()),
            Query::Text { name, value } => write!(f, "{pad}Text({name:?}, {value:?})"),
            Query::Not(query) => {
                writeln!(f, "{pad}Not(")?;
                query.pretty(f, indent + 1)?;
                write!(f, "\n{pad})")
            }
            Query::And(atoms) | Query::Or(atoms) => {
                let op = if matches!(self, Query::And(_)) { "And" } else { "Or" };
                if atoms.is_empty() {
                    return write!(f, "{pad}{op}()");
                }
                writeln!(f, "{pad}{op}(")?;
                for (i, atom) in atoms.iter().enumerate() {
                    atom.pretty(f, indent + 1)?;
                    if i + 1 < atoms.len() {
                        f.write_str(",")?;
                    }
                    f.write_str("\n")?;
                }
                write!(f, "{pad})")
            }
        }
    }
}

fn and_append(atoms: &mut Vec<Query>, atom: Query) {
    if atoms.is_empty() {
        atoms.push(atom);
    } else if atoms.len() == 1 && atoms[0] == Query::All {
        atoms[0] = atom;
    } else if atom != Query::All {
        atoms.push(atom);
    }
}

fn or_append(atoms: &mut Vec<Query>, atom: Query) {
    if atoms.first() == Some(&Query::All) {
        return;
    }
    if atom == Query::All {
        atoms.clear();
    }
    atoms.push(atom);
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pretty(f, 0)
    }
}

/// Evaluation of a query, bottom-up.
pub trait QueryFolder {
    type Output;
    fn all(&mut self) -> Result<Self::Output>;
    fn phrase(&mut self, name: &str, value: &Value) -> Result<Self::Output>;
    fn range(&mut self, name: &str, left: Option<&Value>, right: Option<&Value>) -> Result<Self::Output>;
    fn start(&mut self, name: &str, value: &Value) -> Result<Self::Output>;
    fn text(&mut self, name: &str, value: &str) -> Result<Self::Output>;
    fn not(&mut self, inner: Self::Output) -> Result<Self::Output>;
    /// An empty intersection matches nothing.
    fn and(&mut self, atoms: Vec<Self::Output>) -> Result<Self::Output>;
    fn or(&mut self, atoms: Vec<Self::Output>) -> Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_drops_all() {
        let q = Query::phrase("a", "x");
        assert_eq!(Query::and([q.clone(), Query::All]), Query::And(vec![q.clone()]));
        assert_eq!(Query::and([Query::All, q.clone()]), Query::And(vec![q.clone()]));
        assert_eq!(Query::and([Query::All]), Query::And(vec![Query::All]));
        let nested = Query::and([Query::and([q.clone(), q.clone()]), q.clone()]);
        assert_eq!(nested.atoms().len(), 3);
    }

    #[test]
    fn or_collapses_to_all() {
        let q = Query::phrase("a", "x");
        assert_eq!(Query::or([q.clone(), Query::All, q.clone()]), Query::Or(vec![Query::All]));
        assert_eq!(Query::or([Query::All, q.clone()]), Query::Or(vec![Query::All]));
        assert_eq!(Query::or([q.clone(), q.clone()]).atoms().len(), 2);
    }

    #[test]
    fn pretty_printing() {
        let q = Query::and([Query::phrase("a", "x"), Query::not(Query::text("b", "y"))]);
        let text = q.to_string();
        assert!(text.starts_with("And(\n  Phrase(\"a\", \"x\"),\n  Not(\n"));
    }
}
