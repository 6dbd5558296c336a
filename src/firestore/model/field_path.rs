use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Reserved field name addressing the document key in filters and orderings.
pub const DOCUMENT_KEY_NAME: &str = "__name__";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "FieldPath must contain at least one segment",
            ));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument("FieldPath segments cannot be empty"));
        }
        Ok(Self { segments })
    }

    /// Parses a user supplied dotted path such as `a.b.c`. No escaping is
    /// recognised; use [`FieldPath::from_server_format`] for backticks.
    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
            return Err(invalid_argument(format!(
                "Invalid field path '{path}': paths must not start or end with '.' or contain '..'"
            )));
        }
        FieldPath::new(path.split('.'))
    }

    /// Parses the escaped canonical form produced by
    /// [`FieldPath::canonical_string`]: segments are separated by dots and may
    /// be quoted with backticks, inside which `\` escapes the next character.
    pub fn from_server_format(path: &str) -> FirestoreResult<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_backticks = false;
        let mut chars = path.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let next = chars.next().ok_or_else(|| {
                        invalid_argument(format!("Trailing escape character in field path '{path}'"))
                    })?;
                    current.push(next);
                }
                '.' if !in_backticks => {
                    if current.is_empty() {
                        return Err(invalid_argument(format!(
                            "Invalid field path '{path}': empty segment"
                        )));
                    }
                    segments.push(std::mem::take(&mut current));
                }
                '`' => in_backticks = !in_backticks,
                other => current.push(other),
            }
        }
        if in_backticks {
            return Err(invalid_argument(format!(
                "Unterminated ` in field path '{path}'"
            )));
        }
        if current.is_empty() {
            return Err(invalid_argument(format!(
                "Invalid field path '{path}': empty segment"
            )));
        }
        segments.push(current);
        FieldPath::new(segments)
    }

    pub fn last_segment(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn first_segment(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn pop_first(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[1..].to_vec(),
        })
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(l, r)| l == r)
    }

    /// Dotted form with every segment that is not a plain identifier quoted in
    /// backticks.
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|segment| escape_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.segments.clone()
    }

    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_NAME.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_segment(segment: &str) -> String {
    if is_identifier(segment) {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(other.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
    }

    #[test]
    fn rejects_empty() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }

    #[test]
    fn escapes_non_identifier_segments() {
        let field = FieldPath::new(["a", "b.c", "1d", "e`f"]).unwrap();
        assert_eq!(field.canonical_string(), "a.`b.c`.`1d`.`e\\`f`");
        let parsed = FieldPath::from_server_format(&field.canonical_string()).unwrap();
        assert_eq!(parsed, field);
    }

    #[test]
    fn recognises_key_field() {
        assert!(FieldPath::document_id().is_key_field());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_field());
        let parsed = FieldPath::from_server_format("__name__").unwrap();
        assert!(parsed.is_key_field());
    }

    #[test]
    fn prefix_checks() {
        let a = FieldPath::from_dot_separated("a").unwrap();
        let ab = FieldPath::from_dot_separated("a.b").unwrap();
        assert!(a.is_prefix_of(&ab));
        assert!(!ab.is_prefix_of(&a));
        assert!(a < ab);
    }
}
