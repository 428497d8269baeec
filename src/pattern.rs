//! URI and attribute filters.
//!
//! The world model evaluates filters as extended regular expressions that
//! must match the whole URI or attribute name. This module builds those
//! expressions from class names and evaluates them locally with the same
//! full-match semantics.

use std::fmt;

use regex::Regex;

use crate::error::PatternError;

/// Matches every URI or attribute.
pub const MATCH_ALL: &str = ".*";

/// Returns the literal `.class.` segment marker for a class name.
#[must_use]
pub fn segment_marker(class: &str) -> String {
    format!(".{class}.")
}

/// Returns true if `uri` contains `class` as an interior, dot-delimited segment.
///
/// A bare substring does not count: `mug` matches `room.mug.1` but not
/// `room.mugshot.1`.
#[must_use]
pub fn has_class_segment(uri: &str, class: &str) -> bool {
    uri.contains(&segment_marker(class))
}

/// Builds a URI filter matching any URI that carries one of `classes` as an
/// interior segment.
///
/// With exactly one class the alternation is skipped. Class names are
/// escaped, so a class such as `a.b` only matches literally.
///
/// # Errors
///
/// Returns `PatternError::EmptyClassSet` if `classes` is empty.
pub fn class_filter<I, S>(classes: I) -> Result<String, PatternError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let escaped: Vec<String> = classes
        .into_iter()
        .map(|c| regex::escape(c.as_ref()))
        .collect();

    match escaped.as_slice() {
        [] => Err(PatternError::EmptyClassSet),
        [single] => Ok(format!(r".*\.{single}\..*")),
        many => Ok(format!(r".*\.({})\..*", many.join("|"))),
    }
}

/// Filter for attribute names starting with `prefix`.
#[must_use]
pub fn prefix_filter(prefix: &str) -> String {
    format!("{}.*", regex::escape(prefix))
}

/// A compiled whole-string filter.
#[derive(Clone)]
pub struct UriFilter {
    source: String,
    regex: Regex,
}

impl UriFilter {
    /// Compiles `pattern` with whole-string match semantics.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::InvalidPattern` if the expression does not compile.
    pub fn new(pattern: impl Into<String>) -> Result<Self, PatternError> {
        let source = pattern.into();
        let regex = Regex::new(&format!("^(?:{source})$")).map_err(|e| PatternError::InvalidPattern {
            pattern: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { source, regex })
    }

    /// Builds and compiles a class filter.
    ///
    /// # Errors
    ///
    /// See [`class_filter`] and [`UriFilter::new`].
    pub fn for_classes<I, S>(classes: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(class_filter(classes)?)
    }

    /// The expression as sent to the world model.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the whole of `candidate` matches.
    #[must_use]
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

impl fmt::Debug for UriFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UriFilter").field(&self.source).finish()
    }
}

/// A set of attribute-name filters; a name matches if any filter matches.
#[derive(Debug, Clone)]
pub struct PatternSet {
    filters: Vec<UriFilter>,
}

impl PatternSet {
    /// Compiles every pattern.
    ///
    /// # Errors
    ///
    /// Returns the first compilation failure.
    pub fn new<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filters = patterns
            .into_iter()
            .map(UriFilter::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    /// A set matching every name.
    #[must_use]
    pub fn match_all() -> Self {
        Self {
            filters: vec![UriFilter {
                source: MATCH_ALL.to_string(),
                regex: Regex::new("^(?:.*)$").expect("static pattern compiles"),
            }],
        }
    }

    /// Source expressions, in order.
    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.source.clone()).collect()
    }

    /// Returns true if any filter matches `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.filters.iter().any(|f| f.is_match(name))
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if the set has no filters (matches nothing).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
