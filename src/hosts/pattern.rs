//! Host-match expressions.
//!
//! Expressions are host wildcards: `.` is literal and `*` matches any run of
//! characters. Everything else is handed to the regex engine as-is, so
//! operators can still write small regular expressions (`(www|m)\.example`).
//! Matching is case-sensitive and unanchored.

use regex::Regex;

/// Error returned when an expression cannot be compiled.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    /// The translated expression is not a valid regular expression.
    #[error("invalid host pattern {pattern:?}")]
    Invalid {
        /// The expression as written by the operator.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// An ordered set of compiled host-match expressions.
///
/// A host matches the set if it matches any element. The empty set matches
/// nothing.
///
/// # Example
///
/// ```
/// use autohost::hosts::PatternSet;
///
/// let set = PatternSet::compile(["*.google.com", "youtube"]).unwrap();
/// assert!(set.matches("www.google.com"));
/// assert!(set.matches("m.youtube.com"));
/// assert!(!set.matches("example.org"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    /// Compile every expression, failing on the first one that does not compile.
    pub fn compile<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| compile_one(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    /// Compile a pipe-separated list such as `*.google.com|*.youtube.com`.
    ///
    /// Empty segments are ignored.
    pub fn parse(list: &str) -> Result<Self, PatternError> {
        Self::compile(list.split('|').map(str::trim).filter(|s| !s.is_empty()))
    }

    /// Returns true if `host` matches at least one expression.
    #[inline]
    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(host))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

fn compile_one(pattern: &str) -> Result<Regex, PatternError> {
    let translated = pattern.replace('.', r"\.").replace('*', ".*");
    Regex::new(&translated).map_err(|source| PatternError::Invalid {
        pattern: pattern.to_string(),
        source,
    })
}
