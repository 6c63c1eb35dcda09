//! Shell wildcard lists for selecting stow subdirectories.

use regex::Regex;

use crate::vfs::{VfsError, VfsResult};

/// One compiled wildcard.
#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    regex: Regex,
}

/// An ordered list of shell wildcards. A name matches the list if it
/// matches any member. Wildcards never match `/`.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl PatternList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: &str) -> VfsResult<()> {
        let regex = Regex::new(&translate(pattern))
            .map_err(|e| VfsError::other(format!("bad pattern {pattern:?}: {e}")))?;
        self.patterns.push(Pattern {
            source: pattern.to_string(),
            regex,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(name))
    }

    /// The patterns as given.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.source.as_str())
    }
}

impl<'a> FromIterator<&'a str> for PatternList {
    /// Collect patterns, dropping any that fail to compile.
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut list = PatternList::new();
        for pattern in iter {
            if let Err(e) = list.add(pattern) {
                tracing::warn!(error = %e, "ignoring pattern");
            }
        }
        list
    }
}

/// Translate a wildcard into an anchored regular expression.
fn translate(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(r"\\"),
            },
            '[' => {
                // Find the closing bracket; a `]` right after `[` or `[!`
                // is a literal member.
                let rest: String = chars.clone().collect();
                let mut body_len = 0;
                let mut iter = rest.chars().peekable();
                let mut class = String::from("[[");
                if matches!(iter.peek(), Some('!') | Some('^')) {
                    iter.next();
                    body_len += 1;
                    class.push('^');
                }
                let mut closed = false;
                let mut first = true;
                for m in iter {
                    body_len += 1;
                    if m == ']' && !first {
                        closed = true;
                        break;
                    }
                    first = false;
                    match m {
                        '\\' | '[' | '^' | '&' | '~' => {
                            class.push('\\');
                            class.push(m);
                        }
                        ']' => class.push_str(r"\]"),
                        _ => class.push(m),
                    }
                }
                if closed {
                    // Classes never match the separator either.
                    class.push_str("]&&[^/]]");
                    out.push_str(&class);
                    for _ in 0..body_len {
                        chars.next();
                    }
                } else {
                    out.push_str(r"\[");
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}
