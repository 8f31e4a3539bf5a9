use crate::support::{Error, Result};

/// True when a path segment contains wildcard metacharacters and therefore
/// needs the compiled matcher rather than a direct child lookup.
#[inline]
pub fn has_wildcards(segment: &str) -> bool {
    segment
        .bytes()
        .any(|b| b == b'*' || b == b'?' || b == b'[')
}

/// Splits a slash-separated path into segments. Returns whether the path was
/// anchored at the root. `.` and `..` are ordinary names. Empty interior
/// segments are rejected.
pub fn split_path(path: &str) -> Result<(bool, Vec<&str>)> {
    let (absolute, rest) = match path.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, path),
    };

    if rest.is_empty() {
        return Ok((absolute, Vec::new()));
    }

    let segments: Vec<&str> = rest.split('/').collect();

    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::BadArgument);
    }

    Ok((absolute, segments))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Literal(char),
    Any,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

#[derive(Debug, Clone, PartialEq)]
enum SegmentKind {
    /// No metacharacters; direct string compare.
    Literal(String),
    /// Character-level glob with `*`, `?` and `[...]` classes.
    Glob(Vec<Tok>),
    /// `[Ilo-Ihi]`: matches auto-generated numeric names within the bounds.
    Range(u64, u64),
}

/// One compiled path-segment pattern, anchored at both ends of the segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPattern {
    kind: SegmentKind,
}

impl SegmentPattern {
    pub fn compile(text: &str) -> Result<SegmentPattern> {
        if text.is_empty() {
            return Err(Error::BadArgument);
        }

        if !has_wildcards(text) {
            return Ok(SegmentPattern {
                kind: SegmentKind::Literal(text.to_owned()),
            });
        }

        if let Some(range) = Self::try_compile_range(text)? {
            return Ok(range);
        }

        let mut toks = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    // Collapse star runs, they are equivalent
                    if toks.last() != Some(&Tok::Star) {
                        toks.push(Tok::Star);
                    }
                }
                '?' => toks.push(Tok::Any),
                '[' => {
                    let negated = chars.peek() == Some(&'^');
                    if negated {
                        chars.next();
                    }

                    let mut ranges = Vec::new();
                    let mut closed = false;

                    while let Some(item) = chars.next() {
                        if item == ']' {
                            closed = true;
                            break;
                        }

                        if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                Some(']') => {
                                    // Trailing dash is a literal
                                    ranges.push((item, item));
                                    ranges.push(('-', '-'));
                                    closed = true;
                                    break;
                                }
                                Some(hi) => ranges.push((item, hi)),
                                None => return Err(Error::BadArgument),
                            }
                        } else {
                            ranges.push((item, item));
                        }
                    }

                    if !closed || ranges.is_empty() {
                        return Err(Error::BadArgument);
                    }

                    toks.push(Tok::Class { negated, ranges });
                }
                other => toks.push(Tok::Literal(other)),
            }
        }

        Ok(SegmentPattern {
            kind: SegmentKind::Glob(toks),
        })
    }

    /// A whole segment of the exact shape `[I<digits>-I<digits>]` is a
    /// numeric auto-name range, e.g. `[I3-I7]`. Any other bracket expression
    /// stays an ordinary character class. Ranges with reversed bounds are
    /// rejected rather than demoted to a class.
    fn try_compile_range(text: &str) -> Result<Option<SegmentPattern>> {
        let inner = match text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            Some(inner) => inner,
            None => return Ok(None),
        };

        let dash = match inner.find('-') {
            Some(dash) => dash,
            None => return Ok(None),
        };

        let bound = |t: &str| -> Option<u64> {
            let digits = t.strip_prefix('I')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        };

        match (bound(&inner[..dash]), bound(&inner[dash + 1..])) {
            (Some(lo), Some(hi)) => {
                if lo > hi {
                    return Err(Error::BadArgument);
                }

                Ok(Some(SegmentPattern {
                    kind: SegmentKind::Range(lo, hi),
                }))
            }
            _ => Ok(None),
        }
    }

    /// The segment text when the pattern is a plain literal.
    pub fn as_literal(&self) -> Option<&str> {
        match &self.kind {
            SegmentKind::Literal(text) => Some(text),
            _ => None,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.kind {
            SegmentKind::Literal(text) => text == name,
            SegmentKind::Glob(toks) => {
                let chars: Vec<char> = name.chars().collect();
                glob_match(toks, &chars)
            }
            SegmentKind::Range(lo, hi) => match parse_auto_name(name) {
                Some(value) => value >= *lo && value <= *hi,
                None => false,
            },
        }
    }
}

/// Extracts the numeric value of an auto-generated name: an optional `I`
/// prefix followed by decimal digits.
fn parse_auto_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix('I').unwrap_or(name);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

fn tok_matches(tok: &Tok, c: char) -> bool {
    match tok {
        Tok::Literal(l) => *l == c,
        Tok::Any => true,
        Tok::Star => false,
        Tok::Class { negated, ranges } => {
            let hit = ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
            hit != *negated
        }
    }
}

/// Iterative glob matcher with single-star backtracking.
fn glob_match(toks: &[Tok], name: &[char]) -> bool {
    let mut t = 0;
    let mut n = 0;
    let mut star_t = usize::max_value();
    let mut star_n = 0;

    while n < name.len() {
        if t < toks.len() {
            if toks[t] == Tok::Star {
                star_t = t;
                star_n = n;
                t += 1;
                continue;
            }

            if tok_matches(&toks[t], name[n]) {
                t += 1;
                n += 1;
                continue;
            }
        }

        if star_t != usize::max_value() {
            star_n += 1;
            t = star_t + 1;
            n = star_n;
            continue;
        }

        return false;
    }

    while t < toks.len() && toks[t] == Tok::Star {
        t += 1;
    }

    t == toks.len()
}

/// A compiled multi-segment pattern. Matches are anchored: the candidate path
/// must have exactly as many segments as the pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<SegmentPattern>,
}

impl PathPattern {
    /// Compiles a slash-separated pattern. A leading `/` is accepted and
    /// ignored; patterns always describe absolute paths.
    pub fn compile(pattern: &str) -> Result<PathPattern> {
        let (_, parts) = split_path(pattern)?;

        if parts.is_empty() {
            return Err(Error::BadArgument);
        }

        let segments = parts
            .iter()
            .map(|part| SegmentPattern::compile(part))
            .collect::<Result<Vec<_>>>()?;

        Ok(PathPattern {
            raw: pattern.to_owned(),
            segments,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn segment(&self, depth: usize) -> Option<&SegmentPattern> {
        self.segments.get(depth)
    }

    /// Number of leading literal segments; the subscription walk starts below
    /// this fixed prefix instead of scanning the whole tree.
    pub fn fixed_prefix_len(&self) -> usize {
        self.segments
            .iter()
            .take_while(|s| s.as_literal().is_some())
            .count()
    }

    pub fn matches(&self, path: &[&str]) -> bool {
        self.segments.len() == path.len()
            && self
                .segments
                .iter()
                .zip(path.iter())
                .all(|(pattern, segment)| pattern.matches(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        let compiled = PathPattern::compile(pattern).unwrap();
        let (_, segments) = split_path(path).unwrap();

        compiled.matches(&segments)
    }

    #[test]
    fn test_star_anchors_at_segment_boundaries() {
        assert!(matches("a/*/c", "a/b/c"));
        assert!(!matches("a/*/c", "a/b/b/c"));
        assert!(!matches("a/*/c", "a/c"));
    }

    #[test]
    fn test_matching_is_idempotent() {
        let compiled = PathPattern::compile("a/*/c").unwrap();
        let path = ["a", "xyz", "c"];

        assert!(compiled.matches(&path));
        assert!(compiled.matches(&path));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(matches("node?", "node7"));
        assert!(!matches("node?", "node"));
        assert!(!matches("node?", "node77"));
    }

    #[test]
    fn test_star_within_segment() {
        assert!(matches("se*on", "session"));
        assert!(matches("*", "anything"));
        assert!(matches("a*b*c", "aXXbYYc"));
        assert!(!matches("a*b*c", "acb"));
    }

    #[test]
    fn test_character_classes() {
        assert!(matches("data[0-9]", "data5"));
        assert!(!matches("data[0-9]", "datax"));
        assert!(matches("data[^0-9]", "datax"));
        assert!(!matches("data[^0-9]", "data5"));
        assert!(matches("[abc]*", "cruft"));
    }

    #[test]
    fn test_numeric_range_segment() {
        assert!(matches("parent/[I3-I7]", "parent/I5"));
        assert!(matches("parent/[I3-I7]", "parent/I3"));
        assert!(matches("parent/[I3-I7]", "parent/3"));
        assert!(!matches("parent/[I3-I7]", "parent/I8"));
        assert!(!matches("parent/[I3-I7]", "parent/Ix"));
    }

    #[test]
    fn test_range_shape_is_exact() {
        // Only `[I<digits>-I<digits>]` escalates to a numeric range; other
        // bracket expressions stay character classes
        let range = SegmentPattern::compile("[I3-I7]").unwrap();
        assert!(range.matches("I5"));
        assert!(!range.matches("I35"));

        let class = SegmentPattern::compile("[I3-x]").unwrap();
        assert!(class.matches("I"));
        assert!(class.matches("x"));
        assert!(!class.matches("I5"));
    }

    #[test]
    fn test_dot_names_are_literals() {
        assert!(matches("a/./b", "a/./b"));
        assert!(!matches("a/../b", "a/x/b"));
    }

    #[test]
    fn test_bad_patterns_rejected() {
        assert_eq!(PathPattern::compile("a/[x/b").unwrap_err(), Error::BadArgument);
        assert_eq!(PathPattern::compile("a//b").unwrap_err(), Error::BadArgument);
        assert_eq!(PathPattern::compile("").unwrap_err(), Error::BadArgument);
        assert_eq!(SegmentPattern::compile("[I7-I3]").unwrap_err(), Error::BadArgument);
    }

    #[test]
    fn test_fixed_prefix() {
        let compiled = PathPattern::compile("/hosts/42/data/*").unwrap();

        assert_eq!(compiled.fixed_prefix_len(), 3);
        assert_eq!(PathPattern::compile("/*/*").unwrap().fixed_prefix_len(), 0);
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b").unwrap(), (true, vec!["a", "b"]));
        assert_eq!(split_path("a/b").unwrap(), (false, vec!["a", "b"]));
        assert_eq!(split_path("/").unwrap(), (true, vec![]));
        assert_eq!(split_path("").unwrap(), (false, vec![]));
        assert!(split_path("a//b").is_err());
    }
}
