/// Segment-oriented wildcard matcher.
///
/// `?` matches one character and `*` matches zero or more characters, both
/// without crossing a separator. A segment consisting solely of `**` matches
/// zero or more whole segments. Empty segments are ignored, but a pattern and
/// a candidate only match when they agree on a leading separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntMatcher {
    separator: char,
}

impl AntMatcher {
    pub const fn new(separator: char) -> Self {
        Self { separator }
    }

    /// Matcher for URL paths (`/board/**`).
    pub const fn paths() -> Self {
        Self::new('/')
    }

    /// Matcher for host names (`*.shop.com`).
    pub const fn hosts() -> Self {
        Self::new('.')
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn matches(&self, pattern: &str, candidate: &str) -> bool {
        if pattern.starts_with(self.separator) != candidate.starts_with(self.separator) {
            return false;
        }

        let pattern_segments = self.segments(pattern);
        let candidate_segments = self.segments(candidate);

        if !match_segments(&pattern_segments, &candidate_segments) {
            return false;
        }

        // "/a/b/" only matches "/a/b/" unless the pattern ends in a recursive segment.
        match pattern_segments.last() {
            Some(&"**") => true,
            _ => pattern.ends_with(self.separator) == candidate.ends_with(self.separator),
        }
    }

    fn segments<'a>(&self, value: &'a str) -> Vec<&'a str> {
        value
            .split(self.separator)
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

impl Default for AntMatcher {
    fn default() -> Self {
        Self::paths()
    }
}

fn match_segments(pattern: &[&str], candidate: &[&str]) -> bool {
    match pattern.split_first() {
        None => candidate.is_empty(),
        Some((&"**", rest)) => {
            let rest = skip_recursive(rest);
            if rest.is_empty() {
                return true;
            }
            (0..=candidate.len()).any(|start| match_segments(rest, &candidate[start..]))
        }
        Some((segment, rest)) => match candidate.split_first() {
            Some((head, tail)) => match_segment(segment, head) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn skip_recursive<'a, 'b>(mut pattern: &'a [&'b str]) -> &'a [&'b str] {
    while let Some((&"**", rest)) = pattern.split_first() {
        pattern = rest;
    }
    pattern
}

/// Glob match of a single segment, `*` and `?` only.
fn match_segment(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = c;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Number of wildcard characters, used as the primary specificity key.
pub fn wildcard_count(pattern: &str) -> usize {
    pattern.chars().filter(|ch| matches!(ch, '*' | '?')).count()
}
