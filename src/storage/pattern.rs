//! Glob matching for `KEYS`.
//!
//! Patterns and keys are compared byte by byte.
//!
//! Supported syntax:
//! - `*` matches any run of characters, including none
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^abc]` match one character from (or outside) a set
//! - `\x` matches `x` literally

/// A compiled-once glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: impl AsRef<[u8]>) -> Self {
        Self {
            pattern: pattern.as_ref().to_vec(),
        }
    }

    /// Returns true if `text` matches the whole pattern.
    ///
    /// Iterative with single-star backtracking, so long keys cannot blow the
    /// stack.
    pub fn matches(&self, text: impl AsRef<[u8]>) -> bool {
        let pattern = &self.pattern[..];
        let text = text.as_ref();

        let (mut p, mut t) = (0, 0);
        // Position after the last `*` and the text index it is anchored at
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match pattern.get(p) {
                Some(b'*') => {
                    backtrack = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                Some(_) => {
                    if let Some(width) = match_one(&pattern[p..], text[t]) {
                        p += width;
                        t += 1;
                        continue;
                    }
                }
                None => {}
            }

            match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            }
        }

        pattern[p..].iter().all(|&c| c == b'*')
    }
}

/// Matches one text byte against the token at the start of `pattern`.
///
/// Returns the token's width in pattern bytes on success.
fn match_one(pattern: &[u8], c: u8) -> Option<usize> {
    match pattern[0] {
        b'?' => Some(1),
        b'\\' if pattern.len() > 1 => (pattern[1] == c).then_some(2),
        b'[' => match_class(pattern, c),
        literal => (literal == c).then_some(1),
    }
}

fn match_class(pattern: &[u8], c: u8) -> Option<usize> {
    let mut i = 1;
    let negate = pattern.get(1) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let (lo, hi) = (pattern[i].min(pattern[i + 2]), pattern[i].max(pattern[i + 2]));
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= pattern[i] == c;
            i += 1;
        }
    }

    // Unterminated class never matches
    if i >= pattern.len() {
        return None;
    }

    (matched != negate).then_some(i + 1)
}
