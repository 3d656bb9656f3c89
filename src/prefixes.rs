use crate::prelude::*;
use std::collections::HashMap;

// URI prefix compression support for the resource hash. Two pieces:
//
// - PrefixDict: the installed dictionary, a code (its insertion index) per
//   prefix, persisted by the resource hash in its sibling prefix list. At
//   most 256 codes ever, so lookup is a scan.
// - PrefixFinder: discovery. Counts candidate prefixes of the URIs that
//   spill to the lex file; when its candidate table fills up the resource
//   hash harvests the best-scoring prefixes into the dictionary and starts
//   a fresh finder.

/// Dictionary capacity; codes are single bytes in the packed entries.
pub const MAX_PREFIXES: usize = 256;

/// Longest installable prefix: the persisted record stores the prefix
/// NUL-terminated in 508 bytes.
pub const MAX_PREFIX_LEN: usize = 507;

const MAX_CANDIDATES: usize = 256;

#[derive(Debug, Default)]
pub struct PrefixDict {
    codes: Vec<String>,
}

impl PrefixDict {
    pub fn new() -> PrefixDict {
        PrefixDict::default()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.codes.len() >= MAX_PREFIXES
    }

    pub fn get(&self, code: u8) -> Option<&str> {
        self.codes.get(code as usize).map(|s| s.as_str())
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.codes.iter().any(|p| p == prefix)
    }

    /// Install a prefix under the next free code. Returns the code, or
    /// None when the dictionary is full.
    pub fn push(&mut self, prefix: String) -> Option<u8> {
        if self.is_full() {
            return None;
        }
        self.codes.push(prefix);
        Some((self.codes.len() - 1) as u8)
    }

    /// Install a prefix under an explicit code, as read back from the
    /// prefix list. Records are written in code order, so anything else is
    /// a damaged file.
    pub fn set(&mut self, code: u32, prefix: String) {
        if code as usize != self.codes.len() {
            warn!(
                "prefix code {} arrived out of order (expected {})",
                code,
                self.codes.len()
            );
            while self.codes.len() < code as usize {
                self.codes.push(String::new());
            }
        }
        self.codes.push(prefix);
    }

    /// Longest installed prefix of `lex`, if any. Empty prefixes (from
    /// damaged files) never match.
    pub fn longest_match(&self, lex: &str) -> Option<(u8, usize)> {
        let mut best: Option<(u8, usize)> = None;
        for (code, p) in self.codes.iter().enumerate() {
            if p.is_empty() || !lex.starts_with(p.as_str()) {
                continue;
            }
            if best.map_or(true, |(_, len)| p.len() > len) {
                best = Some((code as u8, p.len()));
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredPrefix {
    pub prefix: String,
    pub score: u64,
}

#[derive(Debug, Default)]
pub struct PrefixFinder {
    counts: HashMap<String, u64>,
}

impl PrefixFinder {
    pub fn new() -> PrefixFinder {
        PrefixFinder::default()
    }

    /// Record one URI. Returns false when the candidate table is full and
    /// the caller should harvest [`PrefixFinder::top`] and start over.
    pub fn note(&mut self, lex: &str) -> bool {
        let Some(prefix) = candidate(lex) else {
            // nothing to learn from this one
            return true;
        };
        if let Some(n) = self.counts.get_mut(prefix) {
            *n += 1;
            return true;
        }
        if self.counts.len() >= MAX_CANDIDATES {
            return false;
        }
        self.counts.insert(prefix.to_owned(), 1);
        true
    }

    /// The best-scoring candidates, at most `n`, best first. Score rewards
    /// both frequency and length: a long prefix shared by many URIs saves
    /// the most bytes.
    pub fn top(&self, n: usize) -> Vec<ScoredPrefix> {
        let mut scored: Vec<ScoredPrefix> = self
            .counts
            .iter()
            .map(|(p, &hits)| ScoredPrefix {
                prefix: p.clone(),
                score: hits * p.len() as u64,
            })
            .collect();
        scored.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.prefix.cmp(&b.prefix)));
        scored.truncate(n);
        scored
    }
}

// The candidate prefix of a URI: everything up to and including the last
// '/' or '#' past the scheme separator. A URI that is all prefix (ends in
// the separator) contributes nothing.
fn candidate(lex: &str) -> Option<&str> {
    let scheme_end = lex.find("://")? + 3;
    let rest = &lex[scheme_end..];
    let cut = rest.rfind(|c| c == '/' || c == '#')?;
    let prefix = &lex[..scheme_end + cut + 1];
    if prefix.len() > MAX_PREFIX_LEN || prefix.len() == lex.len() {
        return None;
    }
    Some(prefix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn candidates() {
        assert_eq!(
            candidate("http://example.org/ns/Thing"),
            Some("http://example.org/ns/")
        );
        assert_eq!(
            candidate("http://example.org/ns#Thing"),
            Some("http://example.org/ns#")
        );
        assert_eq!(candidate("http://example.org/"), None);
        assert_eq!(candidate("urn:isbn:0451450523"), None);
        assert_eq!(candidate("not a uri"), None);
    }

    #[test]
    fn dict_longest_match() {
        let mut d = PrefixDict::new();
        let short = d.push("http://example.org/".to_owned()).unwrap();
        let long = d.push("http://example.org/ns/".to_owned()).unwrap();
        assert_eq!(short, 0);
        assert_eq!(long, 1);

        assert_eq!(
            d.longest_match("http://example.org/ns/Thing"),
            Some((long, "http://example.org/ns/".len()))
        );
        assert_eq!(
            d.longest_match("http://example.org/other"),
            Some((short, "http://example.org/".len()))
        );
        assert_eq!(d.longest_match("https://elsewhere.net/x"), None);
    }

    #[test]
    fn dict_fills_up() {
        let mut d = PrefixDict::new();
        for i in 0..MAX_PREFIXES {
            assert_eq!(
                d.push(format!("http://site{i}.example/")),
                Some(i as u8)
            );
        }
        assert!(d.is_full());
        assert_eq!(d.push("http://one.more/".to_owned()), None);
    }

    #[test]
    fn finder_scores_frequency_and_length() {
        let mut f = PrefixFinder::new();
        for i in 0..10 {
            assert!(f.note(&format!("http://popular.example/vocab/term{i}")));
        }
        assert!(f.note("http://rare.example/x/y"));

        let top = f.top(2);
        assert_eq!(top[0].prefix, "http://popular.example/vocab/");
        assert_eq!(top[0].score, 10 * "http://popular.example/vocab/".len() as u64);
    }

    #[test]
    fn finder_reports_full() {
        let mut f = PrefixFinder::new();
        for i in 0..MAX_CANDIDATES {
            assert!(f.note(&format!("http://site{i:04}.example/path/x")));
        }
        // existing candidates still count
        assert!(f.note("http://site0000.example/path/y"));
        // a new one doesn't fit
        assert!(!f.note("http://overflow.example/path/x"));
    }
}
