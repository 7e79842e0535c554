use aho_corasick::AhoCorasick;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;

pub const REDACTION: &str = "*###*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveMatch {
    /// Byte offset into the scanned (original) text.
    pub start: usize,
    pub end: usize,
    pub word: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redaction {
    pub matched: bool,
    pub words: Vec<String>,
    pub text: String,
}

/// Immutable multi-pattern matcher over a lower-cased phrase list.
#[derive(Debug, Default)]
pub struct SensitiveFilter {
    words: Vec<String>,
    matcher: Option<AhoCorasick>,
}

impl SensitiveFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = normalize_words(words);
        if words.is_empty() {
            return Self::default();
        }
        match AhoCorasick::new(&words) {
            Ok(matcher) => Self {
                words,
                matcher: Some(matcher),
            },
            Err(err) => {
                tracing::warn!("failed to build sensitive word matcher: {err}");
                Self {
                    words,
                    matcher: None,
                }
            }
        }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    /// All matches in `text`, overlapping ones included, ordered by start.
    pub fn find_matches(&self, text: &str) -> Vec<SensitiveMatch> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };
        if text.is_empty() {
            return Vec::new();
        }
        let (lowered, origin) = lowercase_with_origin(text);
        let mut matches: Vec<SensitiveMatch> = matcher
            .find_overlapping_iter(&lowered)
            .map(|m| {
                let start = origin[m.start()];
                let last = origin[m.end() - 1];
                let end = last + text[last..].chars().next().map_or(0, char::len_utf8);
                SensitiveMatch {
                    start,
                    end,
                    word: self.words[m.pattern().as_usize()].clone(),
                }
            })
            .collect();
        matches.sort_by_key(|m| (m.start, m.end));
        matches
    }

    pub fn contains(&self, text: &str) -> (bool, Vec<String>) {
        let words = distinct_words(&self.find_matches(text));
        (!words.is_empty(), words)
    }

    /// Replaces every match with [`REDACTION`] in one pass over the original
    /// text. Overlapping matches collapse into a single replacement.
    pub fn redact(&self, text: &str) -> Redaction {
        let matches = self.find_matches(text);
        if matches.is_empty() {
            return Redaction {
                matched: false,
                words: Vec::new(),
                text: text.to_string(),
            };
        }

        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(matches.len());
        for m in &matches {
            match spans.last_mut() {
                Some((_, end)) if m.start < *end => *end = (*end).max(m.end),
                _ => spans.push((m.start, m.end)),
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in spans {
            out.push_str(&text[cursor..start]);
            out.push_str(REDACTION);
            cursor = end;
        }
        out.push_str(&text[cursor..]);

        Redaction {
            matched: true,
            words: distinct_words(&matches),
            text: out,
        }
    }
}

/// Process-wide filter snapshot. Readers take the current `Arc`; the matcher
/// is rebuilt only when the phrase list actually changes.
pub struct SensitiveWords {
    current: ArcSwap<SensitiveFilter>,
}

impl SensitiveWords {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            current: ArcSwap::from_pointee(SensitiveFilter::new(words)),
        }
    }

    pub fn load(&self) -> Arc<SensitiveFilter> {
        self.current.load_full()
    }

    /// Returns true when a new matcher was installed.
    pub fn update<I, S>(&self, words: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = normalize_words(words);
        if self.current.load().words() == normalized.as_slice() {
            return false;
        }
        tracing::info!(words = normalized.len(), "rebuilding sensitive word matcher");
        self.current.store(Arc::new(SensitiveFilter::new(normalized)));
        true
    }
}

fn normalize_words<I, S>(words: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    words
        .into_iter()
        .map(|w| w.as_ref().trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn distinct_words(matches: &[SensitiveMatch]) -> Vec<String> {
    let mut seen = HashSet::new();
    matches
        .iter()
        .filter(|m| seen.insert(m.word.as_str()))
        .map(|m| m.word.clone())
        .collect()
}

/// Lower-cases `text` and records, for every byte of the result, the offset of
/// the original character it came from. Some characters change byte length
/// when lower-cased, so offsets cannot be shared directly.
fn lowercase_with_origin(text: &str) -> (String, Vec<usize>) {
    let mut lowered = String::with_capacity(text.len());
    let mut origin = Vec::with_capacity(text.len());
    for (idx, ch) in text.char_indices() {
        for lower in ch.to_lowercase() {
            let before = lowered.len();
            lowered.push(lower);
            origin.extend(std::iter::repeat_n(idx, lowered.len() - before));
        }
    }
    (lowered, origin)
}
