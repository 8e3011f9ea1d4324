//! Free-text listing locations to canonical cache keys.
//!
//! The pipeline is order sensitive: noise stripping runs before duplicate
//! collapsing so that removed noise can't leave a fresh duplicate behind
//! unprocessed, and the leading-preposition cut only looks at the very start.

use std::borrow::Borrow;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MIN_RAW_CHARS: usize = 3;

/// Marketing and property-type phrases, longest first so that e.g.
/// "preventa" is not reduced to "pre" by the shorter "venta".
const NOISE_PATTERNS: &[&str] = &[
    r"venta de casa en",
    r"casa en venta",
    r"en venta",
    r"preventa",
    r"venta",
    r"remate",
    r"oportunidad",
    r"fraccionamient[o0]",
    r"residencial",
    r"condominio",
    r"lotes?",
    r"terrenos?",
    r"departamentos?",
    r"casas?",
    r"\bnueva\b",
    r"\bnuevo\b",
];

static NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    NOISE_PATTERNS
        .iter()
        .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("noise pattern"))
        .collect()
});

static MACRO_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:quer[ée]taro|m[ée]xico|qro)\b").expect("region pattern"));

static LEADING_PREPOSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:en|de)\b\s*").expect("preposition pattern"));

static DISALLOWED_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9\s,áéíóúñ]").expect("charset pattern"));

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

static COMMA_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*,[\s,]*").expect("comma pattern"));

/// Canonical, normalized location used as the cache key.
///
/// An empty key means "nothing worth geocoding"; it is never looked up or
/// cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressKey(String);

impl AddressKey {
    /// Wraps a key that was normalized by an earlier run, e.g. when reading
    /// the resolution cache back from disk.
    pub(crate) fn from_cached(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AddressKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AddressKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Normalizes a raw listing location into its [`AddressKey`].
///
/// Total and pure. The cleaning pipeline is re-applied until it reaches a
/// fixpoint, so `normalize(normalize(x).as_str()) == normalize(x)` for every
/// input. After the first pass every further change removes at least one
/// character, which bounds the number of passes.
pub fn normalize(raw: &str) -> AddressKey {
    let mut current = normalize_once(raw);
    for _ in 0..=current.len() {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    AddressKey(current)
}

/// Same as [`normalize`] for locations that may be missing altogether.
pub fn normalize_opt(raw: Option<&str>) -> AddressKey {
    raw.map(normalize).unwrap_or_default()
}

fn normalize_once(raw: &str) -> String {
    if raw.chars().count() < MIN_RAW_CHARS {
        return String::new();
    }

    let mut cleaned = raw.to_lowercase();
    for pattern in NOISE.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned = MACRO_REGION.replace_all(&cleaned, "").into_owned();
    cleaned = collapse_repeats(&cleaned);
    cleaned = LEADING_PREPOSITION.replace(&cleaned, "").into_owned();
    cleaned = DISALLOWED_CHARS.replace_all(&cleaned, "").into_owned();
    cleaned = WHITESPACE_RUN
        .replace_all(&cleaned, " ")
        .trim()
        .to_string();
    cleaned = COMMA_RUN.replace_all(&cleaned, ", ").into_owned();
    cleaned
        .trim_matches(|c: char| c == ',' || c == ' ')
        .to_string()
}

/// Collapses `X X` / `X, X` into `X`, scanning left to right and preferring
/// the shortest phrase at each word boundary.
fn collapse_repeats(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while pos < chars.len() {
        match repeat_at(&chars, pos) {
            Some((phrase_end, match_end)) => {
                out.extend(&chars[pos..phrase_end]);
                pos = match_end;
            }
            None => {
                out.push(chars[pos]);
                pos += 1;
            }
        }
    }
    out
}

/// Returns `(phrase_end, match_end)` when a phrase starting at `start` is
/// immediately repeated after a run of separators. Phrases start on a word,
/// so separators alone never count as a repeat.
fn repeat_at(chars: &[char], start: usize) -> Option<(usize, usize)> {
    if !is_word_char(chars[start]) || !is_word_boundary(chars, start) {
        return None;
    }
    for phrase_end in start + 1..chars.len() {
        if chars[phrase_end - 1] == '\n' {
            return None;
        }
        let phrase = &chars[start..phrase_end];
        let max_separator = chars[phrase_end..]
            .iter()
            .take_while(|c| is_separator(**c))
            .count();
        for separator in (1..=max_separator).rev() {
            let repeat_start = phrase_end + separator;
            let repeat_end = repeat_start + phrase.len();
            if repeat_end <= chars.len()
                && &chars[repeat_start..repeat_end] == phrase
                && is_word_boundary(chars, repeat_end)
            {
                return Some((phrase_end, repeat_end));
            }
        }
    }
    None
}

fn is_word_boundary(chars: &[char], pos: usize) -> bool {
    let before = pos > 0 && is_word_char(chars[pos - 1]);
    let after = pos < chars.len() && is_word_char(chars[pos]);
    before != after
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}
