//! Normalized string similarity in [0, 1].
//!
//! Three families: edit distance (Levenshtein), prefix-weighted
//! (Jaro-Winkler) and phonetic (Soundex-style codes). The raw metrics come
//! from `strsim`; this module bounds, folds and normalizes their inputs.
//! All functions are pure and bounded: inputs longer than
//! `SimilarityOptions::max_len` characters are rejected with
//! `ReconError::LengthExceeded` before any work is done.

use std::borrow::Cow;

use serde::Deserialize;

use crate::error::ReconError;

pub const DEFAULT_MAX_LEN: usize = 500;

const WINKLER_SCALE: f64 = 0.1;
const WINKLER_MAX_PREFIX: usize = 4;
const PHONETIC_CODE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SimilarityOptions {
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub case_sensitive: bool,
}

fn default_max_len() -> usize {
    DEFAULT_MAX_LEN
}

impl Default for SimilarityOptions {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_LEN,
            case_sensitive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlgorithm {
    Levenshtein,
    JaroWinkler,
    Phonetic,
}

impl TextAlgorithm {
    pub fn similarity(&self, a: &str, b: &str, opts: &SimilarityOptions) -> Result<f64, ReconError> {
        match self {
            Self::Levenshtein => levenshtein_similarity(a, b, opts),
            Self::JaroWinkler => jaro_winkler_similarity(a, b, opts),
            Self::Phonetic => phonetic_similarity(a, b, opts),
        }
    }
}

impl std::fmt::Display for TextAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Levenshtein => write!(f, "levenshtein"),
            Self::JaroWinkler => write!(f, "jaro_winkler"),
            Self::Phonetic => write!(f, "phonetic"),
        }
    }
}

/// Length-check and case-fold an input.
fn prepare<'a>(s: &'a str, opts: &SimilarityOptions) -> Result<Cow<'a, str>, ReconError> {
    let len = s.chars().count();
    if len > opts.max_len {
        return Err(ReconError::LengthExceeded { len, max: opts.max_len });
    }
    if opts.case_sensitive {
        Ok(Cow::Borrowed(s))
    } else {
        Ok(Cow::Owned(s.to_lowercase()))
    }
}

/// `1 - distance / max(|a|, |b|)` over characters; two empty strings are identical.
pub fn levenshtein_similarity(a: &str, b: &str, opts: &SimilarityOptions) -> Result<f64, ReconError> {
    let a = prepare(a, opts)?;
    let b = prepare(b, opts)?;
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return Ok(1.0);
    }
    Ok(1.0 - strsim::levenshtein(&a, &b) as f64 / longest as f64)
}

pub fn jaro_winkler_similarity(a: &str, b: &str, opts: &SimilarityOptions) -> Result<f64, ReconError> {
    let a = prepare(a, opts)?;
    let b = prepare(b, opts)?;
    if a == b {
        return Ok(1.0);
    }
    if a.is_empty() || b.is_empty() {
        return Ok(0.0);
    }

    // Greedy matching is order-sensitive; fix the order so sim(a,b) == sim(b,a).
    let (a, b) = if (a.chars().count(), &a) <= (b.chars().count(), &b) { (a, b) } else { (b, a) };

    let j = strsim::jaro(&a, &b);
    if j == 0.0 {
        return Ok(0.0);
    }
    let prefix = a
        .chars()
        .zip(b.chars())
        .take(WINKLER_MAX_PREFIX)
        .take_while(|(x, y)| x == y)
        .count();
    Ok((j + prefix as f64 * WINKLER_SCALE * (1.0 - j)).min(1.0))
}

// ---------------------------------------------------------------------------
// Phonetic
// ---------------------------------------------------------------------------

fn phonetic_class(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

/// Four-character Soundex-style code: first letter plus up to three digit
/// classes, zero padded. Non-ASCII-letters are ignored; no letters → "".
///
/// Adjacent letters of the same class collapse; H and W do not separate
/// them, vowels (and Y) do.
pub fn phonetic_code(s: &str) -> String {
    let mut letters = s
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase());

    let Some(first) = letters.next() else {
        return String::new();
    };

    let mut code = String::with_capacity(PHONETIC_CODE_LEN);
    code.push(first);
    let mut prev = phonetic_class(first);

    for c in letters {
        if code.len() >= PHONETIC_CODE_LEN {
            break;
        }
        match c {
            'H' | 'W' => continue,
            'A' | 'E' | 'I' | 'O' | 'U' | 'Y' => prev = None,
            _ => {
                let class = phonetic_class(c);
                if let Some(digit) = class {
                    if class != prev {
                        code.push(digit);
                    }
                }
                prev = class;
            }
        }
    }

    while code.len() < PHONETIC_CODE_LEN {
        code.push('0');
    }
    code
}

/// 1.0 when both inputs share a non-empty phonetic code, else 0.0.
/// Codes are case-insensitive regardless of `case_sensitive`.
pub fn phonetic_similarity(a: &str, b: &str, opts: &SimilarityOptions) -> Result<f64, ReconError> {
    prepare(a, opts)?;
    prepare(b, opts)?;
    let ca = phonetic_code(a);
    let cb = phonetic_code(b);
    Ok(if !ca.is_empty() && ca == cb { 1.0 } else { 0.0 })
}
