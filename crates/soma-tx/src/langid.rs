//! Heuristic language identification for Somali text.
//!
//! A deterministic scorer over stop-word frequency and character profile.
//! Somali orthography is Latin-script with characteristic long-vowel
//! digraphs (`aa`, `oo`, `ee`, `uu`, `ii`), the digraph consonants `dh`,
//! `sh`, `kh`, and heavy use of `c`, `x` and `q`. The scorer is intentionally
//! small: it gates obviously non-Somali text, it does not classify dialects.

use std::collections::HashSet;
use std::sync::OnceLock;

/// Function words and very high-frequency tokens of written Somali.
const SOMALI_STOPWORDS: &[&str] = &[
    "waa", "iyo", "oo", "ka", "ku", "la", "ee", "in", "uu", "ay", "si", "ama", "waxaa", "waxa",
    "wuxuu", "waxay", "aan", "aad", "kale", "badan", "sidoo", "ilaa", "laga", "loo", "kala",
    "isku", "soo", "dib", "hore", "markii", "hadda", "kasta", "dhex", "ugu", "kuwa", "kan",
    "tan", "inuu", "inay", "lagu", "looga", "noqday", "ahaa", "yahay", "tahay", "jiray",
    "jirta", "dalka", "dadka", "gobolka", "magaalada", "wadanka", "dowladda", "maalinta",
    "sanadka", "qof", "wax", "mid", "labo", "saddex", "halkaas", "sidaas", "haddii", "laakiin",
    "balse", "iyada", "isaga", "iyaga", "annaga", "idinka",
];

/// English function words, used only as a negative guard.
const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "and", "of", "to", "in", "is", "was", "for", "on", "with", "as", "by", "at", "from",
    "that", "this", "it", "are", "were", "be", "have", "has", "a", "an", "or", "over", "not",
    "but", "they", "their", "will", "would", "which",
];

const SOMALI_DIGRAPHS: &[&str] = &["aa", "oo", "ee", "uu", "ii", "dh", "sh", "kh"];

fn somali_stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| SOMALI_STOPWORDS.iter().copied().collect())
}

fn english_stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| ENGLISH_STOPWORDS.iter().copied().collect())
}

/// Identification result: ISO 639-1 tag (or `und`) plus a confidence
/// in `[0, 1]`. Deterministic for identical input.
pub fn identify(text: &str) -> (&'static str, f64) {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphabetic())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return ("und", 0.0);
    }

    let alphabetic: Vec<char> = lowered.chars().filter(|c| c.is_alphabetic()).collect();
    let latin = alphabetic.iter().filter(|c| c.is_ascii_alphabetic()).count();
    if (latin as f64) < alphabetic.len() as f64 * 0.5 {
        return ("und", 0.0);
    }

    let so_hits = tokens
        .iter()
        .filter(|t| somali_stopwords().contains(**t))
        .count();
    let en_hits = tokens
        .iter()
        .filter(|t| english_stopwords().contains(**t))
        .count();
    let so_ratio = so_hits as f64 / tokens.len() as f64;
    let en_ratio = en_hits as f64 / tokens.len() as f64;

    if en_ratio > so_ratio && en_ratio >= 0.1 {
        return ("en", (en_ratio * 3.0).min(1.0));
    }

    let digraph_hits: usize = SOMALI_DIGRAPHS
        .iter()
        .map(|d| lowered.matches(d).count())
        .sum();
    let single_hits = lowered.chars().filter(|c| matches!(c, 'c' | 'x' | 'q')).count();
    let char_score = if alphabetic.is_empty() {
        0.0
    } else {
        (digraph_hits as f64 + 0.5 * single_hits as f64) / alphabetic.len() as f64
    };

    let confidence = (0.6 * (so_ratio * 3.0).min(1.0) + 0.4 * (char_score * 5.0).min(1.0)).min(1.0);
    if confidence > 0.0 {
        ("so", confidence)
    } else {
        ("und", 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn somali_sentence_scores_high() {
        let (lang, conf) = identify("Soomaaliya waa waddan ku yaal Geeska Afrika.");
        assert_eq!(lang, "so");
        assert!(conf >= 0.5, "confidence {conf}");
    }

    #[test]
    fn english_sentence_is_rejected() {
        let (lang, conf) = identify("The quick brown fox jumps over the lazy dog.");
        assert_eq!(lang, "en");
        assert!(conf >= 0.3);
    }

    #[test]
    fn non_latin_script_is_unknown() {
        let (lang, conf) = identify("هذا نص باللغة العربية فقط");
        assert_eq!(lang, "und");
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn empty_and_numeric_text_is_unknown() {
        assert_eq!(identify("").0, "und");
        assert_eq!(identify("12345 67.89").0, "und");
    }

    #[test]
    fn identification_is_deterministic() {
        let text = "Muqdisho waa caasimadda Soomaaliya, waxayna ku taal xeebta Badweynta Hindiya.";
        assert_eq!(identify(text), identify(text));
        let (lang, conf) = identify(text);
        assert_eq!(lang, "so");
        assert!(conf > 0.3);
    }
}
