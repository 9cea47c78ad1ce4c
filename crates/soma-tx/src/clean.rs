//! Ordered pipeline of pure text transformations.
//!
//! A [`TextCleaner`] is a fixed sequence of `&str -> String` stages chosen
//! per source profile. Markup removal always precedes whitespace
//! normalization, and wiki stripping runs before HTML stripping when both
//! are selected: wiki stripping drops `<ref>` spans wholesale, while HTML
//! stripping keeps inner text, so running it first would leak citation
//! text into the output. Output is always NFC-normalized with no leading
//! or trailing whitespace.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// One cleaning stage. Stages are pure; ordering is enforced by the
/// constructors below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanStage {
    /// Strip HTML tags, drop script/style wholesale, decode entities.
    StripHtml,
    /// Strip wiki markup: internal links (keeping display text), templates
    /// (removed wholesale), section headers, `<ref>` spans, emphasis quotes.
    StripWikiMarkup,
    /// Collapse whitespace runs, trim, collapse 3+ newlines into one.
    NormalizeWhitespace,
}

pub struct TextCleaner {
    stages: Vec<CleanStage>,
}

impl TextCleaner {
    /// Whitespace normalization only, for already-plain sources.
    pub fn plain() -> Self {
        Self {
            stages: vec![CleanStage::NormalizeWhitespace],
        }
    }

    /// HTML profile: tag stripping then whitespace normalization.
    pub fn for_html() -> Self {
        Self {
            stages: vec![CleanStage::StripHtml, CleanStage::NormalizeWhitespace],
        }
    }

    /// MediaWiki profile. Wiki stripping must run first: it removes
    /// `<ref>...</ref>` spans including their content, whereas the HTML
    /// stage only unwraps tags and would strand the citation text.
    pub fn for_wiki() -> Self {
        Self {
            stages: vec![
                CleanStage::StripWikiMarkup,
                CleanStage::StripHtml,
                CleanStage::NormalizeWhitespace,
            ],
        }
    }

    pub fn stages(&self) -> &[CleanStage] {
        &self.stages
    }

    /// Run every stage in order; the result is NFC-normalized.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for stage in &self.stages {
            current = match stage {
                CleanStage::StripHtml => strip_html(&current),
                CleanStage::StripWikiMarkup => strip_wiki_markup(&current),
                CleanStage::NormalizeWhitespace => normalize_whitespace(&current),
            };
        }
        current.nfc().collect()
    }
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Remove HTML structure while preserving textual content.
pub fn strip_html(text: &str) -> String {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static COMMENT: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();

    let mut out = re(&SCRIPT, r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .replace_all(text, " ")
        .into_owned();
    out = re(&COMMENT, r"(?s)<!--.*?-->").replace_all(&out, " ").into_owned();
    // Tags become spaces so adjacent words do not glue together.
    out = re(&TAG, r"(?s)<[^>]+>").replace_all(&out, " ").into_owned();
    decode_entities(&out)
}

/// Decode named and numeric character references.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        // Entities are short; cap the lookahead window on a char boundary.
        let rest = &text[i..];
        let mut window = rest.len().min(32);
        while !rest.is_char_boundary(window) {
            window -= 1;
        }
        let end = match rest[..window].find(';') {
            Some(e) => e,
            None => {
                out.push(c);
                continue;
            }
        };
        let body = &rest[1..end];
        let decoded = match body {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            "ndash" => Some('\u{2013}'),
            "mdash" => Some('\u{2014}'),
            _ => {
                if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                } else if let Some(dec) = body.strip_prefix('#') {
                    dec.parse::<u32>().ok().and_then(char::from_u32)
                } else {
                    None
                }
            }
        };
        match decoded {
            Some(d) => {
                out.push(d);
                // Skip the consumed entity body.
                for _ in 0..end {
                    chars.next();
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Strip MediaWiki markup.
pub fn strip_wiki_markup(text: &str) -> String {
    static REF: OnceLock<Regex> = OnceLock::new();
    static TEMPLATE: OnceLock<Regex> = OnceLock::new();
    static FILE_LINK: OnceLock<Regex> = OnceLock::new();
    static PIPED_LINK: OnceLock<Regex> = OnceLock::new();
    static PLAIN_LINK: OnceLock<Regex> = OnceLock::new();
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static EXT_LINK_LABELED: OnceLock<Regex> = OnceLock::new();
    static EXT_LINK_BARE: OnceLock<Regex> = OnceLock::new();
    static EMPHASIS: OnceLock<Regex> = OnceLock::new();

    let mut out = re(&REF, r"(?is)<ref[^>/]*/>|<ref[^>]*>.*?</ref>")
        .replace_all(text, " ")
        .into_owned();

    // Templates nest; peel innermost-first until none remain.
    let template = re(&TEMPLATE, r"(?s)\{\{[^{}]*\}\}");
    loop {
        let next = template.replace_all(&out, " ").into_owned();
        if next == out {
            break;
        }
        out = next;
    }

    // Media links are dropped wholesale, before display-text extraction.
    out = re(&FILE_LINK, r"(?is)\[\[(?:file|image|faylka|sawir):[^\[\]]*\]\]")
        .replace_all(&out, " ")
        .into_owned();
    // [[target|display]] keeps the display text; [[target]] keeps the target.
    out = re(&PIPED_LINK, r"\[\[[^\[\]|]*\|([^\[\]]*)\]\]")
        .replace_all(&out, "$1")
        .into_owned();
    out = re(&PLAIN_LINK, r"\[\[([^\[\]|]*)\]\]")
        .replace_all(&out, "$1")
        .into_owned();
    out = re(&HEADER, r"(?m)^[^\S\n]*==+[^=\n]*==+[^\S\n]*$")
        .replace_all(&out, "")
        .into_owned();
    out = re(&EXT_LINK_LABELED, r"\[https?://[^\s\]]+\s+([^\]]+)\]")
        .replace_all(&out, "$1")
        .into_owned();
    out = re(&EXT_LINK_BARE, r"\[https?://[^\]]*\]")
        .replace_all(&out, " ")
        .into_owned();
    out = re(&EMPHASIS, r"'{2,}").replace_all(&out, "").into_owned();
    out
}

/// Collapse whitespace. Single newlines survive as paragraph structure;
/// runs of three or more collapse to one; every other whitespace run
/// becomes a single space; the result is trimmed.
pub fn normalize_whitespace(text: &str) -> String {
    static AROUND_NEWLINE: OnceLock<Regex> = OnceLock::new();
    static MANY_NEWLINES: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let out = re(&AROUND_NEWLINE, r"[^\S\n]*\n[^\S\n]*")
        .replace_all(&unified, "\n")
        .into_owned();
    let out = re(&MANY_NEWLINES, r"\n{3,}").replace_all(&out, "\n").into_owned();
    let out = re(&SPACES, r"[^\S\n]+").replace_all(&out, " ").into_owned();
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiki_links_and_templates() {
        let cleaner = TextCleaner::for_wiki();
        let input = "[[Soomaaliya|Somalia]] waa {{country}} [[Geeska Afrika]].";
        assert_eq!(cleaner.apply(input), "Somalia waa Geeska Afrika.");
    }

    #[test]
    fn nested_templates_are_removed_wholesale() {
        let out = strip_wiki_markup("a {{outer {{inner}} tail}} b");
        assert_eq!(normalize_whitespace(&out), "a b");
    }

    #[test]
    fn section_headers_and_refs_are_dropped() {
        let input = "== Taariikh ==\nMuqdisho<ref name=\"x\">BBC 2020</ref> waa magaalo.\n=== Qayb ===\nDhammaad.";
        let cleaned = TextCleaner::for_wiki().apply(input);
        // emptied header lines leave blank lines, which survive as
        // paragraph breaks (only 3+ newlines collapse)
        assert_eq!(cleaned, "Muqdisho waa magaalo.\n\nDhammaad.");
    }

    #[test]
    fn self_closing_ref_is_dropped() {
        let out = strip_wiki_markup("hore<ref name=\"a\"/> dambe");
        assert_eq!(normalize_whitespace(&out), "hore dambe");
    }

    #[test]
    fn html_tags_and_entities() {
        let cleaner = TextCleaner::for_html();
        let input = "<p>Wararka &amp; faallooyinka</p><script>var x=1;</script><b>maanta</b>";
        assert_eq!(cleaner.apply(input), "Wararka & faallooyinka maanta");
    }

    #[test]
    fn numeric_entities_decode() {
        assert_eq!(decode_entities("&#65;&#x62;&amp;"), "Ab&");
        // malformed references pass through untouched
        assert_eq!(decode_entities("a &unknown; b && c"), "a &unknown; b && c");
    }

    #[test]
    fn whitespace_collapses_and_trims() {
        assert_eq!(
            normalize_whitespace("  waa \t qoraal\u{00a0}dheer  "),
            "waa qoraal dheer"
        );
        assert_eq!(normalize_whitespace("a\n\n\n\nb"), "a\nb");
        assert_eq!(normalize_whitespace("a \n b"), "a\nb");
    }

    #[test]
    fn output_is_nfc() {
        // U+0065 U+0301 (decomposed) becomes U+00E9 under NFC
        let cleaned = TextCleaner::plain().apply("cafe\u{0301}");
        assert_eq!(cleaned, "caf\u{00e9}");
    }

    #[test]
    fn external_links_keep_labels() {
        let out = strip_wiki_markup("eeg [https://example.org bogga rasmiga] iyo [https://example.com]");
        assert_eq!(normalize_whitespace(&out), "eeg bogga rasmiga iyo");
    }

    #[test]
    fn emphasis_quotes_removed() {
        let out = strip_wiki_markup("'''Muqdisho''' waa ''caasimad''");
        assert_eq!(normalize_whitespace(&out), "Muqdisho waa caasimad");
    }
}
