//! Vocabulary complexity adjustment by age tier.
//!
//! - Tier 1: full simplification map, then long text is cut to its first
//!   sentence
//! - Tier 2: smaller simplification map, no truncation
//! - Tiers 3 and 4: identity
//!
//! Chinese entries are substring replacements; English entries replace whole
//! words and keep the leading capital. No replacement value contains a key,
//! which keeps `adjust` idempotent.

use crate::safety::is_cjk;
use crate::{AgeTier, RawContent, RawPanel};

const ZH_COMMON: &[(&str, &str)] = &[("然而", "但是"), ("大约", "差不多"), ("获得", "拿到")];

const ZH_YOUNGEST: &[(&str, &str)] = &[
    ("复杂", "难"),
    ("理解", "明白"),
    ("因此", "所以"),
    ("计算", "数一数"),
    ("例如", "像"),
    ("立即", "马上"),
    ("观察", "看"),
];

const EN_COMMON: &[(&str, &str)] = &[
    ("approximately", "about"),
    ("utilize", "use"),
    ("consequently", "so"),
    ("numerous", "many"),
    ("sufficient", "enough"),
];

const EN_YOUNGEST: &[(&str, &str)] = &[
    ("therefore", "so"),
    ("however", "but"),
    ("demonstrate", "show"),
    ("calculate", "work out"),
    ("additional", "more"),
    ("observe", "see"),
];

const TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?'];

/// Deterministic text simplifier.
#[derive(Debug, Clone, Copy)]
pub struct ComplexityAdjuster {
    sentence_ceiling: usize,
}

impl Default for ComplexityAdjuster {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ComplexityAdjuster {
    /// Adjuster that cuts tier-1 text longer than `sentence_ceiling` chars.
    pub fn new(sentence_ceiling: usize) -> Self {
        Self { sentence_ceiling }
    }

    /// Simplify `text` for `tier`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn adjust(&self, text: &str, tier: AgeTier) -> String {
        match tier {
            AgeTier::Preschool => {
                let simplified = simplify(text, true);
                self.first_sentence(&simplified)
            }
            AgeTier::EarlyPrimary => simplify(text, false),
            AgeTier::UpperPrimary | AgeTier::Teen => text.to_string(),
        }
    }

    /// Adjust title, dialogue and narration. Image descriptions are left as
    /// written since they are read by the illustrator, not the child.
    pub fn adjust_content(&self, content: &RawContent, tier: AgeTier) -> RawContent {
        RawContent {
            title: self.adjust(&content.title, tier),
            panels: content
                .panels
                .iter()
                .map(|panel| RawPanel {
                    image_description: panel.image_description.clone(),
                    dialogue: panel
                        .dialogue
                        .iter()
                        .map(|line| self.adjust(line, tier))
                        .collect(),
                    narration: panel
                        .narration
                        .as_deref()
                        .map(|narration| self.adjust(narration, tier)),
                })
                .collect(),
        }
    }

    fn first_sentence(&self, text: &str) -> String {
        if text.chars().count() <= self.sentence_ceiling || text.trim().is_empty() {
            return text.to_string();
        }

        let chars: Vec<char> = text.chars().collect();
        let end = chars.iter().enumerate().position(|(i, &c)| {
            // "3.5" is not a sentence end
            TERMINATORS.contains(&c)
                && (c != '.' || chars.get(i + 1).map_or(true, |next| next.is_whitespace()))
        });

        match end {
            Some(end) => chars[..=end].iter().collect(),
            None => {
                let trimmed = text.trim_end();
                let terminator = if trimmed.chars().any(is_cjk) { '。' } else { '.' };
                format!("{trimmed}{terminator}")
            }
        }
    }
}

fn simplify(text: &str, youngest: bool) -> String {
    let mut out = text.to_string();
    let zh = ZH_COMMON
        .iter()
        .chain(ZH_YOUNGEST.iter().filter(|_| youngest));
    for (from, to) in zh {
        if out.contains(from) {
            out = out.replace(from, to);
        }
    }
    replace_words(&out, |word| {
        EN_COMMON
            .iter()
            .chain(EN_YOUNGEST.iter().filter(|_| youngest))
            .find(|(from, _)| word.eq_ignore_ascii_case(from))
            .map(|(_, to)| *to)
    })
}

/// Replace whole ASCII words, keeping a leading capital.
fn replace_words<'a>(text: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word_start: Option<usize> = None;

    let flush = |out: &mut String, word: &str| match lookup(word) {
        Some(replacement) => {
            if word.starts_with(|c: char| c.is_ascii_uppercase()) {
                let mut chars = replacement.chars();
                if let Some(first) = chars.next() {
                    out.push(first.to_ascii_uppercase());
                    out.push_str(chars.as_str());
                }
            } else {
                out.push_str(replacement);
            }
        }
        None => out.push_str(word),
    };

    for (i, c) in text.char_indices() {
        if c.is_ascii_alphabetic() {
            word_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = word_start.take() {
            flush(&mut out, &text[start..i]);
        }
        out.push(c);
    }
    if let Some(start) = word_start {
        flush(&mut out, &text[start..]);
    }
    out
}
