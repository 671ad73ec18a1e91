//! Keyword-driven content safety filter.
//!
//! ## Responsibility
//! Rewrite text that contains a configured unsafe keyword using a fixed
//! keyword → replacement map covering Chinese and English.
//!
//! ## Guarantees
//! - Deterministic: the same input always yields the same output
//! - Text free of keywords is returned byte-for-byte unchanged
//! - Filtered output never contains a configured keyword: if the single
//!   replacement pass leaves a keyword behind, the whole field becomes a
//!   canonical safe sentence instead of being rewritten again
//!
//! ## NOT Responsible For
//! - Semantic moderation. Matching is case-insensitive substring matching,
//!   so it is best-effort and can also rewrite innocent compounds.

use tracing::{debug, warn};

use crate::{metrics, Language, Panel, PanelKind, RawContent, RawPanel};

const CANONICAL_ZH: &str = "让我们一起快乐地学习吧！";
const CANONICAL_EN: &str = "Let's keep learning together!";
const FALLBACK_IMAGE: &str = "Two smiling friends reading a colorful book together";

const DEFAULT_RULES: &[(&str, &str)] = &[
    ("暴力", "友爱"),
    ("血腥", "鲜艳"),
    ("杀死", "帮助"),
    ("武器", "工具"),
    ("打架", "比赛"),
    ("恐怖", "神奇"),
    ("死亡", "离开"),
    ("毒品", "糖果"),
    ("violence", "kindness"),
    ("violent", "gentle"),
    ("bloody", "colorful"),
    ("weapon", "tool"),
    ("murder", "rescue"),
    ("horror", "wonder"),
    ("terror", "surprise"),
    ("drugs", "snacks"),
];

/// Result of filtering one text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Output text.
    pub text: String,
    /// Whether any rewrite happened.
    pub was_filtered: bool,
    /// Why the text was rewritten.
    pub reason: Option<String>,
    /// Whether the canonical sentence replaced the whole text.
    pub canonical: bool,
}

/// Title and panels after field-level filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredContent {
    /// Filtered content, same shape as the input.
    pub content: RawContent,
    /// Number of text fields that were rewritten.
    pub filtered_fields: usize,
    /// 0-based positions of panels replaced by the fallback panel.
    pub fallback_panels: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Rule {
    keyword: Vec<char>,
    keyword_text: String,
    replacement: String,
}

/// Keyword classifier plus deterministic replacement.
#[derive(Debug, Clone)]
pub struct SafetyFilter {
    rules: Vec<Rule>,
}

impl Default for SafetyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyFilter {
    /// Filter with the built-in Chinese and English map.
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.iter().copied())
    }

    /// Filter with a custom map.
    ///
    /// Keywords are matched case-insensitively. Rules whose keyword is empty
    /// are ignored. Rules whose keyword occurs in the canonical sentences or
    /// the fallback panel are dropped with a warning, so the fallback texts
    /// never contain a keyword.
    pub fn with_rules<K, R>(rules: impl IntoIterator<Item = (K, R)>) -> Self
    where
        K: AsRef<str>,
        R: Into<String>,
    {
        let rules = rules
            .into_iter()
            .filter(|(keyword, _)| !keyword.as_ref().is_empty())
            .map(|(keyword, replacement)| {
                let keyword_text = keyword.as_ref().to_lowercase();
                Rule {
                    keyword: keyword_text.chars().collect(),
                    keyword_text,
                    replacement: replacement.into(),
                }
            })
            .filter(|rule| {
                let clashes = occurs_in_fallback_text(&rule.keyword);
                if clashes {
                    warn!(
                        keyword = %rule.keyword_text,
                        "safety rule dropped: keyword occurs in fallback text"
                    );
                }
                !clashes
            })
            .collect();
        Self { rules }
    }

    /// Configured keywords, lower-cased.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.keyword_text.as_str())
    }

    /// Whether `text` contains any configured keyword.
    pub fn contains_unsafe(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        self.rules
            .iter()
            .any(|rule| find_ignore_case(&chars, &rule.keyword, 0).is_some())
    }

    /// Rule whose keyword occurs earliest in `chars`; longer keywords win ties.
    fn first_match(&self, chars: &[char]) -> Option<&Rule> {
        self.rules
            .iter()
            .filter_map(|rule| find_ignore_case(chars, &rule.keyword, 0).map(|pos| (pos, rule)))
            .min_by(|(a_pos, a), (b_pos, b)| {
                a_pos
                    .cmp(b_pos)
                    .then_with(|| b.keyword.len().cmp(&a.keyword.len()))
            })
            .map(|(_, rule)| rule)
    }

    /// Filter one text field.
    ///
    /// The earliest keyword is replaced everywhere it occurs. If any keyword
    /// is still present afterwards, the partial edit is discarded and the
    /// canonical sentence in the text's script is returned.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn filter(&self, text: &str) -> FilterOutcome {
        let chars: Vec<char> = text.chars().collect();
        let Some(rule) = self.first_match(&chars) else {
            return FilterOutcome {
                text: text.to_string(),
                was_filtered: false,
                reason: None,
                canonical: false,
            };
        };

        let replaced = replace_ignore_case(&chars, &rule.keyword, &rule.replacement);
        if self.contains_unsafe(&replaced) {
            debug!(keyword = %rule.keyword_text, "safety: residual keyword, using canonical text");
            return FilterOutcome {
                text: canonical_sentence(text).to_string(),
                was_filtered: true,
                reason: Some(format!(
                    "unsafe content remained after replacing '{}'",
                    rule.keyword_text
                )),
                canonical: true,
            };
        }

        FilterOutcome {
            text: replaced,
            was_filtered: true,
            reason: Some(format!(
                "replaced '{}' with '{}'",
                rule.keyword_text, rule.replacement
            )),
            canonical: false,
        }
    }

    /// Filter every field of one panel.
    ///
    /// Returns the filtered panel, the number of rewritten fields, and whether
    /// the panel stayed unsafe and must be replaced wholesale.
    pub fn filter_panel(&self, panel: &RawPanel) -> (RawPanel, usize, bool) {
        let mut filtered_fields = 0;
        let mut unsafe_panel = false;
        let mut apply = |text: &str, field: &'static str| {
            let outcome = self.filter(text);
            if outcome.was_filtered {
                filtered_fields += 1;
                metrics::inc_field_filtered(field);
            }
            unsafe_panel |= outcome.canonical;
            outcome.text
        };

        let image_description = apply(&panel.image_description, "image_description");
        let dialogue = panel
            .dialogue
            .iter()
            .map(|line| apply(line, "dialogue"))
            .collect();
        let narration = panel
            .narration
            .as_deref()
            .map(|narration| apply(narration, "narration"));

        let filtered = RawPanel {
            image_description,
            dialogue,
            narration,
        };
        let unsafe_panel = unsafe_panel || raw_panel_texts(&filtered).any(|t| self.contains_unsafe(t));
        (filtered, filtered_fields, unsafe_panel)
    }

    /// Filter the title and every panel of `content`.
    ///
    /// Panels that stay unsafe are replaced by [`fallback_panel`].
    pub fn filter_content(&self, content: &RawContent, language: Language) -> FilteredContent {
        let title = self.filter(&content.title);
        let mut filtered_fields = usize::from(title.was_filtered);
        if title.was_filtered {
            metrics::inc_field_filtered("title");
        }

        let mut fallback_panels = Vec::new();
        let panels = content
            .panels
            .iter()
            .enumerate()
            .map(|(position, panel)| {
                let (filtered, fields, unsafe_panel) = self.filter_panel(panel);
                filtered_fields += fields;
                if unsafe_panel {
                    fallback_panels.push(position);
                    fallback_panel(language)
                } else {
                    filtered
                }
            })
            .collect();

        FilteredContent {
            content: RawContent {
                title: title.text,
                panels,
            },
            filtered_fields,
            fallback_panels,
        }
    }

    /// Re-scan finished panels and repair any residual hit.
    ///
    /// Returns the repaired panels and the number of fields rewritten.
    pub fn sweep_panels(&self, panels: Vec<Panel>, language: Language) -> (Vec<Panel>, usize) {
        let mut rewritten = 0;
        let panels = panels
            .into_iter()
            .map(|panel| {
                if !panel.texts().any(|text| self.contains_unsafe(text)) {
                    return panel;
                }
                let raw = RawPanel {
                    image_description: panel.image_description.clone(),
                    dialogue: panel.dialogue.clone(),
                    narration: panel.narration.clone(),
                };
                let (filtered, fields, unsafe_panel) = self.filter_panel(&raw);
                rewritten += fields;
                if unsafe_panel {
                    Panel::from_raw(panel.index, PanelKind::SafetyFallback, &fallback_panel(language))
                } else {
                    Panel::from_raw(panel.index, panel.kind, &filtered)
                }
            })
            .collect();
        (panels, rewritten)
    }
}

/// Canonical safe panel substituted for content that stayed unsafe.
pub fn fallback_panel(language: Language) -> RawPanel {
    let line = match language {
        Language::Chinese => CANONICAL_ZH,
        Language::English => CANONICAL_EN,
    };
    RawPanel {
        image_description: FALLBACK_IMAGE.to_string(),
        dialogue: vec![line.to_string()],
        narration: None,
    }
}

fn canonical_sentence(original: &str) -> &'static str {
    if original.chars().any(is_cjk) {
        CANONICAL_ZH
    } else {
        CANONICAL_EN
    }
}

fn occurs_in_fallback_text(keyword: &[char]) -> bool {
    [CANONICAL_ZH, CANONICAL_EN, FALLBACK_IMAGE].iter().any(|text| {
        let chars: Vec<char> = text.chars().collect();
        find_ignore_case(&chars, keyword, 0).is_some()
    })
}

pub(crate) fn is_cjk(c: char) -> bool {
    matches!(c, '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{F900}'..='\u{FAFF}')
}

fn raw_panel_texts(panel: &RawPanel) -> impl Iterator<Item = &str> {
    std::iter::once(panel.image_description.as_str())
        .chain(panel.dialogue.iter().map(String::as_str))
        .chain(panel.narration.as_deref())
}

fn char_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn find_ignore_case(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&start| {
        haystack[start..start + needle.len()]
            .iter()
            .zip(needle)
            .all(|(&a, &b)| char_eq_ignore_case(a, b))
    })
}

fn replace_ignore_case(haystack: &[char], needle: &[char], replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(start) = find_ignore_case(haystack, needle, cursor) {
        out.extend(&haystack[cursor..start]);
        out.push_str(replacement);
        cursor = start + needle.len();
    }
    out.extend(&haystack[cursor..]);
    out
}
