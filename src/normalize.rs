//! Panel count normalisation.
//!
//! ## Responsibility
//! Force a variable-length panel sequence to an exact target count and make
//! sure every panel has at least one line of dialogue.
//!
//! ## Guarantees
//! - `normalize(panels, n).len() == n` for any input length
//! - Longer input keeps its first `n` panels in order
//! - Shorter input is padded with `Supplementary` panels; the last appended
//!   panel is always a `Summary`
//! - Output indexes run `1..=n`
//!
//! ## NOT Responsible For
//! - Ranking panels by importance before truncating

use crate::{Language, Panel, PanelKind};

/// Pads or truncates panels for one topic.
#[derive(Debug, Clone)]
pub struct PanelNormalizer {
    topic: String,
    language: Language,
}

impl PanelNormalizer {
    /// Normalizer whose filler panels talk about `topic` in `language`.
    pub fn new(topic: impl Into<String>, language: Language) -> Self {
        Self {
            topic: topic.into(),
            language,
        }
    }

    /// Return exactly `target` panels, reindexed from 1.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn normalize(&self, panels: &[Panel], target: usize) -> Vec<Panel> {
        let mut out: Vec<Panel> = panels.iter().take(target).cloned().collect();

        let missing = target - out.len();
        for n in 1..=missing {
            out.push(if n == missing {
                self.summary_panel()
            } else {
                self.supplementary_panel(n)
            });
        }

        for (position, panel) in out.iter_mut().enumerate() {
            panel.index = position + 1;
        }
        out
    }

    /// Fill empty dialogue from the panel's narration, or from the topic.
    ///
    /// Blank lines are dropped first.
    pub fn backfill_dialogue(&self, panels: Vec<Panel>) -> Vec<Panel> {
        panels
            .into_iter()
            .map(|mut panel| {
                panel.dialogue.retain(|line| !line.trim().is_empty());
                if panel.dialogue.is_empty() {
                    let line = panel
                        .narration
                        .as_deref()
                        .map(str::trim)
                        .filter(|narration| !narration.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| self.topic_line());
                    panel.dialogue.push(line);
                }
                panel
            })
            .collect()
    }

    fn topic_line(&self) -> String {
        match self.language {
            Language::Chinese => format!("我们一起来学习{}吧！", self.topic),
            Language::English => format!("Let's learn about {} together!", self.topic),
        }
    }

    fn supplementary_panel(&self, n: usize) -> Panel {
        let (dialogue, narration) = match self.language {
            Language::Chinese => (
                format!("我们再来想一想{}。", self.topic),
                format!("复习时间{n}"),
            ),
            Language::English => (
                format!("Let's think about {} once more.", self.topic),
                format!("Review time {n}"),
            ),
        };
        Panel {
            index: 0,
            kind: PanelKind::Supplementary,
            image_description: format!(
                "A simple chalkboard sketch reviewing {}, part {n}",
                self.topic
            ),
            dialogue: vec![dialogue],
            narration: Some(narration),
        }
    }

    fn summary_panel(&self) -> Panel {
        let dialogue = match self.language {
            Language::Chinese => format!("今天我们学习了{}！", self.topic),
            Language::English => format!("Today we learned about {}!", self.topic),
        };
        Panel {
            index: 0,
            kind: PanelKind::Summary,
            image_description: format!(
                "Smiling children giving a thumbs up next to a summary of {}",
                self.topic
            ),
            dialogue: vec![dialogue],
            narration: None,
        }
    }
}
