//! Enhanced prompt construction.
//!
//! Turns a validated topic and [`GenerationOptions`] into the system and user
//! messages sent to the generation endpoint. The user message pins down the
//! exact JSON shape the extractor in `gateway` expects.

use serde::Serialize;

use crate::{AgeTier, GenerationOptions, Language};

/// Messages for one generation call, plus the facts fallbacks need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    /// System message.
    pub system: String,
    /// User message.
    pub user: String,
    /// Topic the prompt was built from.
    pub topic: String,
    /// Requested panel count.
    pub panel_count: u8,
    /// Requested output language.
    pub language: Language,
}

const SYSTEM_PROMPT: &str = "You are an educational comic writer for children. \
You explain one concept per comic with a short, friendly story. \
You never include violence, fear, or adult themes. \
You answer with a single JSON object and nothing else.";

fn tier_guidance(tier: AgeTier) -> &'static str {
    match tier {
        AgeTier::Preschool => {
            "Use very short sentences of at most ten words and only everyday words. \
             One idea per panel."
        }
        AgeTier::EarlyPrimary => {
            "Use short sentences and simple words. Introduce at most one new term \
             and explain it with an example."
        }
        AgeTier::UpperPrimary => {
            "Use clear sentences. Subject terms are fine when each is explained \
             the first time it appears."
        }
        AgeTier::Teen => {
            "Use natural language with correct subject terminology and one \
             real-world application."
        }
    }
}

fn language_guidance(language: Language) -> &'static str {
    match language {
        Language::Chinese => "Write the title, dialogue and narration in Simplified Chinese.",
        Language::English => "Write the title, dialogue and narration in English.",
    }
}

/// Build the prompt for `topic` under `options`.
///
/// # Panics
///
/// This function never panics.
pub fn build_prompt(topic: &str, options: &GenerationOptions) -> Prompt {
    let topic = topic.trim();
    let user = format!(
        "Create a {count}-panel educational comic about \"{topic}\" for readers aged {ages}.\n\
         {tier}\n\
         {language}\n\
         Illustration style: {style}. Image descriptions are always written in English.\n\
         Every panel needs at least one line of dialogue.\n\
         The last panel sums up what the reader learned.\n\
         Respond with exactly this JSON shape:\n\
         {{\"title\": \"...\", \"panels\": [{{\"imageDescription\": \"...\", \
         \"dialogue\": [\"...\"], \"narration\": \"...\"}}]}}\n\
         The panels array must contain exactly {count} items.",
        count = options.panel_count,
        ages = options.age_tier.age_range(),
        tier = tier_guidance(options.age_tier),
        language = language_guidance(options.language),
        style = options.visual_style.description(),
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        topic: topic.to_string(),
        panel_count: options.panel_count,
        language: options.language,
    }
}
