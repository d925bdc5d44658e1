//! Assembly of the injected system turn.
//!
//! The system turn carries the configured persona, the tool directory when
//! tools are offered, and any client-supplied reference sources rendered as
//! numbered blocks the model can cite.

use serde::Deserialize;

use fireflies_llm::ChatTurn;
use fireflies_tools::ToolSpec;
use fireflies_tools::html::truncate_chars;

/// A page the client already retrieved and wants the answer grounded on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContextSource {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

impl ContextSource {
    fn is_usable(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// All inputs for the system turn.
pub struct PromptInputs<'a> {
    pub system_prompt: &'a str,
    /// Tools offered on this run; empty when tools are off.
    pub tool_specs: &'a [ToolSpec],
    pub sources: &'a [ContextSource],
    /// Per-source character cap.
    pub source_char_cap: usize,
}

pub fn build_system_turn(inputs: &PromptInputs<'_>) -> ChatTurn {
    let mut prompt = inputs.system_prompt.trim().to_string();
    prompt.push_str(&build_tools_block(inputs.tool_specs));
    prompt.push_str(&build_sources_block(inputs.sources, inputs.source_char_cap));
    ChatTurn::system(prompt)
}

fn build_tools_block(tool_specs: &[ToolSpec]) -> String {
    if tool_specs.is_empty() {
        return String::new();
    }

    let list = tool_specs
        .iter()
        .map(|s| {
            let params = s
                .params
                .iter()
                .map(|p| {
                    format!(
                        "\"{}\"{}",
                        p.name,
                        if p.required { " *required" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("  \u{2022} {}: {} (params: {params})", s.name, s.description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "\n\nAVAILABLE TOOLS:\n\
         {list}\n\
         Call webSearch when the question needs current or external information, \
         then webFetch on the most relevant result URLs before answering. Base \
         factual claims on the tool results and say so when they do not cover the \
         question. Never write tool calls as raw JSON in your answer."
    )
}

fn build_sources_block(sources: &[ContextSource], char_cap: usize) -> String {
    let blocks = sources
        .iter()
        .filter(|s| s.is_usable())
        .enumerate()
        .map(|(i, s)| {
            let url = if s.url.trim().is_empty() { "(no url)" } else { s.url.trim() };
            format!("[{}] {url}\n{}", i + 1, truncate_chars(s.content.trim(), char_cap))
        })
        .collect::<Vec<_>>();

    if blocks.is_empty() {
        return String::new();
    }

    format!(
        "\n\nREFERENCE SOURCES:\n{}\n\n\
         Answer from the reference sources above and cite them by number, e.g. [1].",
        blocks.join("\n\n")
    )
}
