//! Prompt assembly for RWKV chat models.
//!
//! RWKV world models are trained on a flat transcript layout:
//!
//! ```text
//! System: <instructions>
//!
//! User: <message>
//!
//! Assistant: <reply>
//!
//! User: <message>
//!
//! Assistant:
//! ```
//!
//! Callers hand the pipeline either a pre-formatted prompt string or a list
//! of [`PromptSegment`]s that get flattened into this layout.

use serde::{Deserialize, Serialize};

/// One piece of a structured prompt.
///
/// Either a role-tagged chat message or a raw text span spliced in
/// verbatim (few-shot scaffolding, continuation of a partial reply).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptSegment {
    Role { role: String, content: String },
    Raw { text: String },
}

impl PromptSegment {
    pub fn system(content: impl Into<String>) -> Self {
        PromptSegment::Role {
            role: "System".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        PromptSegment::Role {
            role: "User".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        PromptSegment::Role {
            role: "Assistant".into(),
            content: content.into(),
        }
    }

    pub fn raw(text: impl Into<String>) -> Self {
        PromptSegment::Raw { text: text.into() }
    }
}

/// Trim a message and collapse newline runs to a single newline.
///
/// Blank lines inside a message would read as a turn boundary in the flat
/// transcript layout.
pub fn clean_prompt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_newline_run = false;
    for ch in text.trim().chars() {
        if ch == '\n' {
            if !in_newline_run {
                out.push('\n');
                in_newline_run = true;
            }
        } else {
            out.push(ch);
            in_newline_run = false;
        }
    }
    out
}

/// Flatten segments into the model's transcript layout, ending with the
/// `Assistant:` cue the model completes from.
pub fn format_prompt(segments: &[PromptSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            PromptSegment::Role { role, content } => {
                out.push_str(role);
                out.push_str(": ");
                out.push_str(&clean_prompt(content));
                out.push_str("\n\n");
            }
            PromptSegment::Raw { text } => {
                out.push_str(text);
            }
        }
    }
    out.push_str("Assistant:");
    out
}
