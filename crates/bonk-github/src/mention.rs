//! Trigger detection and prompt extraction for mention comments.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MENTION_TRIGGER: &str = "@ask-bonk";
pub const DEFAULT_COMMAND_TRIGGER: &str = "/bonk";
pub const REVIEW_DEFAULT_PROMPT: &str = "Review the commented lines.";
pub const THREAD_DEFAULT_PROMPT: &str = "Summarize this thread.";

/// Code location a review comment was left on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewContext {
    pub path: String,
    pub line: Option<u64>,
    pub diff_hunk: Option<String>,
}

impl ReviewContext {
    pub fn render_block(&self) -> String {
        let mut block = format!("File: `{}`\n", self.path);
        if let Some(line) = self.line {
            block.push_str(&format!("Line: {line}\n"));
        }
        if let Some(hunk) = self
            .diff_hunk
            .as_deref()
            .map(str::trim_end)
            .filter(|hunk| !hunk.is_empty())
        {
            block.push_str("```diff\n");
            block.push_str(hunk);
            block.push_str("\n```\n");
        }
        block
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionTriggers {
    pub mention: String,
    pub command: String,
}

impl Default for MentionTriggers {
    fn default() -> Self {
        Self {
            mention: DEFAULT_MENTION_TRIGGER.to_string(),
            command: DEFAULT_COMMAND_TRIGGER.to_string(),
        }
    }
}

impl MentionTriggers {
    fn is_trigger(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(self.mention.trim())
            || token.eq_ignore_ascii_case(self.command.trim())
    }

    /// True when either trigger appears as a whitespace-delimited word.
    ///
    /// `xxx@ask-bonkxxx` or `me@ask-bonk.dev` never match.
    pub fn has_mention(&self, text: &str) -> bool {
        text.split_whitespace().any(|token| self.is_trigger(token))
    }

    /// True when the whole comment is just a trigger with nothing else.
    pub fn is_bare_trigger(&self, text: &str) -> bool {
        self.is_trigger(text.trim())
    }

    /// Builds the instruction handed to the coding agent.
    pub fn extract_prompt(&self, text: &str, review: Option<&ReviewContext>) -> String {
        let trimmed = text.trim();
        if self.is_bare_trigger(trimmed) {
            return match review {
                Some(context) => format!("{}\n{REVIEW_DEFAULT_PROMPT}", context.render_block()),
                None => THREAD_DEFAULT_PROMPT.to_string(),
            };
        }
        match review {
            Some(context) => format!("{}\n{trimmed}", context.render_block()),
            None => trimmed.to_string(),
        }
    }
}
