//! LLM summarizer seam used by compaction.

use async_trait::async_trait;

use cs_domain::error::Result;
use cs_domain::model::{Message, Role};

/// Text-in/text-out summarizer. Any model client can sit behind this.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn generate(&self, system_prompt: &str, text: &str) -> Result<String>;
}

#[async_trait]
impl<F> Summarizer for F
where
    F: Fn(&str, &str) -> Result<String> + Send + Sync,
{
    async fn generate(&self, system_prompt: &str, text: &str) -> Result<String> {
        self(system_prompt, text)
    }
}

pub(crate) fn system_prompt(max_tokens: usize) -> String {
    format!(
        "You are a conversation summarizer. Summarize the archived conversation \
         history below into at most {max_tokens} tokens, preserving:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Tool state and pending work\n\n\
         Be concise. Write in present tense. Omit greetings."
    )
}

const LONG_BODY: usize = 2000;
const HEAD_KEEP: usize = 1000;
const TAIL_KEEP: usize = 500;

/// Render messages as `Role: body` lines, eliding the middle of very long
/// bodies (tool output).
pub(crate) fn conversation_text<'a>(messages: impl IntoIterator<Item = &'a Message>) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
            Role::Chain => "Chain",
        };
        buf.push_str(label);
        buf.push_str(": ");
        let body = msg.body();
        if body.len() > LONG_BODY {
            let head = floor(body, HEAD_KEEP);
            let tail = ceil(body, body.len() - TAIL_KEEP);
            buf.push_str(&body[..head]);
            buf.push_str(" [...] ");
            buf.push_str(&body[tail..]);
        } else {
            buf.push_str(body);
        }
        buf.push('\n');
    }
    buf
}

fn floor(s: &str, mut i: usize) -> usize {
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil(s: &str, mut i: usize) -> usize {
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
