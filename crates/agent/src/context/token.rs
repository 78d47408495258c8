//! Token estimation utilities.
//!
//! Character-class heuristic, no tokenizer dependency:
//!
//! | Class | chars / token |
//! |-------|---------------|
//! | Latin / ASCII | 4 |
//! | CJK (Han, Hangul, Hiragana, Katakana) | 1.5 |
//! | Emoji / pictographs | 1 |
//! | Everything else | 3 |
//!
//! Good enough to stay under a provider's context limit with the default
//! output reserve; not an exact count.

use reagent_core::message::{Message, Role};

/// Fixed framing cost (role name, delimiters) charged to every message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Latin,
    Cjk,
    Emoji,
    Other,
}

fn classify_char(c: char) -> CharClass {
    let cp = c as u32;
    match cp {
        0x0000..=0x024F => CharClass::Latin,
        // Hangul Jamo, Hangul compatibility Jamo, Hangul syllables
        0x1100..=0x11FF | 0x3130..=0x318F | 0xAC00..=0xD7AF => CharClass::Cjk,
        // Hiragana, Katakana, Katakana phonetic extensions
        0x3040..=0x309F | 0x30A0..=0x30FF | 0x31F0..=0x31FF => CharClass::Cjk,
        // CJK unified ideographs, extension A, compatibility, extension B+
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x20000..=0x2FA1F => CharClass::Cjk,
        // Misc symbols & dingbats, emoji blocks, variation selector, ZWJ
        0x2600..=0x27BF | 0x1F000..=0x1FAFF | 0xFE0F | 0x200D => CharClass::Emoji,
        _ => CharClass::Other,
    }
}

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let (mut latin, mut cjk, mut emoji, mut other) = (0usize, 0usize, 0usize, 0usize);
    for c in text.chars() {
        match classify_char(c) {
            CharClass::Latin => latin += 1,
            CharClass::Cjk => cjk += 1,
            CharClass::Emoji => emoji += 1,
            CharClass::Other => other += 1,
        }
    }

    let tokens = latin as f64 / 4.0 + cjk as f64 / 1.5 + emoji as f64 + other as f64 / 3.0;
    tokens.ceil() as usize
}

/// Estimate tokens for a single message including per-message overhead.
///
/// Assistant messages also pay for each requested tool call's name and
/// arguments; tool messages pay for their payload (the content).
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&message.content);
    if message.role == Role::Assistant {
        tokens += message
            .tool_calls
            .iter()
            .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments))
            .sum::<usize>();
    }
    tokens
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
