//! Invite links carry a conversation id in their final path or fragment
//! segment as up to sixteen hex digits.

use flint::ConversationId;

const INVITE_BASE: &str = "https://wordgrab.net/#";

pub fn encode(conversation_id: ConversationId) -> String {
    format!("{}{:016x}", INVITE_BASE, conversation_id)
}

pub fn decode(url: &str) -> Option<ConversationId> {
    let tail = url.rsplit(|c| c == '#' || c == '/').next()?;

    if tail.is_empty() || tail.len() > 16 {
        return None;
    }

    u64::from_str_radix(tail, 16).ok()
}
