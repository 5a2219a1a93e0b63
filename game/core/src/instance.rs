use crate::dialog::Dialog;
use flint::{ConversationId, PersonId};

/// Which identity, if either, the checkpoint carries. A person id reclaims
/// a seat; a conversation id joins a specific game; the two are mutually
/// exclusive.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateId {
    None,
    Person(PersonId),
    Conversation(ConversationId),
}

/// The textual checkpoint a host may persist across process restarts. The
/// format is a comma-separated `key=value` list; unknown keys are ignored
/// so older checkpoints keep loading.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstanceState {
    pub id: StateId,
    pub dialog: Dialog,
    pub page: u32,
}

impl InstanceState {
    pub fn new() -> InstanceState {
        InstanceState {
            id: StateId::None,
            dialog: Dialog::Name,
            page: 0,
        }
    }

    pub fn save(&self) -> String {
        let mut parts = Vec::new();

        match self.id {
            StateId::Person(id) => parts.push(format!("person_id={:016x}", id)),
            StateId::Conversation(id) => parts.push(format!("conversation_id={:016x}", id)),
            StateId::None => (),
        }

        parts.push(format!("dialog={}", self.dialog.to_name()));

        if self.page != 0 {
            parts.push(format!("page={}", self.page));
        }

        parts.join(",")
    }

    pub fn load(&mut self, source: &str) {
        *self = InstanceState::new();

        for pair in source.split(',') {
            let mut halves = pair.splitn(2, '=');

            let key = match halves.next() {
                Some(key) => key,
                None => continue,
            };
            let value = match halves.next() {
                Some(value) => value,
                None => continue,
            };

            match key {
                "person_id" => {
                    if let Ok(id) = u64::from_str_radix(value, 16) {
                        self.id = StateId::Person(id);
                    }
                }
                "conversation_id" => {
                    if let Ok(id) = u64::from_str_radix(value, 16) {
                        self.id = StateId::Conversation(id);
                    }
                }
                "dialog" => {
                    if let Some(dialog) = Dialog::from_name(value) {
                        self.dialog = dialog;
                    }
                }
                "page" => {
                    if let Ok(page) = value.parse() {
                        self.page = page;
                    }
                }
                _ => (),
            }
        }
    }
}
