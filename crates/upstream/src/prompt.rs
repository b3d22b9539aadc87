//! Flattening a conversation into the single prompt the upstream accepts.

use crate::{Message, Role};

/// How conversation roles are conveyed to a backend that takes one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleSimulation {
    /// Contents are concatenated without role markers.
    Disabled,
    /// Every message is prefixed with its role, ending with an open
    /// `Assistant:` turn.
    Enabled,
    /// Role markers only when the conversation has more than one message.
    #[default]
    Auto,
}

impl RoleSimulation {
    /// Map the numeric config level (0, 1, 2) onto a mode.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Disabled),
            1 => Some(Self::Enabled),
            2 => Some(Self::Auto),
            _ => None,
        }
    }

    fn applies_to(self, messages: &[Message]) -> bool {
        match self {
            Self::Disabled => false,
            Self::Enabled => true,
            Self::Auto => messages.len() > 1,
        }
    }
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Render `messages` as one prompt string according to `mode`.
pub fn render_prompt(messages: &[Message], mode: RoleSimulation) -> String {
    if !mode.applies_to(messages) {
        return messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    let mut prompt = messages
        .iter()
        .map(|m| format!("{}: {}", speaker(m.role), m.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    prompt.push_str("\n\nAssistant:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<Message> {
        vec![
            Message::new(Role::System, "Be brief."),
            Message::new(Role::User, "Hello"),
        ]
    }

    #[test]
    fn disabled_joins_contents() {
        let prompt = render_prompt(&conversation(), RoleSimulation::Disabled);
        assert_eq!(prompt, "Be brief.\n\nHello");
    }

    #[test]
    fn enabled_prefixes_roles_and_opens_assistant_turn() {
        let prompt = render_prompt(&conversation(), RoleSimulation::Enabled);
        assert_eq!(prompt, "System: Be brief.\n\nUser: Hello\n\nAssistant:");
    }

    #[test]
    fn auto_leaves_single_message_untouched() {
        let single = vec![Message::new(Role::User, "Hello")];
        assert_eq!(render_prompt(&single, RoleSimulation::Auto), "Hello");
    }

    #[test]
    fn auto_simulates_multi_turn_conversations() {
        let prompt = render_prompt(&conversation(), RoleSimulation::Auto);
        assert!(prompt.starts_with("System: Be brief."));
        assert!(prompt.ends_with("Assistant:"));
    }

    #[test]
    fn from_level_rejects_out_of_range() {
        assert_eq!(RoleSimulation::from_level(0), Some(RoleSimulation::Disabled));
        assert_eq!(RoleSimulation::from_level(1), Some(RoleSimulation::Enabled));
        assert_eq!(RoleSimulation::from_level(2), Some(RoleSimulation::Auto));
        assert_eq!(RoleSimulation::from_level(3), None);
    }
}
