use serde::{Deserialize, Serialize};

/// A chat message exchanged with the language model.
///
/// Messages carry a role (typically "user", "assistant", or "system") and
/// text content. They appear on items under the `messages` field and in the
/// persisted round transcript.
///
/// # Examples
///
/// ```
/// use taleloom::message::ChatMessage;
///
/// let msg = ChatMessage::user("enter the tavern");
/// assert_eq!(msg.role, ChatMessage::USER);
///
/// // (role, content) tuples convert directly
/// let sys: ChatMessage = (ChatMessage::SYSTEM, "[world_state]").into();
/// assert_eq!(sys.role, "system");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender.
    pub role: String,
    /// The text content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Player input message role.
    pub const USER: &'static str = "user";
    /// Model response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt message role.
    pub const SYSTEM: &'static str = "system";

    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

impl From<(&str, &str)> for ChatMessage {
    fn from((role, content): (&str, &str)) -> Self {
        Self::new(role, content)
    }
}

impl std::fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// Deserializes a loose JSON message list, keeping only `role`/`content`.
///
/// Items coming off the bus may carry extra fields on their message objects;
/// persistence and the adapter only ever see the sanitized pair.
#[must_use]
pub fn sanitize_messages(value: &serde_json::Value) -> Vec<ChatMessage> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            let role = obj.get("role")?.as_str()?.to_string();
            let content = obj
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ChatMessage { role, content })
        })
        .collect()
}
