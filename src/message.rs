use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation handed to a function provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Chat-completions shaped JSON (`{"role": .., "content": ..}`).
    pub fn to_chat_json(&self) -> Value {
        json!({"role": self.role.as_str(), "content": self.content})
    }
}

/// The most recent user turn, which is the prompt the pipeline acts on.
pub fn latest_user_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.role == Role::User)
}

/// A worked example shown to the model before the real prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FewShotExample {
    pub prompt: String,
    /// Function the model is expected to call.
    pub function_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl FewShotExample {
    /// Expand into the user / assistant pair that precedes the real prompt.
    pub fn to_messages(&self) -> Vec<Message> {
        let call = json!({"function": self.function_name, "arguments": self.arguments});
        vec![Message::user(&self.prompt), Message::assistant(call.to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("hello");
        assert_eq!(msg.role(), Role::User);
        assert_eq!(msg.content(), "hello");
        assert_eq!(msg.to_chat_json(), json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn test_latest_user_message_skips_assistant_turns() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::assistant("another"),
        ];
        assert_eq!(latest_user_message(&messages).map(|m| m.content()), Some("second"));
        assert!(latest_user_message(&[Message::system("only system")]).is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg: Message = serde_json::from_value(json!({"role": "assistant", "content": "x"})).unwrap();
        assert_eq!(msg.role(), Role::Assistant);
    }

    #[test]
    fn test_few_shot_expands_to_pair() {
        let ex = FewShotExample {
            prompt: "weather in Paris".into(),
            function_name: "get_weather".into(),
            arguments: json!({"city": "Paris"}),
        };
        let msgs = ex.to_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role(), Role::User);
        assert!(msgs[1].content().contains("get_weather"));
    }
}
