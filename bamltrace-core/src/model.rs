use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A rendered prompt ready to be sent to a chat model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl PromptRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_json_roundtrip_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"assistant\""));
    }

    #[test]
    fn prompt_builders() {
        let p = PromptRequest::new(vec![ChatMessage::system("s"), ChatMessage::user("u")])
            .temperature(0.0);
        assert_eq!(p.messages[0].role, Role::System);
        assert_eq!(p.messages[1].content, "u");
        assert_eq!(p.temperature, Some(0.0));
        assert_eq!(p.max_output_tokens, None);
    }
}
