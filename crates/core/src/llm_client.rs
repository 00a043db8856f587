use crate::{
    conversation::{ConversationTurn, ToolCallRequest},
    tools::ToolSpec,
};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolChoiceOption,
        ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 300;

/// What the dialogue engine answered for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialogueReply {
    /// Assistant text, if any. May accompany tool calls.
    pub content: Option<String>,
    /// Tool invocations to run before the next round, in the order listed.
    pub tool_calls: Vec<ToolCallRequest>,
}

impl DialogueReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A stateless request/response dialogue engine.
#[async_trait]
pub trait DialogueConnector: Send + Sync {
    /// Runs one completion over the full message list with the given tools
    /// available.
    async fn complete(
        &self,
        messages: &[ConversationTurn],
        tools: &[ToolSpec],
    ) -> Result<DialogueReply>;
}

/// An implementation of `DialogueConnector` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl DialogueConnector for OpenAICompatibleClient {
    async fn complete(
        &self,
        messages: &[ConversationTurn],
        tools: &[ToolSpec],
    ) -> Result<DialogueReply> {
        let request = build_request(&self.model, messages, tools)?;
        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let message = response
            .choices
            .into_iter()
            .next()
            .context("Dialogue response contained no choices")?
            .message;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                ToolCallRequest::from_raw(call.id, call.function.name, &call.function.arguments)
            })
            .collect();

        Ok(DialogueReply {
            content: message.content,
            tool_calls,
        })
    }
}

/// Builds the chat completion request for one dialogue round.
#[allow(deprecated)]
fn build_request(
    model: &str,
    messages: &[ConversationTurn],
    tools: &[ToolSpec],
) -> Result<CreateChatCompletionRequest> {
    let messages = messages
        .iter()
        .map(to_request_message)
        .collect::<Result<Vec<_>>>()?;
    let tools = tools.iter().map(to_tool).collect::<Result<Vec<_>>>()?;

    Ok(CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .tools(tools)
        .tool_choice(ChatCompletionToolChoiceOption::Auto)
        .temperature(TEMPERATURE)
        .max_tokens(MAX_TOKENS)
        .build()?)
}

/// Converts a conversation turn into the OpenAI chat message shape.
pub fn to_request_message(turn: &ConversationTurn) -> Result<ChatCompletionRequestMessage> {
    let message = match turn {
        ConversationTurn::System { content } => ChatCompletionRequestSystemMessageArgs::default()
            .content(content.clone())
            .build()?
            .into(),
        ConversationTurn::User { content } => ChatCompletionRequestUserMessageArgs::default()
            .content(content.clone())
            .build()?
            .into(),
        ConversationTurn::Assistant {
            content,
            tool_calls,
        } => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(content) = content {
                args.content(content.clone());
            }
            if !tool_calls.is_empty() {
                args.tool_calls(
                    tool_calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments_json(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            args.build()?.into()
        }
        ConversationTurn::Tool {
            tool_call_id,
            content,
        } => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(tool_call_id.clone())
            .content(content.clone())
            .build()?
            .into(),
    };
    Ok(message)
}

fn to_tool(spec: &ToolSpec) -> Result<ChatCompletionTool> {
    Ok(ChatCompletionToolArgs::default()
        .function(
            FunctionObjectArgs::default()
                .name(spec.name)
                .description(spec.description)
                .parameters(spec.parameters.clone())
                .build()?,
        )
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conversation::ToolResult, tools::tool_schema};
    use serde_json::{Map, json};

    #[test]
    fn test_assistant_tool_call_message() {
        let mut arguments = Map::new();
        arguments.insert("member_id".into(), json!("M1001"));
        let turn = ConversationTurn::assistant_tool_calls(
            None,
            vec![ToolCallRequest::new("call_1", "verify_member_id", arguments)],
        );
        let message = serde_json::to_value(to_request_message(&turn).unwrap()).unwrap();

        assert_eq!(message["role"], "assistant");
        assert_eq!(message["tool_calls"][0]["id"], "call_1");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "verify_member_id");
        assert_eq!(
            message["tool_calls"][0]["function"]["arguments"],
            r#"{"member_id":"M1001"}"#
        );
    }

    #[test]
    fn test_tool_result_message() {
        let turn = ConversationTurn::tool_result(&ToolResult {
            tool_call_id: "call_1".into(),
            payload: json!({"found": true}),
        });
        let message = serde_json::to_value(to_request_message(&turn).unwrap()).unwrap();
        assert_eq!(message["role"], "tool");
        assert_eq!(message["tool_call_id"], "call_1");
    }

    #[test]
    fn test_plain_turns_convert() {
        for (turn, role) in [
            (ConversationTurn::system("prompt"), "system"),
            (ConversationTurn::user("hi"), "user"),
            (ConversationTurn::assistant("hello"), "assistant"),
        ] {
            let message = serde_json::to_value(to_request_message(&turn).unwrap()).unwrap();
            assert_eq!(message["role"], role);
        }
    }

    #[test]
    fn test_every_tool_spec_converts() {
        let tools = tool_schema()
            .iter()
            .map(to_tool)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(tools.len(), 5);
        assert_eq!(tools[0].function.name, "verify_member_id");
    }

    #[test]
    fn test_request_caps_reply_length() {
        let turns = [ConversationTurn::system("prompt"), ConversationTurn::user("hi")];
        let request = build_request("gpt-4o-mini", &turns, tool_schema()).unwrap();
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 300);
        assert!(body.get("max_completion_tokens").is_none());
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["tools"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_reply_helpers() {
        assert!(!DialogueReply::text("hi").has_tool_calls());
        let reply = DialogueReply::tool_calls(vec![ToolCallRequest::new(
            "c1",
            "verify_member_id",
            Map::new(),
        )]);
        assert!(reply.has_tool_calls());
        assert_eq!(reply.content, None);
    }
}
