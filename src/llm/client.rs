use crate::config::Config;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use tracing::debug;

const MAX_REPLY_TOKENS: u32 = 300;

pub struct LlmClient {
    chat_client: Client<OpenAIConfig>,
    chat_model: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let mut chat_config = OpenAIConfig::new().with_api_key(&config.openai_api_key);
        if let Some(base) = &config.openai_base_url {
            chat_config = chat_config.with_api_base(base);
        }

        Self {
            chat_client: Client::with_config(chat_config),
            chat_model: config.openai_model.clone(),
        }
    }

    /// One system prompt followed by user turns.
    pub async fn reply(&self, system_prompt: &str, user_turns: &[String]) -> anyhow::Result<String> {
        let mut messages: Vec<ChatCompletionRequestMessage> =
            vec![ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into()];
        for turn in user_turns {
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.as_str())
                    .build()?
                    .into(),
            );
        }
        self.chat(messages).await
    }

    #[allow(deprecated)]
    pub async fn chat(&self, messages: Vec<ChatCompletionRequestMessage>) -> anyhow::Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .max_tokens(MAX_REPLY_TOKENS)
            .messages(messages)
            .build()?;

        let response = self.chat_client.chat().create(request).await?;
        debug!("LLM usage: {:?}", response.usage);

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}
