use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{LlmClient, LlmError, VisionClient};

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Blocking client for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenRouter, a local llama.cpp / vLLM server, ...).
pub struct OpenRouterClient {
    base_url: String,
    api_key: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    temperature: f32,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            timeout_secs,
            temperature: 0.1,
            max_tokens: 16_384,
        })
    }

    /// Sampling temperature for every request made by this client.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::Connection(self.base_url.clone())
                } else if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("Completion has no content".into()))
    }
}

/// Request body for `/chat/completions`
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

/// Response body from `/chat/completions`
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmClient for OpenRouterClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(system),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Text(prompt),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        self.complete(&request)
    }
}

impl VisionClient for OpenRouterClient {
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, LlmError> {
        let mut parts = vec![ContentPart::Text { text: prompt }];
        parts.extend(images.iter().map(|b64| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/jpeg;base64,{b64}"),
            },
        }));

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: MessageContent::Text(system),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: MessageContent::Parts(parts),
        });

        let request = ChatRequest {
            model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        self.complete(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_constructor() {
        let client = OpenRouterClient::new("https://openrouter.ai/api/v1", "key", 120).unwrap();
        assert_eq!(client.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(client.timeout_secs, 120);
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = OpenRouterClient::new("http://localhost:8080/v1/", "key", 60).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn temperature_is_clamped() {
        let client = OpenRouterClient::new(DEFAULT_BASE_URL, "key", 60)
            .unwrap()
            .with_temperature(5.0);
        assert!((client.temperature - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn vision_request_serializes_image_parts() {
        let request = ChatRequest {
            model: "vision-model",
            messages: vec![ChatMessage {
                role: "user",
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: "Extract" },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/jpeg;base64,AAAA".into(),
                        },
                    },
                ]),
            }],
            temperature: 0.5,
            max_tokens: 10,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"image_url\""));
        assert!(json.contains("\"url\":\"data:image/jpeg;base64,AAAA\""));
        assert!(json.contains("\"type\":\"text\",\"text\":\"Extract\""));
    }

    #[test]
    fn text_request_serializes_plain_content() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "system",
                content: MessageContent::Text("be brief"),
            }],
            temperature: 0.1,
            max_tokens: 10,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"content\":\"be brief\""));
    }

    #[test]
    fn response_without_content_is_none() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
