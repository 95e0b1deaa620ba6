use crate::OPENAI_API_BASE;
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: String,
}

// The `Evaluator` trait is the seam between the quiz session and whatever
// grades an answer. The session only needs the raw feedback text back; the
// numeric score is pulled out of it separately by `score::parse_score`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Grades `answer` against `question` and returns the evaluator's
    /// feedback, which is expected to contain a `Score: N/10` line.
    async fn evaluate(&self, question: &str, answer: &str) -> Result<String>;
}

pub struct EvaluatorClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl EvaluatorClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, OPENAI_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Evaluator for EvaluatorClient {
    async fn evaluate(&self, question: &str, answer: &str) -> Result<String> {
        let prompt = format!(
            r#"Question: {question}
User Answer: {answer}

Give a score (0-10) and feedback.
Start your reply with a line of the form "Score: N/10" where N is a whole number from 0 to 10, then give the feedback."#
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": "You are an AI evaluator." },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.2
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("evaluation request failed")?
            .error_for_status()
            .context("evaluation service returned an error")?
            .json::<LlmResponse>()
            .await
            .context("evaluation response was not valid JSON")?;

        let feedback = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
            .message
            .content;
        Ok(feedback.trim().to_string())
    }
}
