//! 题目生成
//!
//! 调用生成后端得到五道题目，结构不符时带更强的提示重试，
//! 重试用尽后使用默认题目。

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Choice, Question, QUESTIONS_PER_PARAGRAPH};
use crate::config::GenerationConfig;
use crate::error::GenerationError;

const SYSTEM_PROMPT: &str = "你是一个专业的阅读理解题目生成助手。请根据提供的文本生成高质量的选择题。";

/// 生成后端
///
/// 接收提示词，返回形如 `{"questions": [...]}` 的结构化数据
pub trait GenerationBackend: Send + Sync + 'static {
    fn complete(
        &self,
        prompt: &str,
    ) -> impl Future<Output = Result<Value, GenerationError>> + Send;
}

/// 后端返回的单道题目
#[derive(Debug, Deserialize)]
struct RawQuestion {
    question: String,
    options: RawOptions,
    correct_answer: String,
}

#[derive(Debug, Deserialize)]
struct RawOptions {
    #[serde(rename = "A")]
    a: String,
    #[serde(rename = "B")]
    b: String,
    #[serde(rename = "C")]
    c: String,
    #[serde(rename = "D")]
    d: String,
}

/// 校验并转换后端返回的数据
///
/// 必须恰好五道题，每道题都有题干、A-D 四个选项和 A-D 之一的正确答案
pub fn parse_questions(value: &Value) -> Result<Vec<Question>, GenerationError> {
    let items = value
        .get("questions")
        .and_then(Value::as_array)
        .ok_or_else(|| GenerationError::Schema("缺少 questions 列表".to_string()))?;

    if items.len() != QUESTIONS_PER_PARAGRAPH {
        return Err(GenerationError::Schema(format!(
            "题目数量不是 {}: {}",
            QUESTIONS_PER_PARAGRAPH,
            items.len()
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let raw: RawQuestion = serde_json::from_value(item.clone())
                .map_err(|e| GenerationError::Schema(format!("第 {} 题结构错误: {}", i + 1, e)))?;

            let correct_answer = match raw.correct_answer.as_str() {
                "A" | "B" | "C" | "D" => raw
                    .correct_answer
                    .parse::<Choice>()
                    .map_err(GenerationError::Schema)?,
                other => {
                    return Err(GenerationError::Schema(format!(
                        "第 {} 题正确答案格式错误: {}",
                        i + 1,
                        other
                    )))
                }
            };

            Ok(Question {
                question_text: raw.question,
                option_a: raw.options.a,
                option_b: raw.options.b,
                option_c: raw.options.c,
                option_d: raw.options.d,
                correct_answer,
            })
        })
        .collect()
}

/// 默认题目（所有尝试都失败时使用）
pub fn default_questions() -> Vec<Question> {
    vec![
        Question {
            question_text: "根据文本内容，以下哪项描述是正确的？".to_string(),
            option_a: "选项A".to_string(),
            option_b: "选项B".to_string(),
            option_c: "选项C".to_string(),
            option_d: "选项D".to_string(),
            correct_answer: Choice::A,
        };
        QUESTIONS_PER_PARAGRAPH
    ]
}

/// 基础提示词
fn base_prompt(content: &str) -> String {
    format!(
        r#"请根据以下文本内容，生成5道阅读理解选择题。

文本内容：
{content}

要求：
1. 生成5道选择题
2. 每道题有4个选项（A、B、C、D）
3. 题目应该测试对文本内容的理解
4. 包含文本细节和主旨理解
5. 请严格按照以下JSON格式返回：

{{
  "questions": [
    {{
      "question": "问题内容",
      "options": {{
        "A": "选项A内容",
        "B": "选项B内容",
        "C": "选项C内容",
        "D": "选项D内容"
      }},
      "correct_answer": "A"
    }}
  ]
}}

请确保返回的是有效的JSON格式，直接返回json对象，除此之外不要返回任何其他内容。"#
    )
}

/// 第 `attempt` 次尝试的提示词，重试时追加更严格的格式要求
fn prompt_for_attempt(base: &str, attempt: usize) -> String {
    if attempt == 0 {
        return base.to_string();
    }
    format!(
        "{}\n\n【注意】这是你第{}次重试。上次返回的格式不正确，请确保严格按照上述JSON格式返回5道完整的选择题，包含question、options（A/B/C/D四个选项）和correct_answer字段。",
        base, attempt
    )
}

/// 题目生成器
pub struct QuestionGenerator<B> {
    backend: B,
    max_retries: usize,
}

impl<B: GenerationBackend> QuestionGenerator<B> {
    pub fn new(backend: B, max_retries: usize) -> Self {
        Self {
            backend,
            max_retries,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// 尝试生成五道题目，所有尝试都失败时返回最后一次的错误
    pub async fn try_generate(&self, content: &str) -> Result<Vec<Question>, GenerationError> {
        let base = base_prompt(content);
        let mut last_error = GenerationError::Schema("未进行任何尝试".to_string());

        for attempt in 0..=self.max_retries {
            let prompt = prompt_for_attempt(&base, attempt);
            debug!(attempt = attempt + 1, "请求生成题目");

            let result = match self.backend.complete(&prompt).await {
                Ok(value) => parse_questions(&value),
                Err(e) => Err(e),
            };

            match result {
                Ok(questions) => {
                    info!(attempt = attempt + 1, "题目生成成功");
                    return Ok(questions);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "题目生成失败");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// 生成五道题目，失败时使用默认题目
    pub async fn generate(&self, content: &str) -> Vec<Question> {
        match self.try_generate(content).await {
            Ok(questions) => questions,
            Err(e) => {
                warn!(max_retries = self.max_retries, error = %e, "已达到最大重试次数，使用默认题目");
                default_questions()
            }
        }
    }
}

/// OpenAI 兼容的 chat/completions 后端
pub struct ChatCompletionsBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionsBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key(),
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "response_format": { "type": "json_object" },
        })
    }
}

/// 从 chat/completions 响应中取出消息内容并解析为 JSON
fn message_json(response: &Value) -> Result<Value, GenerationError> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GenerationError::Transport("返回内容为空".to_string()))?;

    serde_json::from_str(content)
        .map_err(|e| GenerationError::Schema(format!("返回内容不是有效的 JSON: {}", e)))
}

impl GenerationBackend for ChatCompletionsBackend {
    async fn complete(&self, prompt: &str) -> Result<Value, GenerationError> {
        let mut request = self.client.post(&self.endpoint).json(&self.request_body(prompt));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("读取响应失败: {}", e)))?;

        message_json(&payload)
    }
}
