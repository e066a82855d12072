//! 阅读理解题目
//!
//! 每个段落恰好对应五道单选题（四个选项、一个正确答案），
//! 由后台任务调用生成服务得到，生成失败时使用默认题目。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod generator;

pub use coordinator::{TaskCoordinator, TaskState};
pub use generator::{
    default_questions, ChatCompletionsBackend, GenerationBackend, QuestionGenerator,
};

/// 每个段落的题目数量
pub const QUESTIONS_PER_PARAGRAPH: usize = 5;

/// 选项字母
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Choice {
    A,
    B,
    C,
    D,
}

impl Choice {
    pub const ALL: [Choice; 4] = [Choice::A, Choice::B, Choice::C, Choice::D];

    pub fn as_str(&self) -> &'static str {
        match self {
            Choice::A => "A",
            Choice::B => "B",
            Choice::C => "C",
            Choice::D => "D",
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Choice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Choice::A),
            "B" => Ok(Choice::B),
            "C" => Ok(Choice::C),
            "D" => Ok(Choice::D),
            other => Err(format!("无效的答案选项: {}", other)),
        }
    }
}

/// 单道题目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question_text: String,
    pub option_a: String,
    pub option_b: String,
    pub option_c: String,
    pub option_d: String,
    pub correct_answer: Choice,
}

impl Question {
    pub fn option(&self, choice: Choice) -> &str {
        match choice {
            Choice::A => &self.option_a,
            Choice::B => &self.option_b,
            Choice::C => &self.option_c,
            Choice::D => &self.option_d,
        }
    }
}

/// 题目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    /// 题目已保存，可以直接作答
    Ready,
    /// 正在生成，调用方稍后轮询
    Generating,
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: QuestionStatus,
    pub questions: Vec<Question>,
}

impl StatusResponse {
    pub fn ready(questions: Vec<Question>) -> Self {
        Self {
            status: QuestionStatus::Ready,
            questions,
        }
    }

    pub fn generating() -> Self {
        Self {
            status: QuestionStatus::Generating,
            questions: Vec::new(),
        }
    }
}
