//! 定义了系统运行所需的核心实体类型以及组合模块需要遵循的行为协议
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// 会话消息的角色。与OpenAI Chat接口的定义保持一致。
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

/// 会话记录中的每一条消息
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// 问答能力可能产生的错误。
/// 供应商侧的自由文本错误在边界处转换为类型化的错误种类，上层只按种类分派。
#[derive(Debug, Clone)]
pub enum ChatError {
    /// 内容安全策略拒绝了本次请求
    PolicyViolation,
    Network(String),
    Api(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyViolation => write!(f, "内容安全策略拒绝了本次请求"),
            Self::Network(e) => write!(f, "网络错误。{e}"),
            Self::Api(e) => write!(f, "AI接口错误。{e}"),
        }
    }
}
impl std::error::Error for ChatError {}

/// 提供问答能力的对象应当具备的行为。
/// 返回的Future需要满足Send，问答过程可能运行在后台任务中。
pub trait Chat {
    fn answer(
        &self,
        question: &str,
        history: &[ChatMessage],
    ) -> impl Future<Output = Result<String, ChatError>> + Send;
}
