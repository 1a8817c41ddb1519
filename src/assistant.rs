//! AI珍珠专家助手，对接OpenAI兼容的Chat接口。
//! 供应商侧的错误在此处转换为类型化的ChatError，上层不再检查错误文本。
use crate::content::{ContentKind, ContentStore};
use crate::core::{Chat, ChatError, ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "你是一位优雅、专业的珍珠科普客服，只回答珍珠相关的科普问题。\
如果用户问你是谁、你的身份、你的名字等，请自我介绍为：我是悦华珍珠AI助手宝儿，可以回答你任何和珍珠相关的问题。\
如果用户的问题涉及珍珠相关内容（包括珍珠品种、历史、鉴别、养殖、购买、佩戴、护理、文化等），请尽量详细、专业地解答。\
如果用户的问题涉及悦华珍珠或我们家的珍珠，请依据给出的品牌资料回答，不允许自行编写悦华珍珠相关内容。\
如果用户的问题与珍珠完全无关（如天气、体育、娱乐、编程等），请礼貌回复：很抱歉，我只能解答珍珠相关的问题。\
如果用户提到之前的对话内容，请结合会话记录进行判断和回答。";

/// 品牌资料缺失时的固定回复
pub const CONTENT_MISSING_REPLY: &str =
    "抱歉，悦华珍珠的相关资料暂时无法获取，请稍后再试，或关注我们的官方渠道了解最新信息。";

/// 助手初始化所需要的参数
#[derive(Deserialize, Clone)]
pub struct Config {
    pub endpoint: String,
    pub api_key: String,
}

/// Assistant根据用户问题与会话记录生成回复
pub struct Assistant {
    config: Config,
    content: Arc<ContentStore>,
    client: reqwest::Client,
}

// Chat请求体
// {"messages": [{"role": "system", "content": "..."}, {"role": "user", "content": "..."}]}
#[derive(Serialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
}

// Chat请求返回结果（只取用到的字段）
// {"choices": [{"message": {"role": "assistant", "content": "..."}}]}
#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

impl Assistant {
    pub fn new(config: Config, content: Arc<ContentStore>) -> Self {
        Self {
            config,
            content,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("HTTP client should be built"),
        }
    }

    fn is_brand_question(question: &str) -> bool {
        question.contains("悦华珍珠") || question.contains("你们家的珍珠")
    }

    // 根据问题内容挑选要注入的品牌资料类别
    fn classify_brand_query(question: &str) -> ContentKind {
        if ["价格", "多少钱", "折扣", "优惠"]
            .iter()
            .any(|k| question.contains(k))
        {
            ContentKind::Pricing
        } else if ["款式", "类型", "定制", "项链", "耳环", "戒指"]
            .iter()
            .any(|k| question.contains(k))
        {
            ContentKind::Styles
        } else if ["购买", "商城", "下单", "实体店", "门店"]
            .iter()
            .any(|k| question.contains(k))
        {
            ContentKind::Purchase
        } else if ["品牌", "系列", "供应商", "定位"]
            .iter()
            .any(|k| question.contains(k))
        {
            ContentKind::Brand
        } else {
            ContentKind::Other
        }
    }
}

impl Chat for Assistant {
    async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<String, ChatError> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(ChatMessage::new(Role::System, SYSTEM_PROMPT));

        // 品牌相关问题需要附带资料；资料缺失时直接降级为固定回复
        if Self::is_brand_question(question) {
            let kind = Self::classify_brand_query(question);
            match self.content.get(kind).await {
                Some(material) => {
                    messages.push(ChatMessage::new(
                        Role::System,
                        format!("以下是悦华珍珠的品牌资料，回答时请严格依据其中内容：\n{material}"),
                    ));
                }
                None => {
                    tracing::warn!("Brand material unavailable for {kind:?}");
                    return Ok(CONTENT_MISSING_REPLY.to_string());
                }
            }
        }

        messages.extend_from_slice(history);
        messages.push(ChatMessage::new(Role::User, question));

        tracing::debug!("Asking AI with {} messages", messages.len());
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("api-key", self.config.api_key.as_str())
            .json(&ChatRequest { messages })
            .send()
            .await
            .map_err(|e| ChatError::Network(format!("发送AI请求失败。{e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            // 错误文本只在此边界处检查一次，向上只暴露错误种类
            if body.contains("ResponsibleAIPolicyViolation") || body.contains("content_filter") {
                return Err(ChatError::PolicyViolation);
            }
            return Err(ChatError::Api(format!("AI接口返回400。{body}")));
        }
        if !status.is_success() {
            return Err(ChatError::Api(format!("AI接口返回错误状态。{status}")));
        }

        let parsed = response
            .json::<ChatApiResponse>()
            .await
            .map_err(|e| ChatError::Api(format!("解析AI返回失败。{e}")))?;
        match parsed.choices.first() {
            Some(choice) => Ok(choice.message.content.clone()),
            None => Err(ChatError::Api("AI接口未返回任何回复".to_string())),
        }
    }
}
