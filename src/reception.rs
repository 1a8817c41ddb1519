//! Agent负责用户请求的预处理、配额控制与AI问答的分发。
//! 消息处理过程中的一切失败都在此边界转换为用户可见的回复，不向服务循环传播。
use crate::core::{Chat, ChatError, ChatMessage, Role};
use crate::predefined::PredefinedResponder;
use crate::quota::DailyQuota;
use crate::session::{ConversationStore, UserLocks};
use crate::wechat_api::{reply_xml, ReceivedMsg, WeChatClient};
use crate::auth::TokenSource;
use serde::Deserialize;
use serde_xml_rs::from_str;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

// 微信同步应答窗口内留给AI的时间，超过则降级为固定回复
const SYNC_ANSWER_TIMEOUT: Duration = Duration::from_secs(4);

const UNSUPPORTED_REPLY: &str = "暂不支持此类型消息。";
const EMPTY_MSG_REPLY: &str = "消息内容为空，请发送文字提问。";
const QUOTA_EXCEEDED_REPLY: &str =
    "您今日的对话次数已用完，明天会重新计算哦。感谢理解，期待明天与您继续交流！";
const WAIT_REPLY: &str = "宝儿正在思考您的问题，请稍等片刻，答案马上送到～";
const APOLOGY_REPLY: &str = "抱歉，系统开小差了，请稍后再试。";
const POLICY_REPLY: &str = "抱歉，我是一名AI珍珠专家，我不能做回答珍珠相关问题的其他操作";
const TIMEOUT_REPLY: &str = "这个问题有点复杂，宝儿还在思考。请稍后换个方式再问一次吧。";

// 无法解析的消息体只能向平台确认收到，避免微信侧反复重投
const PLATFORM_ACK: &str = "success";

/// 应答投递方式。由配置显式选择，而非依赖框架能力探测。
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// 在同步应答窗口内等待AI回复
    Inline,
    /// 立即返回占位提示，答案经客服消息异步推送
    Deferred,
}

impl Default for ReplyMode {
    fn default() -> Self {
        Self::Deferred
    }
}

/// Agent协调配额、会话记录与AI之间的交互过程
pub struct Agent<C, S>
where
    C: Chat,
    S: TokenSource,
{
    assistant: Arc<C>,
    quota: Arc<DailyQuota>,
    locks: Arc<UserLocks>,
    store: Arc<ConversationStore>,
    responder: PredefinedResponder,
    client: Arc<WeChatClient<S>>,
    daily_limit: u32,
    reply_mode: ReplyMode,
}

impl<C, S> Clone for Agent<C, S>
where
    C: Chat,
    S: TokenSource,
{
    fn clone(&self) -> Self {
        Self {
            assistant: self.assistant.clone(),
            quota: self.quota.clone(),
            locks: self.locks.clone(),
            store: self.store.clone(),
            responder: self.responder.clone(),
            client: self.client.clone(),
            daily_limit: self.daily_limit,
            reply_mode: self.reply_mode,
        }
    }
}

impl<C, S> Agent<C, S>
where
    C: Chat + Send + Sync + 'static,
    S: TokenSource + Send + Sync + 'static,
{
    pub fn new(
        assistant: C,
        client: Arc<WeChatClient<S>>,
        daily_limit: u32,
        reply_mode: ReplyMode,
    ) -> Self {
        Self {
            assistant: Arc::new(assistant),
            quota: Arc::new(DailyQuota::new()),
            locks: Arc::new(UserLocks::new()),
            store: Arc::new(ConversationStore::new()),
            responder: PredefinedResponder::new(daily_limit),
            client,
            daily_limit,
            reply_mode,
        }
    }

    /// 处理用户发来的消息，返回应答XML
    pub async fn handle_message(&self, body: &str) -> String {
        let trace_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("dispatch", %trace_id);
        self.dispatch(body).instrument(span).await
    }

    async fn dispatch(&self, body: &str) -> String {
        let msg: ReceivedMsg = match from_str(body) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("解析用户消息失败。{e}");
                return PLATFORM_ACK.to_string();
            }
        };

        let user = msg.from_user_name.as_str();
        let account = msg.to_user_name.as_str();

        match msg.msg_type.as_str() {
            "event" => self.handle_event(&msg, user, account).await,
            "text" => self.handle_text(&msg, user, account).await,
            other => {
                tracing::info!("Unsupported message type: {other}");
                reply_xml(user, account, UNSUPPORTED_REPLY)
            }
        }
    }

    // 订阅事件清空历史会话并发送欢迎语，不消耗配额
    async fn handle_event(&self, msg: &ReceivedMsg, user: &str, account: &str) -> String {
        match msg.event.as_deref() {
            Some("subscribe") => {
                tracing::info!("User {user} subscribed");
                self.store.clear(user).await;
                let remaining = self.quota.remaining(user, self.daily_limit).await;
                reply_xml(user, account, &self.responder.welcome_reply(remaining))
            }
            Some("unsubscribe") => {
                tracing::info!("User {user} unsubscribed");
                PLATFORM_ACK.to_string()
            }
            other => {
                tracing::info!("Unsupported event: {other:?}");
                reply_xml(user, account, UNSUPPORTED_REPLY)
            }
        }
    }

    async fn handle_text(&self, msg: &ReceivedMsg, user: &str, account: &str) -> String {
        let question = msg.content.as_deref().unwrap_or("").trim();
        if question.is_empty() {
            return reply_xml(user, account, EMPTY_MSG_REPLY);
        }

        // 预定义回复短路，不消耗配额。已用与剩余取同一次快照。
        let (used, remaining) = self.quota.usage(user, self.daily_limit).await;
        if let Some(text) = self.responder.respond(question, used, remaining) {
            tracing::info!("Predefined reply for {user}");
            return reply_xml(user, account, &text);
        }

        let (allowed, count) = self.quota.check_and_increment(user, self.daily_limit).await;
        if !allowed {
            tracing::info!("Quota exhausted for {user} ({count}/{})", self.daily_limit);
            return reply_xml(user, account, QUOTA_EXCEEDED_REPLY);
        }
        tracing::debug!("Quota granted for {user}: {count}/{}", self.daily_limit);

        match self.reply_mode {
            ReplyMode::Inline => {
                let answer = match tokio::time::timeout(
                    SYNC_ANSWER_TIMEOUT,
                    self.answer_user(user, question),
                )
                .await
                {
                    Ok(text) => text,
                    // 超时取消会释放用户锁（RAII守卫随Future一起丢弃）
                    Err(_) => {
                        tracing::warn!("Inline answer timed out for {user}");
                        TIMEOUT_REPLY.to_string()
                    }
                };
                reply_xml(user, account, &answer)
            }
            ReplyMode::Deferred => {
                self.spawn_deferred(user, question);
                reply_xml(user, account, WAIT_REPLY)
            }
        }
    }

    // 在用户锁的保护下完成读取历史、问答、写回历史。
    // 失败在此处转换为固定回复文本，不向上传播。
    async fn answer_user(&self, user: &str, question: &str) -> String {
        let lock = self.locks.acquire(user).await;
        let _guard = lock.lock().await;

        let history = self.store.history(user).await;
        match self.assistant.answer(question, &history).await {
            Ok(answer) => {
                self.store
                    .append(
                        user,
                        ChatMessage::new(Role::User, question),
                        ChatMessage::new(Role::Assistant, answer.clone()),
                    )
                    .await;
                answer
            }
            Err(ChatError::PolicyViolation) => {
                tracing::warn!("Policy violation for {user}");
                // 违规问答与正常问答一样计入会话记录，后续追问时AI能看到拒答上下文
                self.store
                    .append(
                        user,
                        ChatMessage::new(Role::User, question),
                        ChatMessage::new(Role::Assistant, POLICY_REPLY),
                    )
                    .await;
                POLICY_REPLY.to_string()
            }
            Err(e) => {
                tracing::error!("获取AI回复失败。{e}");
                APOLOGY_REPLY.to_string()
            }
        }
    }

    // 异步路径：后台完成问答后经客服消息推送。推送失败时尽力送达兜底消息。
    fn spawn_deferred(&self, user: &str, question: &str) {
        let agent = self.clone();
        let user = user.to_owned();
        let question = question.to_owned();
        tokio::spawn(
            async move {
                let answer = agent.answer_user(&user, &question).await;
                if let Err(e) = agent.client.push_text(&user, &answer).await {
                    tracing::error!("推送客服消息失败。{e}");
                    if let Err(e) = agent.client.push_text(&user, APOLOGY_REPLY).await {
                        tracing::error!("推送兜底消息仍然失败。{e}");
                    }
                }
            }
            .in_current_span(),
        );
    }
}
