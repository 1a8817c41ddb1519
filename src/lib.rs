use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod assistant;
pub mod auth;
pub mod content;
pub mod core;
pub mod crypto;
pub mod lazy;
pub mod predefined;
pub mod quota;
pub mod reception;
pub mod session;
pub mod wechat_api;

use assistant::{Assistant, Config as AssistantCfg};
use auth::{TokenCache, WeChatTokenSource};
use content::ContentStore;
use reception::{Agent, ReplyMode};
use wechat_api::{UrlVerifyParams, WeChatClient};

/// 应用初始化所需要的配置项。这些配置项内容将从环境变量中读取。
#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    pub app_token: String,
    pub wechat_appid: String,
    pub wechat_secret: String,
    pub openai_endpoint: String,
    pub openai_api_key: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default)]
    pub reply_mode: ReplyMode,
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_daily_limit() -> u32 {
    5
}

fn default_content_dir() -> String {
    "data/markdown".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Configuration {
    /// 启动前校验。关键凭据缺失时服务不得对外提供流量。
    pub fn validate(&self) -> Result<(), String> {
        if self.app_token.is_empty() {
            return Err("APP_TOKEN为空".to_string());
        }
        if self.wechat_appid.is_empty() || self.wechat_secret.is_empty() {
            return Err("WECHAT_APPID或WECHAT_SECRET为空".to_string());
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    app_token: String,
    agent: Agent<Assistant, WeChatTokenSource>,
}

pub fn app(config: &Configuration) -> Router {
    let tokens = Arc::new(TokenCache::new(WeChatTokenSource::new(
        &config.wechat_appid,
        &config.wechat_secret,
    )));
    let client = Arc::new(WeChatClient::new(tokens));

    let content = Arc::new(ContentStore::new(&config.content_dir));
    let preload = content.clone();
    tokio::spawn(async move { preload.preload().await });

    let assistant = Assistant::new(
        AssistantCfg {
            endpoint: config.openai_endpoint.clone(),
            api_key: config.openai_api_key.clone(),
        },
        content,
    );

    let state = AppState {
        app_token: config.app_token.clone(),
        agent: Agent::new(assistant, client, config.daily_limit, config.reply_mode),
    };

    Router::new()
        .route("/", get(root_handler))
        .route("/wechat", get(server_verification_handler).post(user_msg_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root_handler() -> &'static str {
    "天天乐优选 - 悦华珍珠欢迎你."
}

/// 响应腾讯服务器的可用性验证请求。
async fn server_verification_handler(
    State(state): State<AppState>,
    Query(params): Query<UrlVerifyParams>,
) -> (StatusCode, String) {
    if crypto::check_signature(
        &params.signature,
        &params.timestamp,
        &params.nonce,
        &state.app_token,
    ) {
        (StatusCode::OK, params.echostr)
    } else {
        tracing::error!("签名校验失败。请求可能并非来自微信服务器。");
        (StatusCode::FORBIDDEN, "signature error".to_string())
    }
}

/// 处理用户发来的消息。应答以XML形式在同步窗口内返回。
async fn user_msg_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let xml = state.agent.handle_message(&body).await;
    ([(header::CONTENT_TYPE, "application/xml")], xml)
}
