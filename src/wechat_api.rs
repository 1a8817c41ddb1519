//! 微信公众号服务端接口涉及到的数据结构与客户端
use crate::auth::{Error as AuthError, TokenCache, TokenSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://api.weixin.qq.com/cgi-bin";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// access_token失效类错误码：40001凭据无效，40014不合法的access_token，42001凭据过期。
// 命中后作废缓存并重试一次，其余错误码不重试。
const TOKEN_REJECTED_CODES: [i64; 3] = [40001, 40014, 42001];
const MAX_TOKEN_ATTEMPTS: usize = 2;

#[derive(Debug)]
pub enum Error {
    /// 无法取得有效凭据
    Auth(AuthError),
    Network(String),
    /// 接口返回了非零错误码
    Api { errcode: i64, errmsg: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "{e}"),
            Self::Network(e) => write!(f, "网络错误。{e}"),
            Self::Api { errcode, errmsg } => {
                write!(f, "微信接口错误。errcode: {errcode}, errmsg: {errmsg}")
            }
        }
    }
}
impl std::error::Error for Error {}

/// 服务器可用性验证请求涉及到的URL参数
#[derive(Deserialize)]
pub struct UrlVerifyParams {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub echostr: String,
}

/// 用户所发送消息的XML结构体
///
/// 文本消息示例：
// <xml>
//   <ToUserName><![CDATA[gh_188611111111]]></ToUserName>
//   <FromUserName><![CDATA[oVxxxxxxxxxxxxxxxxxxxxxxxxx]]></FromUserName>
//   <CreateTime>1708218294</CreateTime>
//   <MsgType><![CDATA[text]]></MsgType>
//   <Content><![CDATA[珍珠如何保养？]]></Content>
// </xml>
///
/// 关注事件示例：
// <xml>
//   <ToUserName><![CDATA[gh_188611111111]]></ToUserName>
//   <FromUserName><![CDATA[oVxxxxxxxxxxxxxxxxxxxxxxxxx]]></FromUserName>
//   <CreateTime>1708218294</CreateTime>
//   <MsgType><![CDATA[event]]></MsgType>
//   <Event><![CDATA[subscribe]]></Event>
// </xml>
#[derive(Debug, Deserialize, PartialEq)]
pub struct ReceivedMsg {
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime")]
    pub create_time: u64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "Content", default)]
    pub content: Option<String>,
    #[serde(rename = "Event", default)]
    pub event: Option<String>,
}

/// 构造回复给用户的文本消息XML。收发双方对调，时间取当前Unix时间。
pub fn reply_xml(to_user: &str, from_user: &str, content: &str) -> String {
    format!(
        "<xml>\n\
<ToUserName><![CDATA[{to_user}]]></ToUserName>\n\
<FromUserName><![CDATA[{from_user}]]></FromUserName>\n\
<CreateTime>{}</CreateTime>\n\
<MsgType><![CDATA[text]]></MsgType>\n\
<Content><![CDATA[{content}]]></Content>\n\
</xml>",
        chrono::Utc::now().timestamp()
    )
}

// 客服消息请求体
// {"touser": "OPENID", "msgtype": "text", "text": {"content": "..."}}
#[derive(Serialize)]
struct CustomMessage<'a> {
    touser: &'a str,
    msgtype: &'static str,
    text: TextPayload<'a>,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// 带凭据管理的微信接口客户端。
/// 凭据被接口判定失效时，作废缓存后用新凭据重试一次。
pub struct WeChatClient<S: TokenSource> {
    tokens: Arc<TokenCache<S>>,
    client: reqwest::Client,
    base_url: String,
}

impl<S: TokenSource> WeChatClient<S> {
    pub fn new(tokens: Arc<TokenCache<S>>) -> Self {
        Self::with_base_url(tokens, BASE_URL)
    }

    pub fn with_base_url(tokens: Arc<TokenCache<S>>, base_url: &str) -> Self {
        Self {
            tokens,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("HTTP client should be built"),
            base_url: base_url.to_owned(),
        }
    }

    /// 向用户推送一条客服文本消息
    pub async fn push_text(&self, open_id: &str, content: &str) -> Result<(), Error> {
        let body = CustomMessage {
            touser: open_id,
            msgtype: "text",
            text: TextPayload { content },
        };
        let url = format!("{}/message/custom/send", self.base_url);

        for attempt in 0..MAX_TOKEN_ATTEMPTS {
            let token = self.tokens.get().await.map_err(Error::Auth)?;
            let response = self
                .client
                .post(&url)
                .query(&[("access_token", token.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Network(format!("发送客服消息失败。{e}")))?
                .json::<ApiResponse>()
                .await
                .map_err(|e| Error::Network(format!("解析接口返回失败。{e}")))?;

            if response.errcode == 0 {
                tracing::debug!("Custom message delivered to {open_id}");
                return Ok(());
            }
            if TOKEN_REJECTED_CODES.contains(&response.errcode)
                && attempt + 1 < MAX_TOKEN_ATTEMPTS
            {
                tracing::warn!(
                    "Access token rejected (errcode {}), retrying with a fresh one",
                    response.errcode
                );
                self.tokens.invalidate().await;
                continue;
            }
            return Err(Error::Api {
                errcode: response.errcode,
                errmsg: response.errmsg,
            });
        }
        Err(Error::Api {
            errcode: -1,
            errmsg: "重试次数耗尽".to_string(),
        })
    }
}
