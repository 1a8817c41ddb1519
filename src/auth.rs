//! 微信access_token的缓存、刷新与并发控制。
//! 所有外呼接口都经由本模块取得有效凭据，刷新过程不会出现重复请求。
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// 凭据临近过期的提前刷新窗口
const REFRESH_BUFFER: Duration = Duration::from_secs(300);

// 上游返回的有效期不可信，收敛到一个合理区间。
// 下限需要大于刷新窗口，否则凭据永远视作待刷新。
const MIN_LIFETIME_SECS: u64 = 600;
const MAX_LIFETIME_SECS: u64 = 86_400;

const TOKEN_ENDPOINT: &str = "https://api.weixin.qq.com/cgi-bin/token";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum Error {
    /// 上游刷新失败，凭据暂不可用
    Unavailable(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "凭据不可用。{e}"),
        }
    }
}
impl std::error::Error for Error {}

/// 一次成功刷新所获得的凭据
pub struct TokenGrant {
    pub token: String,
    pub expires_in: u64,
}

/// 凭据的上游来源
pub trait TokenSource {
    fn fetch(&self) -> impl std::future::Future<Output = Result<TokenGrant, Error>> + Send;
}

// 缓存中的凭据。token缺失或临近过期均视作需要刷新。
struct Credential {
    token: Option<String>,
    expires_at: Instant,
}

impl Credential {
    fn empty() -> Self {
        Self {
            token: None,
            expires_at: Instant::now(),
        }
    }

    fn valid_token(&self) -> Option<String> {
        let deadline = self.expires_at.checked_sub(REFRESH_BUFFER)?;
        if Instant::now() < deadline {
            self.token.clone()
        } else {
            None
        }
    }
}

/// 带过期管理的凭据缓存。
/// 快路径直接读取缓存；慢路径在刷新锁内二次检查，任意并发需求下上游刷新至多触发一次。
pub struct TokenCache<S: TokenSource> {
    source: S,
    state: RwLock<Credential>,
    refresh_lock: Mutex<()>,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: RwLock::new(Credential::empty()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// 获取一个有效的access_token。缓存失效时在锁保护下刷新，
    /// 等待同一次刷新的调用方拿到相同的结果。
    pub async fn get(&self) -> Result<String, Error> {
        {
            let state = self.state.read().await;
            if let Some(token) = state.valid_token() {
                return Ok(token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // 拿到锁后再查一次：排队期间可能已被其他任务刷新
        {
            let state = self.state.read().await;
            if let Some(token) = state.valid_token() {
                tracing::debug!("Token already refreshed by another task");
                return Ok(token);
            }
        }

        tracing::info!("Refreshing WeChat access token");
        let grant = self.source.fetch().await?;
        let lifetime = grant.expires_in.clamp(MIN_LIFETIME_SECS, MAX_LIFETIME_SECS);

        let mut state = self.state.write().await;
        state.token = Some(grant.token.clone());
        state.expires_at = Instant::now() + Duration::from_secs(lifetime);
        tracing::info!("WeChat access token refreshed, lifetime {lifetime}s");
        Ok(grant.token)
    }

    /// 作废当前凭据。下一次get将强制刷新。可与get并发调用。
    pub async fn invalidate(&self) {
        tracing::warn!("Invalidating WeChat access token");
        let mut state = self.state.write().await;
        state.token = None;
        state.expires_at = Instant::now();
    }
}

/// 微信凭据接口的返回结果
#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

/// 真实的微信凭据来源
pub struct WeChatTokenSource {
    appid: String,
    secret: String,
    client: reqwest::Client,
}

impl WeChatTokenSource {
    pub fn new(appid: &str, secret: &str) -> Self {
        Self {
            appid: appid.to_owned(),
            secret: secret.to_owned(),
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("HTTP client should be built"),
        }
    }
}

impl TokenSource for WeChatTokenSource {
    async fn fetch(&self) -> Result<TokenGrant, Error> {
        let response = self
            .client
            .get(TOKEN_ENDPOINT)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.appid.as_str()),
                ("secret", self.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("请求凭据接口失败。{e}")))?
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Unavailable(format!("解析凭据接口返回失败。{e}")))?;

        match (response.access_token, response.expires_in) {
            (Some(token), Some(expires_in)) => Ok(TokenGrant { token, expires_in }),
            _ => {
                let errcode = response.errcode.unwrap_or(-1);
                let errmsg = response.errmsg.unwrap_or_default();
                Err(Error::Unavailable(format!(
                    "凭据接口返回错误。errcode: {errcode}, errmsg: {errmsg}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<TokenGrant, Error> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            // 模拟网络耗时，让并发调用都堆在刷新锁上
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(TokenGrant {
                token: format!("token-{n}"),
                expires_in: 7200,
            })
        }
    }

    struct FlakySource {
        fetches: AtomicUsize,
    }

    impl TokenSource for FlakySource {
        async fn fetch(&self) -> Result<TokenGrant, Error> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(Error::Unavailable("upstream down".to_string()))
            } else {
                Ok(TokenGrant {
                    token: "recovered".to_string(),
                    expires_in: 7200,
                })
            }
        }
    }

    #[tokio::test]
    async fn concurrent_get_refreshes_once() {
        let cache = Arc::new(TokenCache::new(CountingSource::new()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get().await.unwrap() }));
        }
        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap());
        }
        assert_eq!(cache.source.fetches.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "token-1"));
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_and_is_idempotent() {
        let cache = TokenCache::new(CountingSource::new());
        assert_eq!(cache.get().await.unwrap(), "token-1");
        assert_eq!(cache.get().await.unwrap(), "token-1");

        cache.invalidate().await;
        cache.invalidate().await;
        {
            let state = cache.state.read().await;
            assert!(state.token.is_none());
        }
        assert_eq!(cache.get().await.unwrap(), "token-2");
        assert_eq!(cache.source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_cache_empty_and_retries() {
        let cache = TokenCache::new(FlakySource {
            fetches: AtomicUsize::new(0),
        });
        assert!(cache.get().await.is_err());
        {
            let state = cache.state.read().await;
            assert!(state.token.is_none());
        }
        assert_eq!(cache.get().await.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn short_lifetime_is_clamped_to_usable_window() {
        struct ShortLived;
        impl TokenSource for ShortLived {
            async fn fetch(&self) -> Result<TokenGrant, Error> {
                Ok(TokenGrant {
                    token: "short".to_string(),
                    expires_in: 1,
                })
            }
        }
        let cache = TokenCache::new(ShortLived);
        assert_eq!(cache.get().await.unwrap(), "short");
        // 钳制后的有效期大于刷新窗口，紧接着的读取命中缓存
        let state = cache.state.read().await;
        assert!(state.valid_token().is_some());
    }
}
