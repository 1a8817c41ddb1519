//! 品牌知识内容的读取与缓存。
//! 内容以markdown文件形式存放，首次访问时整体加载进内存。
use crate::lazy::Lazy;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

/// 内容类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Brand,
    Pricing,
    Styles,
    Purchase,
    Other,
}

impl ContentKind {
    pub const ALL: [ContentKind; 5] = [
        ContentKind::Brand,
        ContentKind::Pricing,
        ContentKind::Styles,
        ContentKind::Purchase,
        ContentKind::Other,
    ];

    fn file_stem(&self) -> &'static str {
        match self {
            Self::Brand => "brand",
            Self::Pricing => "pricing",
            Self::Styles => "styles",
            Self::Purchase => "purchase",
            Self::Other => "other",
        }
    }
}

/// 内容存取层。文件缺失不视为错误，由调用方降级处理。
pub struct ContentStore {
    dir: PathBuf,
    cache: Lazy<HashMap<ContentKind, String>>,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Lazy::new(),
        }
    }

    /// 读取某类内容。不存在时返回None。
    pub async fn get(&self, kind: ContentKind) -> Option<String> {
        self.load().await.get(&kind).cloned()
    }

    /// 预加载全部内容并记录结果
    pub async fn preload(&self) {
        let cache = self.load().await;
        tracing::info!(
            "Preloaded {}/{} content files from {}",
            cache.len(),
            ContentKind::ALL.len(),
            self.dir.display()
        );
    }

    async fn load(&self) -> Arc<HashMap<ContentKind, String>> {
        let loaded = self
            .cache
            .get_or_try_init(|| async {
                let mut loaded = HashMap::new();
                for kind in ContentKind::ALL {
                    let path = self.dir.join(format!("{}.md", kind.file_stem()));
                    match fs::read_to_string(&path).await {
                        Ok(text) => {
                            loaded.insert(kind, text);
                        }
                        Err(e) => {
                            tracing::warn!("Content file not loaded: {}: {e}", path.display());
                        }
                    }
                }
                Ok::<_, Infallible>(loaded)
            })
            .await;
        match loaded {
            Ok(cache) => cache,
            Err(never) => match never {},
        }
    }
}
