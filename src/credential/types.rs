use std::fmt;
use std::sync::Arc;

/// 一个 Gemini API Key：按加载顺序编号，加载后不可变。
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    index: usize,
    secret: Arc<str>,
}

impl ApiKey {
    pub fn new(index: usize, secret: impl Into<Arc<str>>) -> Self {
        Self {
            index,
            secret: secret.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// 日志里展示用：只保留首尾各 4 个字符。
    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("index", &self.index)
            .field("secret", &self.masked())
            .finish()
    }
}

/// 过滤缺失/空白的 Key，保留原有顺序并去掉首尾空白。
pub fn usable_secrets<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    raw.into_iter()
        .flatten()
        .filter_map(|s| {
            let s = s.as_ref().trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        })
        .collect()
}

fn mask_secret(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
