use crate::credential::quota::{DEFAULT_QUOTA_LIMIT, DEFAULT_QUOTA_WINDOW, QuotaWindow};
use crate::credential::types::usable_secrets;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_USER_AGENT: &str = "vanilla-rag/0.1";

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_TEMPERATURE: f32 = 0.7;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_WEB_SEARCH_RESULTS: usize = 3;

const API_KEY_PREFIX: &str = "GEMINI_API_KEY_";
const API_KEY_LIST: &str = "GEMINI_API_KEYS";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub user_agent: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub debug: String,

    pub gemini_api_base: String,
    pub gemini_model: String,
    pub gemini_temperature: f32,
    pub gemini_api_keys: Vec<String>,

    pub quota_limit: usize,
    pub quota_window_secs: u64,

    pub docs_dir: String,
    pub index_path: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub web_search_results: usize,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_USER_AGENT")]
    api_user_agent: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "GEMINI_API_BASE")]
    gemini_api_base: Option<String>,
    #[serde(alias = "GEMINI_MODEL")]
    gemini_model: Option<String>,
    #[serde(alias = "GEMINI_TEMPERATURE")]
    gemini_temperature: Option<f32>,

    #[serde(alias = "API_QUOTA_LIMIT")]
    api_quota_limit: Option<usize>,
    #[serde(alias = "API_QUOTA_WINDOW")]
    api_quota_window: Option<u64>,

    #[serde(alias = "DOCS_DIR")]
    docs_dir: Option<String>,
    #[serde(alias = "INDEX_PATH")]
    index_path: Option<String>,
    #[serde(alias = "CHUNK_SIZE")]
    chunk_size: Option<usize>,
    #[serde(alias = "CHUNK_OVERLAP")]
    chunk_overlap: Option<usize>,
    #[serde(alias = "TOP_K")]
    top_k: Option<usize>,
    #[serde(alias = "WEB_SEARCH_RESULTS")]
    web_search_results: Option<usize>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw, collect_api_keys(std::env::vars()));

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv, gemini_api_keys: Vec<String>) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            user_agent: raw
                .api_user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_default(),
            gemini_api_base: raw
                .gemini_api_base
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            gemini_model: raw
                .gemini_model
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_temperature: raw
                .gemini_temperature
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(DEFAULT_GEMINI_TEMPERATURE),
            gemini_api_keys,
            quota_limit: raw.api_quota_limit.unwrap_or(DEFAULT_QUOTA_LIMIT).max(1),
            quota_window_secs: raw
                .api_quota_window
                .unwrap_or(DEFAULT_QUOTA_WINDOW.as_secs())
                .max(1),
            docs_dir: raw.docs_dir.unwrap_or_else(|| "docs".to_string()),
            index_path: raw
                .index_path
                .unwrap_or_else(|| "vectorstore/index.json".to_string()),
            chunk_size: raw.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: raw.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
            top_k: raw.top_k.unwrap_or(DEFAULT_TOP_K).max(1),
            web_search_results: raw.web_search_results.unwrap_or(DEFAULT_WEB_SEARCH_RESULTS),
        }
    }

    pub fn quota_window(&self) -> QuotaWindow {
        QuotaWindow {
            duration: Duration::from_secs(self.quota_window_secs),
            max_requests: self.quota_limit,
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 收集 Gemini API Key：
/// - `GEMINI_API_KEY_<n>` 按数字后缀排序
/// - 追加 `GEMINI_API_KEYS`（逗号分隔）
/// - 去除空白项与重复项，保持顺序
pub fn collect_api_keys<I>(vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut numbered: Vec<(u32, String)> = Vec::new();
    let mut listed: Vec<String> = Vec::new();

    for (k, v) in vars {
        if k == API_KEY_LIST {
            listed.extend(v.split(',').map(str::to_string));
            continue;
        }
        if let Some(suffix) = k.strip_prefix(API_KEY_PREFIX)
            && let Ok(n) = suffix.parse::<u32>()
        {
            numbered.push((n, v));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);

    let mut out: Vec<String> = Vec::new();
    let candidates = numbered
        .into_iter()
        .map(|(_, v)| Some(v))
        .chain(listed.into_iter().map(Some));
    for key in usable_secrets(candidates) {
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已由真实环境变量提供的值优先，不覆盖。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，尚未启动任何其它线程。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 不跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn collect_api_keys_orders_by_suffix_and_drops_blanks() {
        let keys = collect_api_keys(vars(&[
            ("GEMINI_API_KEY_3", "ccc"),
            ("PATH", "/usr/bin"),
            ("GEMINI_API_KEY_1", "aaa"),
            ("GEMINI_API_KEY_2", "   "),
            ("GEMINI_API_KEY_10", "jjj"),
            ("GEMINI_API_KEY_X", "ignored"),
        ]));
        assert_eq!(keys, vec!["aaa", "ccc", "jjj"]);
    }

    #[test]
    fn collect_api_keys_appends_list_and_dedupes() {
        let keys = collect_api_keys(vars(&[
            ("GEMINI_API_KEYS", "bbb, aaa,,ddd"),
            ("GEMINI_API_KEY_1", "aaa"),
        ]));
        assert_eq!(keys, vec!["aaa", "bbb", "ddd"]);
    }

    #[test]
    fn collect_api_keys_empty_when_nothing_configured() {
        assert!(collect_api_keys(vars(&[("HOME", "/root")])).is_empty());
    }

    #[test]
    fn from_raw_applies_defaults_and_floors() {
        let raw = RawEnv {
            api_quota_limit: Some(0),
            api_quota_window: Some(0),
            gemini_temperature: Some(f32::NAN),
            ..RawEnv::default()
        };
        let cfg = Config::from_raw(raw, vec!["k".to_string()]);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.gemini_model, DEFAULT_GEMINI_MODEL);
        assert_eq!(cfg.gemini_temperature, DEFAULT_GEMINI_TEMPERATURE);
        assert_eq!(cfg.quota_window().max_requests, 1);
        assert_eq!(cfg.quota_window().duration, Duration::from_secs(1));
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.chunk_overlap, DEFAULT_CHUNK_OVERLAP);
    }

    #[test]
    fn parse_dotenv_line_handles_quotes_comments_and_export() {
        assert_eq!(
            parse_dotenv_line("export GEMINI_API_KEY_1=abc # primary"),
            Some(("GEMINI_API_KEY_1".to_string(), "abc".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("DOCS_DIR=\"my docs # here\""),
            Some(("DOCS_DIR".to_string(), "my docs # here".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("TOKEN=a#b"),
            Some(("TOKEN".to_string(), "a#b".to_string()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=value"), None);
    }
}
