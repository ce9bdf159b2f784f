use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 日志等级：
/// - off：不输出详细请求/响应
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：额外输出发往 Gemini 的请求/响应（格式化/脱敏）
/// - high：客户端 + 后端，按原始字节输出（API Key 仍然脱敏）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

const REDACTED_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "cookie",
];

// 检索上下文可能很长，日志里只保留开头。
const MAX_LOG_STRING_CHARS: usize = 2000;

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_request_raw(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n================== 客户端请求（RAW） ==================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n[客户端请求体]\n{}\n=========================================================",
        format_headers_raw(headers),
        String::from_utf8_lossy(body),
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn client_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n================== 客户端响应（RAW） ==================\n[客户端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        String::from_utf8_lossy(body),
    );
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_request_raw(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端请求（RAW） ===================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n[后端请求体]\n{}\n=========================================================",
        format_headers_raw(headers),
        String::from_utf8_lossy(body),
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端响应（RAW） ===================\n[后端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        String::from_utf8_lossy(body),
    );
}

fn is_redacted(name: &str) -> bool {
    REDACTED_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let v = if is_redacted(key) {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // 同名多值统一用数组输出。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = if is_redacted(key) {
            "***"
        } else {
            value.to_str().unwrap_or("<non-utf8>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        let head = &bytes[..bytes.len().min(16 * 1024)];
        return format!(
            "(body too large: {} bytes, showing head)\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(head))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            out.insert(key, sanitize_json_for_log(child));
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr.iter().map(sanitize_json_for_log).collect();
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_text_for_log(s).as_str());
    }

    v.to_owned()
}

pub fn truncate_text_for_log(s: &str) -> String {
    let total = s.chars().count();
    if total <= MAX_LOG_STRING_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX_LOG_STRING_CHARS).collect();
    format!(
        "{head}...[TRUNCATED: {} chars]",
        total - MAX_LOG_STRING_CHARS
    )
}
