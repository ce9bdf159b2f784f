use crate::config::Config;
use crate::credential::types::ApiKey;
use crate::gemini::types::{Content, GenerationConfig, Part, Request, Response, SystemInstruction};
use crate::llm::error::BackendError;
use crate::llm::{ChatBackend, ChatMessage, ChatResponse, Role};
use crate::logging;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use sonic_rs::JsonValueTrait;
use std::time::Duration;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini `generateContent` 客户端。
///
/// 不做任何内部重试：失败直接返回，由调用管理器决定是否换 Key。
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    model: String,
    temperature: f32,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            api_base: cfg.gemini_api_base.trim_end_matches('/').to_string(),
            model: cfg.gemini_model.clone(),
            temperature: cfg.gemini_temperature,
            user_agent: cfg.user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    pub fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        )
    }

    pub fn build_headers(&self, key: &ApiKey) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("vanilla-rag")),
        );
        h.insert(
            HeaderName::from_static(API_KEY_HEADER),
            HeaderValue::from_str(key.secret()).unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    pub async fn generate_content(
        &self,
        key: &ApiKey,
        req: &Request,
    ) -> Result<Response, BackendError> {
        let url = self.generate_url();
        let body = sonic_rs::to_vec(req)?;
        let headers = self.build_headers(key);
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_request_raw("POST", &url, &headers, &body);
            } else {
                logging::backend_request("POST", &url, &headers, &body);
            }
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_response_raw(status.as_u16(), start.elapsed(), &bytes);
            } else {
                logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
            }
        }
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<Response>(&bytes)?)
    }
}

impl ChatBackend for GeminiClient {
    async fn generate(
        &self,
        key: &ApiKey,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, BackendError> {
        let req = to_gemini_request(messages, self.temperature);
        let resp = self.generate_content(key, &req).await?;
        match resp.text() {
            Some(content) => Ok(ChatResponse { content }),
            None => Err(BackendError::Malformed(describe_empty_response(&resp))),
        }
    }
}

/// system 消息合并进 systemInstruction；assistant 对应 Gemini 的 `model` 角色。
pub fn to_gemini_request(messages: &[ChatMessage], temperature: f32) -> Request {
    let mut system_parts = Vec::new();
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());

    for m in messages {
        let role = match m.role {
            Role::System => {
                if !m.content.is_empty() {
                    system_parts.push(Part::text(m.content.clone()));
                }
                continue;
            }
            Role::User => "user",
            Role::Assistant => "model",
        };

        // 相邻同角色消息合并为一条，避免后端拒绝连续同角色轮次。
        if let Some(last) = contents.last_mut()
            && last.role == role
        {
            last.parts.push(Part::text(m.content.clone()));
            continue;
        }
        contents.push(Content {
            role: role.to_string(),
            parts: vec![Part::text(m.content.clone())],
        });
    }

    Request {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: system_parts,
            })
        },
        generation_config: Some(GenerationConfig {
            temperature: Some(temperature),
        }),
    }
}

fn describe_empty_response(resp: &Response) -> String {
    if let Some(fb) = &resp.prompt_feedback
        && !fb.block_reason.is_empty()
    {
        return format!("prompt blocked: {}", fb.block_reason);
    }
    match resp.candidates.first() {
        None => "no candidates".to_string(),
        Some(c) if !c.finish_reason.is_empty() => {
            format!("empty candidate (finishReason={})", c.finish_reason)
        }
        Some(_) => "empty candidate".to_string(),
    }
}

fn extract_error_details(status: u16, body: &[u8]) -> BackendError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        details: Vec<ErrDetail>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ErrDetail {
        #[serde(rename = "@type", default)]
        ty: String,
        #[serde(default)]
        retry_delay: String,
    }

    let mut out_status = status;
    let mut message = String::from_utf8_lossy(body).trim().to_string();
    if message.is_empty() {
        message = "Unknown error".to_string();
    }
    let mut retry_delay = Duration::ZERO;

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        if err.status.eq_ignore_ascii_case("RESOURCE_EXHAUSTED") {
            out_status = 429;
        }

        if let Some(code) = err.code {
            if let Some(s) = code.as_str() {
                match s.to_uppercase().as_str() {
                    "RESOURCE_EXHAUSTED" => out_status = 429,
                    "INTERNAL" => out_status = 500,
                    "UNAUTHENTICATED" => out_status = 401,
                    _ => {}
                }
            } else if let Some(i) = code.as_i64()
                && i > 0
                && i <= u16::MAX as i64
            {
                out_status = i as u16;
            }
        }

        for d in err.details {
            if d.ty.contains("RetryInfo")
                && let Some(delay) = parse_retry_delay_seconds(&d.retry_delay)
            {
                retry_delay = delay;
            }
        }
    }

    BackendError::Http {
        status: out_status,
        message,
        retry_delay,
    }
}

fn parse_retry_delay_seconds(s: &str) -> Option<Duration> {
    // 形如 "2s" / "2.5s" / "0.123s"
    let s = s.trim();
    let s = s.strip_suffix('s')?;
    let secs: f64 = s.trim().parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_details_maps_resource_exhausted_to_429() {
        let body = r#"{
            "error": {
                "code": 429,
                "message": "You exceeded your current quota, please check your plan and billing details.",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "17s"
                    }
                ]
            }
        }"#;

        let err = extract_error_details(429, body.as_bytes());
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(17)));
        assert!(err.to_string().contains("current quota"));
    }

    #[test]
    fn extract_error_details_keeps_plain_body_when_not_json() {
        let err = extract_error_details(502, b"Bad Gateway");
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("Bad Gateway"));
        assert_eq!(err.retry_delay(), None);
    }

    #[test]
    fn extract_error_details_reads_string_status_code() {
        let body = r#"{"error":{"code":"UNAUTHENTICATED","message":"API key not valid"}}"#;
        let err = extract_error_details(400, body.as_bytes());
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn parse_retry_delay_accepts_fractional_seconds() {
        assert_eq!(
            parse_retry_delay_seconds("2.5s"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(parse_retry_delay_seconds("abc"), None);
        assert_eq!(parse_retry_delay_seconds("-1s"), None);
    }

    #[test]
    fn to_gemini_request_splits_system_and_maps_roles() {
        let msgs = vec![
            ChatMessage::system("be helpful"),
            ChatMessage::user("q1"),
            ChatMessage {
                role: Role::Assistant,
                content: "a1".to_string(),
            },
            ChatMessage::user("q2"),
            ChatMessage::user("q2 follow-up"),
        ];
        let req = to_gemini_request(&msgs, 0.7);

        let sys = req.system_instruction.unwrap();
        assert_eq!(sys.parts[0].text, "be helpful");
        let roles: Vec<&str> = req.contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(req.contents[2].parts.len(), 2);
        assert_eq!(req.generation_config.unwrap().temperature, Some(0.7));
    }

    #[test]
    fn request_serializes_with_camel_case_fields() {
        let req = to_gemini_request(&[ChatMessage::system("s"), ChatMessage::user("u")], 0.2);
        let v: serde_json::Value = serde_json::from_slice(&sonic_rs::to_vec(&req).unwrap()).unwrap();
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "s");
        assert_eq!(v["contents"][0]["role"], "user");
        assert!(v["generationConfig"]["temperature"].is_number());
        assert_eq!(v["generationConfig"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn response_text_skips_thoughts_and_reports_empty() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Hello "},
                    {"text": "world"}
                ]},
                "finishReason": "STOP"
            }]
        }"#;
        let resp: Response = sonic_rs::from_str(body).unwrap();
        assert_eq!(resp.text().as_deref(), Some("Hello world"));

        let blocked: Response =
            sonic_rs::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(blocked.text(), None);
        assert_eq!(describe_empty_response(&blocked), "prompt blocked: SAFETY");
    }
}
