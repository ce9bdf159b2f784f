//! 可选的网页检索增强。失败只记日志，返回空结果，不影响本地检索问答。

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub const DUCKDUCKGO_API_BASE: &str = "https://api.duckduckgo.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub body: String,
    pub href: String,
}

pub trait WebSearch: Send + Sync {
    fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> impl Future<Output = Vec<WebResult>> + Send;
}

/// DuckDuckGo Instant Answer API。
#[derive(Debug, Clone)]
pub struct DuckDuckGo {
    http: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Default, Deserialize)]
struct InstantAnswer {
    #[serde(rename = "Heading", default)]
    heading: String,
    #[serde(rename = "AbstractText", default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(rename = "RelatedTopics", default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
struct RelatedTopic {
    #[serde(rename = "Text", default)]
    text: String,
    #[serde(rename = "FirstURL", default)]
    first_url: String,
    // 分组话题：{"Name": "...", "Topics": [...]}
    #[serde(rename = "Topics", default)]
    topics: Vec<RelatedTopic>,
}

impl DuckDuckGo {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder().user_agent(cfg.user_agent.clone());
        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        Ok(Self {
            http: builder.build()?,
            api_base: DUCKDUCKGO_API_BASE.to_string(),
        })
    }

    pub fn search_url(&self, query: &str) -> String {
        format!(
            "{}/?q={}&format=json&no_html=1&skip_disambig=1",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(query)
        )
    }

    async fn fetch(&self, query: &str) -> Result<InstantAnswer, anyhow::Error> {
        let resp = self.http.get(self.search_url(query)).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            anyhow::bail!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&bytes));
        }
        Ok(sonic_rs::from_slice(&bytes)?)
    }
}

impl WebSearch for DuckDuckGo {
    async fn search(&self, query: &str, max_results: usize) -> Vec<WebResult> {
        if max_results == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        match self.fetch(query).await {
            Ok(answer) => to_results(answer, max_results),
            Err(e) => {
                tracing::warn!("网页检索失败: {e:#}");
                Vec::new()
            }
        }
    }
}

fn to_results(answer: InstantAnswer, max_results: usize) -> Vec<WebResult> {
    let mut out = Vec::new();
    if !answer.abstract_text.trim().is_empty() {
        out.push(WebResult {
            title: if answer.heading.is_empty() {
                "No title".to_string()
            } else {
                answer.heading
            },
            body: answer.abstract_text,
            href: answer.abstract_url,
        });
    }

    let mut stack: Vec<RelatedTopic> = answer.related_topics.into_iter().rev().collect();
    while out.len() < max_results {
        let Some(topic) = stack.pop() else {
            break;
        };
        if !topic.topics.is_empty() {
            stack.extend(topic.topics.into_iter().rev());
            continue;
        }
        if topic.text.trim().is_empty() {
            continue;
        }
        // Text 形如 "Rust (programming language) - A multi-paradigm ..."
        let title = topic
            .text
            .split_once(" - ")
            .map(|(t, _)| t.to_string())
            .unwrap_or_else(|| topic.text.clone());
        out.push(WebResult {
            title,
            body: topic.text,
            href: topic.first_url,
        });
    }

    out.truncate(max_results);
    out
}
