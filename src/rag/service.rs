//! 检索问答：检索段落 → 拼接上下文 → 经多 Key 调用管理器生成答案。

use crate::config::Config;
use crate::credential::pool::PoolSnapshot;
use crate::llm::error::InvokeError;
use crate::llm::invoker::Invoker;
use crate::llm::{ChatBackend, ChatMessage};
use crate::rag::chunker::TextSplitter;
use crate::rag::index::{DocListing, IndexError, IndexMeta, Passage, PassageIndex, list_documents};
use crate::rag::web::{WebResult, WebSearch};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that answers questions based on the provided context.";
const SYSTEM_PROMPT_WITH_WEB: &str = "You are a helpful assistant that answers questions based on the provided context and optional web results.";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("RAG system not initialized. Please build the index first.")]
    NotReady,

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone)]
pub struct RagSettings {
    pub docs_dir: PathBuf,
    pub index_path: PathBuf,
    pub top_k: usize,
    pub web_search_results: usize,
}

impl RagSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            docs_dir: PathBuf::from(&cfg.docs_dir),
            index_path: PathBuf::from(&cfg.index_path),
            top_k: cfg.top_k,
            web_search_results: cfg.web_search_results,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub rebuild: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub passages: usize,
    pub documents: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub built_at: DateTime<Utc>,
}

impl IndexSummary {
    pub fn new(index: &PassageIndex) -> Self {
        let meta: &IndexMeta = index.meta();
        Self {
            passages: index.len(),
            documents: meta.documents,
            chunk_size: meta.chunk_size,
            chunk_overlap: meta.chunk_overlap,
            built_at: meta.built_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<Passage>,
    pub web_results: Vec<WebResult>,
}

pub struct QueryService<B, W> {
    invoker: Invoker<B>,
    web: W,
    settings: RagSettings,
    index: ArcSwapOption<PassageIndex>,
    // 串行化构建，查询不受影响。
    build_lock: tokio::sync::Mutex<()>,
}

impl<B: ChatBackend, W: WebSearch> QueryService<B, W> {
    pub fn new(invoker: Invoker<B>, web: W, settings: RagSettings) -> Self {
        Self {
            invoker,
            web,
            settings,
            index: ArcSwapOption::empty(),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.index.load().is_some()
    }

    pub fn index(&self) -> Option<Arc<PassageIndex>> {
        self.index.load_full()
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.invoker.pool().snapshot()
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    pub async fn docs_info(&self) -> Result<DocListing, IndexError> {
        list_documents(&self.settings.docs_dir).await
    }

    /// 构建（或加载已有）索引并原子替换当前索引。失败时保留旧索引。
    pub async fn build_index(&self, opts: BuildOptions) -> Result<IndexSummary, IndexError> {
        let splitter = TextSplitter::new(opts.chunk_size, opts.chunk_overlap)?;
        let _guard = self.build_lock.lock().await;

        let index = PassageIndex::build_or_load(
            &self.settings.docs_dir,
            &self.settings.index_path,
            splitter,
            opts.rebuild,
        )
        .await?;
        let summary = IndexSummary::new(&index);
        self.index.store(Some(Arc::new(index)));

        tracing::info!(
            passages = summary.passages,
            documents = summary.documents,
            "RAG 索引就绪"
        );
        Ok(summary)
    }

    pub async fn query(&self, question: &str) -> Result<QueryAnswer, QueryError> {
        let index = self.index.load_full().ok_or(QueryError::NotReady)?;
        let sources = self.retrieve(&index, question)?;
        let context = join_context(&sources);

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(&context, question)),
        ];
        let resp = self.invoker.invoke(&messages).await?;

        Ok(QueryAnswer {
            answer: resp.content,
            sources,
            web_results: Vec::new(),
        })
    }

    pub async fn query_with_web_search(
        &self,
        question: &str,
        use_web_search: bool,
    ) -> Result<QueryAnswer, QueryError> {
        let index = self.index.load_full().ok_or(QueryError::NotReady)?;
        let sources = self.retrieve(&index, question)?;
        let context = join_context(&sources);

        let web_results = if use_web_search {
            self.web
                .search(question, self.settings.web_search_results)
                .await
        } else {
            Vec::new()
        };

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT_WITH_WEB),
            ChatMessage::user(build_web_prompt(&context, &web_results, question)),
        ];
        let resp = self.invoker.invoke(&messages).await?;

        Ok(QueryAnswer {
            answer: resp.content,
            sources,
            web_results,
        })
    }

    fn retrieve(&self, index: &PassageIndex, question: &str) -> Result<Vec<Passage>, QueryError> {
        let hits = index.search(question, self.settings.top_k)?;
        tracing::debug!(hits = hits.len(), "检索完成");
        Ok(hits.into_iter().map(|h| h.passage.clone()).collect())
    }
}

fn join_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Use the following pieces of context to answer the question at the end. \
         The tone should be friendly. If you don't know the answer, just say that you don't know, \
         don't try to make up an answer.\n\nContext:\n{context}\n\nQuestion: {question}\n\nAnswer:"
    )
}

pub fn build_web_prompt(context: &str, web_results: &[WebResult], question: &str) -> String {
    let mut prompt = format!(
        "Use the following pieces of context to answer the question at the end. \
         If you don't know the answer, just say that you don't know, don't try to make up an answer.\
         \n\nContext:\n{context}"
    );
    if !web_results.is_empty() {
        let snippets: Vec<String> = web_results
            .iter()
            .map(|r| {
                let title = if r.title.is_empty() { "No title" } else { &r.title };
                let body = if r.body.is_empty() {
                    "No description"
                } else {
                    &r.body
                };
                format!("- {title}: {body}")
            })
            .collect();
        prompt.push_str("\n\nWeb Search Results:\n");
        prompt.push_str(&snippets.join("\n"));
    }
    prompt.push_str(&format!("\n\nQuestion: {question}\n\nAnswer:"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::pool::KeyPool;
    use crate::credential::quota::{ManualClock, QuotaWindow};
    use crate::llm::Role;
    use crate::llm::error::BackendError;
    use crate::llm::testing::ScriptedBackend;
    use crate::rag::web::testing::FixedWeb;
    use std::time::Duration;

    struct Fixture {
        service: QueryService<ScriptedBackend, FixedWeb>,
        _docs: tempfile::TempDir,
        _store: tempfile::TempDir,
    }

    fn fixture(script: Vec<Result<String, BackendError>>, web: Vec<WebResult>) -> Fixture {
        let docs = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        std::fs::write(
            docs.path().join("rust.md"),
            "Rust guarantees memory safety without a garbage collector.\n\n\
             Cargo is the Rust build tool and package manager.",
        )
        .unwrap();
        std::fs::write(docs.path().join("cooking.txt"), "Bake the bread at 220 degrees.").unwrap();

        let pool = Arc::new(
            KeyPool::new(
                vec!["key-a".to_string(), "key-b".to_string()],
                QuotaWindow {
                    duration: Duration::from_secs(60),
                    max_requests: 10,
                },
                ManualClock::new(),
            )
            .unwrap(),
        );
        let settings = RagSettings {
            docs_dir: docs.path().to_path_buf(),
            index_path: store.path().join("index.json"),
            top_k: 5,
            web_search_results: 3,
        };
        Fixture {
            service: QueryService::new(
                Invoker::new(ScriptedBackend::new(script), pool),
                FixedWeb::new(web),
                settings,
            ),
            _docs: docs,
            _store: store,
        }
    }

    fn opts() -> BuildOptions {
        BuildOptions {
            chunk_size: 60,
            chunk_overlap: 10,
            rebuild: false,
        }
    }

    #[tokio::test]
    async fn query_before_index_is_not_ready() {
        let f = fixture(Vec::new(), Vec::new());
        assert!(!f.service.is_ready());
        assert!(matches!(
            f.service.query("anything").await,
            Err(QueryError::NotReady)
        ));
        assert!(f.service.invoker.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn query_sends_retrieved_context_to_backend() {
        let f = fixture(vec![Ok("Cargo builds Rust code.".into())], Vec::new());
        let summary = f.service.build_index(opts()).await.unwrap();
        assert_eq!(summary.documents, 2);
        assert!(f.service.is_ready());

        let out = f.service.query("What is Cargo in Rust?").await.unwrap();
        assert_eq!(out.answer, "Cargo builds Rust code.");
        assert!(!out.sources.is_empty());
        assert!(out.sources.iter().all(|p| p.source == "rust.md"));
        assert!(out.web_results.is_empty());

        let seen = f.service.invoker.backend().seen();
        let msgs = &seen[0];
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, SYSTEM_PROMPT);
        assert!(msgs[1].content.contains("Cargo is the Rust build tool"));
        assert!(msgs[1].content.ends_with("Question: What is Cargo in Rust?\n\nAnswer:"));
        assert!(!msgs[1].content.contains("Bake the bread"));
    }

    #[tokio::test]
    async fn web_search_results_are_appended_to_prompt() {
        let web = vec![WebResult {
            title: "Rust".to_string(),
            body: "A language empowering everyone.".to_string(),
            href: "https://www.rust-lang.org".to_string(),
        }];
        let f = fixture(Vec::new(), web.clone());
        f.service.build_index(opts()).await.unwrap();

        let out = f
            .service
            .query_with_web_search("rust memory safety", true)
            .await
            .unwrap();
        assert_eq!(out.web_results, web);
        assert_eq!(f.service.web.queries(), vec!["rust memory safety"]);

        let seen = f.service.invoker.backend().seen();
        assert_eq!(seen[0][0].content, SYSTEM_PROMPT_WITH_WEB);
        assert!(
            seen[0][1]
                .content
                .contains("Web Search Results:\n- Rust: A language empowering everyone.")
        );
    }

    #[tokio::test]
    async fn web_search_disabled_skips_lookup() {
        let f = fixture(Vec::new(), Vec::new());
        f.service.build_index(opts()).await.unwrap();
        let out = f
            .service
            .query_with_web_search("bread", false)
            .await
            .unwrap();
        assert!(out.web_results.is_empty());
        assert!(f.service.web.queries().is_empty());
    }

    #[tokio::test]
    async fn invalid_chunking_keeps_previous_index() {
        let f = fixture(Vec::new(), Vec::new());
        f.service.build_index(opts()).await.unwrap();
        let err = f
            .service
            .build_index(BuildOptions {
                chunk_size: 10,
                chunk_overlap: 10,
                rebuild: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidChunking { .. }));
        assert!(f.service.is_ready());
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_invoke_error() {
        let f = fixture(
            vec![
                Err(crate::llm::testing::http_error(500, "boom")),
                Err(crate::llm::testing::http_error(503, "down")),
            ],
            Vec::new(),
        );
        f.service.build_index(opts()).await.unwrap();
        let err = f.service.query("rust").await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Invoke(InvokeError::Backend(BackendError::Http { status: 503, .. }))
        ));
    }

    #[test]
    fn web_prompt_without_results_has_no_web_section() {
        let p = build_web_prompt("ctx", &[], "q?");
        assert!(!p.contains("Web Search Results"));
        assert!(p.ends_with("Context:\nctx\n\nQuestion: q?\n\nAnswer:"));
    }

    #[test]
    fn context_is_joined_with_separator() {
        let p = |c: &str| Passage {
            content: c.to_string(),
            source: "a.txt".to_string(),
            page: 0,
        };
        assert_eq!(join_context(&[p("one"), p("two")]), "one\n\n---\n\ntwo");
    }
}
