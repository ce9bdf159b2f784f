//! 文档段落索引：从文档目录加载文本与 PDF，切块后交给 tantivy 做 BM25 检索。
//!
//! 段落与元数据以 JSON 持久化；tantivy 索引只在内存中，加载时从段落重建。

use crate::rag::chunker::TextSplitter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    TantivyDocument,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::{Field, IndexRecordOption, STORED, Schema, TextFieldIndexing, TextOptions, Value},
    tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer},
};
use thiserror::Error;

const SUPPORTED_EXTENSIONS: [&str; 3] = ["pdf", "txt", "md"];

// 纯文本里用换页符分页。
const PAGE_BREAK: char = '\u{c}';

const TOKENIZER: &str = "passage_stem";
const WRITER_MEMORY_BUDGET: usize = 15_000_000;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0}")]
    NotFound(String),

    #[error("chunk_overlap ({chunk_overlap}) 必须小于 chunk_size ({chunk_size})")]
    InvalidChunking {
        chunk_size: usize,
        chunk_overlap: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("索引文件格式错误: {0}")]
    Json(#[from] sonic_rs::Error),

    #[error("全文索引错误: {0}")]
    Search(#[from] tantivy::TantivyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    pub source: String,
    pub page: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub documents: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Hit<'a> {
    pub passage: &'a Passage,
    pub score: f32,
}

#[derive(Serialize)]
struct SavedIndexRef<'a> {
    meta: &'a IndexMeta,
    passages: &'a [Passage],
}

#[derive(Deserialize)]
struct SavedIndex {
    meta: IndexMeta,
    passages: Vec<Passage>,
}

pub struct PassageIndex {
    meta: IndexMeta,
    passages: Vec<Passage>,
    lexical: LexicalIndex,
}

impl fmt::Debug for PassageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassageIndex")
            .field("meta", &self.meta)
            .field("passages", &self.passages.len())
            .finish()
    }
}

/// 内存中的 tantivy 索引，文档号即段落下标。
struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    ordinal: Field,
    body: Field,
}

impl LexicalIndex {
    fn build(passages: &[Passage]) -> Result<Self, IndexError> {
        let mut builder = Schema::builder();
        let ordinal = builder.add_u64_field("ordinal", STORED);
        let body_opts = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        let body = builder.add_text_field("body", body_opts);

        let index = Index::create_in_ram(builder.build());
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(Stemmer::new(Language::English))
            .build();
        index.tokenizers().register(TOKENIZER, analyzer);

        let mut writer: IndexWriter = index.writer(WRITER_MEMORY_BUDGET)?;
        for (i, p) in passages.iter().enumerate() {
            writer.add_document(doc!(
                ordinal => i as u64,
                body => spaced_cjk(&p.content).into_owned(),
            ))?;
        }
        writer.commit()?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            ordinal,
            body,
        })
    }

    /// 返回 (段落下标, BM25 得分)，按得分降序。
    fn search(&self, query: &str, limit: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        let query = spaced_cjk(query);
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.body]);
        let (query, _errors) = parser.parse_query_lenient(&query);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(i) = doc.get_first(self.ordinal).and_then(|v| v.as_u64()) {
                out.push((i as usize, score));
            }
        }
        Ok(out)
    }
}

/// SimpleTokenizer 会把连续的 CJK 字符当成一个词；先用空格隔开，让它们逐字成词。
fn spaced_cjk(text: &str) -> Cow<'_, str> {
    if !text.chars().any(is_cjk) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if is_cjk(c) {
            out.push(' ');
            out.push(c);
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF)
}

impl PassageIndex {
    pub fn from_passages(passages: Vec<Passage>, meta: IndexMeta) -> Result<Self, IndexError> {
        let lexical = LexicalIndex::build(&passages)?;
        Ok(Self {
            meta,
            passages,
            lexical,
        })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// 按 BM25 得分取前 k 个段落；与查询没有任何共同词的段落不返回。
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<Hit<'_>>, IndexError> {
        let hits = self
            .lexical
            .search(query, k)?
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(i, score)| {
                self.passages.get(i).map(|passage| Hit { passage, score })
            })
            .collect();
        Ok(hits)
    }

    pub async fn build(docs_dir: &Path, splitter: TextSplitter) -> Result<Self, IndexError> {
        let listing = list_documents(docs_dir).await?;
        if !listing.folder_exists {
            return Err(IndexError::NotFound(format!(
                "文档目录 '{}' 不存在",
                docs_dir.display()
            )));
        }
        for name in &listing.unsupported {
            tracing::warn!("跳过不支持的文档: {name}");
        }
        if listing.files.is_empty() {
            return Err(IndexError::NotFound(format!(
                "文档目录 '{}' 中没有可索引的 .pdf/.txt/.md 文件",
                docs_dir.display()
            )));
        }

        let mut passages = Vec::new();
        let mut documents = 0;
        for name in &listing.files {
            let Some(pages) = load_pages(&docs_dir.join(name), name).await? else {
                continue;
            };
            documents += 1;
            let before = passages.len();
            for (page, page_text) in pages.iter().enumerate() {
                for content in splitter.split(page_text) {
                    passages.push(Passage {
                        content,
                        source: name.clone(),
                        page,
                    });
                }
            }
            tracing::info!(
                "已加载文档 {name}（{} 页，{} 个段落）",
                pages.len(),
                passages.len() - before
            );
        }
        if documents == 0 {
            return Err(IndexError::NotFound(format!(
                "文档目录 '{}' 中没有能成功解析的文档",
                docs_dir.display()
            )));
        }

        tracing::info!(
            chunk_size = splitter.chunk_size(),
            chunk_overlap = splitter.chunk_overlap(),
            "文档切分完成，共 {} 个段落",
            passages.len()
        );

        let meta = IndexMeta {
            chunk_size: splitter.chunk_size(),
            chunk_overlap: splitter.chunk_overlap(),
            documents,
            built_at: Utc::now(),
        };
        Self::from_passages(passages, meta)
    }

    pub async fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = sonic_rs::to_vec(&SavedIndexRef {
            meta: &self.meta,
            passages: &self.passages,
        })?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, IndexError> {
        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(format!(
                    "索引文件 '{}' 不存在",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let saved: SavedIndex = sonic_rs::from_slice(&data)?;
        Self::from_passages(saved.passages, saved.meta)
    }

    /// 磁盘上已有索引时直接加载，除非 `force`；否则重新构建并保存。
    pub async fn build_or_load(
        docs_dir: &Path,
        index_path: &Path,
        splitter: TextSplitter,
        force: bool,
    ) -> Result<Self, IndexError> {
        if !force && tokio::fs::try_exists(index_path).await.unwrap_or(false) {
            tracing::info!("发现已有索引 {}，直接加载", index_path.display());
            return Self::load(index_path).await;
        }

        let index = Self::build(docs_dir, splitter).await?;
        index.save(index_path).await?;
        tracing::info!("索引已保存到 {}", index_path.display());
        Ok(index)
    }
}

/// 读取一个文档的逐页文本。PDF 解析失败时记录警告并跳过该文档（返回 `None`）。
async fn load_pages(path: &Path, name: &str) -> Result<Option<Vec<String>>, IndexError> {
    if !has_extension(path, "pdf") {
        let text = tokio::fs::read_to_string(path).await?;
        return Ok(Some(text.split(PAGE_BREAK).map(str::to_string).collect()));
    }

    let bytes = tokio::fs::read(path).await?;
    // pdf-extract 是同步解析，遇到异常字体时可能 panic。
    let extracted =
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
            .await;
    match extracted {
        Ok(Ok(pages)) => Ok(Some(pages)),
        Ok(Err(e)) => {
            tracing::warn!("解析 PDF {name} 失败，已跳过: {e}");
            Ok(None)
        }
        Err(e) => {
            tracing::warn!("解析 PDF {name} 时异常退出，已跳过: {e}");
            Ok(None)
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    extension_of(path) == ext
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocListing {
    pub folder_exists: bool,
    pub document_count: usize,
    pub files: Vec<String>,
    pub unsupported: Vec<String>,
}

/// 列出文档目录下的普通文件（按文件名排序），区分可索引与不支持的格式。
pub async fn list_documents(docs_dir: &Path) -> Result<DocListing, IndexError> {
    let mut entries = match tokio::fs::read_dir(docs_dir).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DocListing::default()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    let mut unsupported = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path: PathBuf = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let ext = extension_of(&path);
        if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            files.push(name.to_string());
        } else {
            unsupported.push(name.to_string());
        }
    }
    files.sort();
    unsupported.sort();

    Ok(DocListing {
        folder_exists: true,
        document_count: files.len(),
        files,
        unsupported,
    })
}
