//! 递归字符切分：优先按段落切，段落过长再按行、按词，最后按字符。
//!
//! 长度一律按 Unicode 字符数计算。

use crate::rag::index::IndexError;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IndexError> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(IndexError::InvalidChunking {
                chunk_size,
                chunk_overlap,
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // 选第一个在文本中出现的分隔符；"" 总是命中。
        let (pos, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len().saturating_sub(1), ""));
        let rest = &separators[(pos + 1).min(separators.len())..];

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut out = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                out.extend(self.merge(&pending, separator));
                pending.clear();
            }
            if rest.is_empty() {
                out.push(piece.to_string());
            } else {
                out.extend(self.split_with(piece, rest));
            }
        }
        if !pending.is_empty() {
            out.extend(self.merge(&pending, separator));
        }
        out
    }

    /// 把小片段拼回不超过 chunk_size 的块，相邻块之间保留至多 chunk_overlap 的重叠。
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joined_sep = if current.is_empty() { 0 } else { sep_len };
            if total + len + joined_sep > self.chunk_size && !current.is_empty() {
                push_joined(&mut docs, &current, separator);

                loop {
                    let joined_sep = if current.is_empty() { 0 } else { sep_len };
                    let too_big = total > 0 && total + len + joined_sep > self.chunk_size;
                    if total <= self.chunk_overlap && !too_big {
                        break;
                    }
                    let Some(front) = current.pop_front() else {
                        break;
                    };
                    let dropped_sep = if current.is_empty() { 0 } else { sep_len };
                    total -= char_len(front) + dropped_sep;
                }
            }
            let joined_sep = if current.is_empty() { 0 } else { sep_len };
            total += len + joined_sep;
            current.push_back(piece);
        }
        push_joined(&mut docs, &current, separator);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &std::collections::VecDeque<&str>, sep: &str) {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
