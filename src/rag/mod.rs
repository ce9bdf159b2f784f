//! 检索增强问答：文档切分、段落索引、网页检索与问答服务。

pub mod chunker;
pub mod index;
pub mod service;
pub mod web;
