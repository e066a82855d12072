//! Speed Reader 核心库
//!
//! 文档导入（解析、图片重定位、段落切分）与按段落的后台题目生成。

pub mod asset_manager;
pub mod config;
pub mod cover;
pub mod error;
pub mod ingest;
pub mod markup;
pub mod parser;
pub mod question;
pub mod segmenter;
pub mod store;

pub use config::AppConfig;
pub use error::{GenerationError, IngestError, IngestResult, StoreError, StoreResult};
pub use ingest::{IngestReport, IngestionPipeline, ParagraphDraft};
pub use parser::FormatTag;
pub use question::{StatusResponse, TaskCoordinator};
pub use segmenter::Segmenter;
pub use store::{BookStore, MemoryStore, ParagraphStore, QuestionStore, SqliteStore};
