//! 导入流程
//!
//! 封面 → 解析 → 切分 → 保存段落。任一步骤失败时回滚本次导入
//! 已经创建的段落、封面与图片文件，返回原始错误。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::asset_manager::ImageRelocator;
use crate::config::AppConfig;
use crate::cover::{CoverExtractor, CoverImage, ManualCover};
use crate::error::IngestResult;
use crate::markup::recount;
use crate::parser::{FormatTag, ParseContext, ParserRouter};
use crate::segmenter::Segmenter;
use crate::store::ParagraphStore;

/// 尚未保存的段落
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParagraphDraft {
    pub content: String,
    pub word_count: usize,
}

/// 导入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub book_id: i64,
    pub paragraph_count: usize,
    pub cover_url: Option<String>,
    /// 本次导入涉及的图片数量（按内容去重）
    pub images: usize,
}

/// 导入流水线
pub struct IngestionPipeline {
    router: ParserRouter,
    segmenter: Segmenter,
    covers: CoverExtractor,
    images_root: PathBuf,
    images_prefix: String,
    store: Arc<dyn ParagraphStore>,
}

impl IngestionPipeline {
    pub fn new(config: &AppConfig, store: Arc<dyn ParagraphStore>) -> Self {
        Self {
            router: ParserRouter::new(&config.text),
            segmenter: Segmenter::new(config.segment),
            covers: CoverExtractor::new(
                config.storage.covers_root(),
                config.storage.covers_url_prefix(),
            ),
            images_root: config.storage.images_root(),
            images_prefix: config.storage.images_url_prefix(),
            store,
        }
    }

    /// 解析并切分文档，不写入数据库
    ///
    /// 图片仍会写入 `{images_root}/{book_id}`
    ///
    /// # 参数
    /// - `book_id`: 图片归属的书籍
    /// - `file_path`: 文档路径
    /// - `format`: 格式标签
    pub fn ingest(
        &self,
        book_id: i64,
        file_path: &Path,
        format: FormatTag,
    ) -> IngestResult<Vec<ParagraphDraft>> {
        let mut relocator = self.relocator(book_id);
        self.normalize(file_path, format, &mut relocator)
    }

    /// 导入书籍
    ///
    /// 段落序号从 1 开始连续编号。失败时执行补偿清理，
    /// 清理步骤本身的失败只记录日志
    pub fn ingest_book(
        &self,
        book_id: i64,
        file_path: &Path,
        format: FormatTag,
        manual_cover: Option<&ManualCover>,
    ) -> IngestResult<IngestReport> {
        info!(book_id, file = %file_path.display(), %format, "开始导入");

        let mut relocator = self.relocator(book_id);
        let cover = self.covers.extract(book_id, file_path, format, manual_cover);
        let mut created = Vec::new();

        let result = self
            .normalize(file_path, format, &mut relocator)
            .and_then(|drafts| self.persist(book_id, &drafts, &relocator, &mut created));

        match result {
            Ok(paragraph_count) => {
                let report = IngestReport {
                    book_id,
                    paragraph_count,
                    cover_url: cover.map(|c| c.url),
                    images: relocator.assets().len(),
                };
                info!(book_id, paragraphs = paragraph_count, images = report.images, "导入完成");
                Ok(report)
            }
            Err(e) => {
                warn!(book_id, error = %e, "导入失败，开始回滚");
                self.compensate(book_id, &created, cover.as_ref(), &mut relocator);
                Err(e)
            }
        }
    }

    fn relocator(&self, book_id: i64) -> ImageRelocator {
        ImageRelocator::new(book_id, &self.images_root, &self.images_prefix)
    }

    fn normalize(
        &self,
        file_path: &Path,
        format: FormatTag,
        relocator: &mut ImageRelocator,
    ) -> IngestResult<Vec<ParagraphDraft>> {
        let mut ctx = ParseContext { relocator };
        let markup = self.router.decode(file_path, format, &mut ctx)?;

        Ok(self
            .segmenter
            .segment(&markup)
            .into_iter()
            .map(|content| ParagraphDraft {
                word_count: recount(&content),
                content,
            })
            .collect())
    }

    /// 保存段落，已创建的段落 ID 写入 `created`（失败时用于回滚）
    fn persist(
        &self,
        book_id: i64,
        drafts: &[ParagraphDraft],
        relocator: &ImageRelocator,
        created: &mut Vec<i64>,
    ) -> IngestResult<usize> {
        for (index, draft) in drafts.iter().enumerate() {
            let id = self.store.create_paragraph(
                book_id,
                index as i64 + 1,
                &draft.content,
                draft.word_count,
            )?;
            created.push(id);
        }
        self.store.record_images(&relocator.assets())?;
        Ok(drafts.len())
    }

    /// 只撤销本次导入创建的段落，书籍已有的段落保持不变
    fn compensate(
        &self,
        book_id: i64,
        created: &[i64],
        cover: Option<&CoverImage>,
        relocator: &mut ImageRelocator,
    ) {
        match self.store.remove_paragraphs(created) {
            Ok(removed) if removed > 0 => info!(book_id, removed, "已删除段落"),
            Ok(_) => {}
            Err(e) => warn!(book_id, error = %e, "回滚段落失败"),
        }

        if let Some(cover) = cover {
            self.covers.delete(cover);
        }

        let removed = relocator.rollback();
        if removed > 0 {
            info!(book_id, removed, "已删除图片");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_manager::ImageAsset;
    use crate::error::{IngestError, StoreError, StoreResult};
    use crate::parser::epub_parser::tests::{build_epub, xhtml};
    use crate::store::{MemoryStore, Paragraph};
    use std::fs;
    use tempfile::TempDir;

    /// 保存第 `fail_at` 个段落时失败的存储
    struct FailingStore {
        inner: MemoryStore,
        fail_at: i64,
    }

    impl ParagraphStore for FailingStore {
        fn create_paragraph(
            &self,
            book_id: i64,
            sequence: i64,
            content: &str,
            word_count: usize,
        ) -> StoreResult<i64> {
            if sequence == self.fail_at {
                return Err(StoreError::Invalid("写入失败".to_string()));
            }
            self.inner.create_paragraph(book_id, sequence, content, word_count)
        }

        fn list_paragraphs(&self, book_id: i64) -> StoreResult<Vec<Paragraph>> {
            self.inner.list_paragraphs(book_id)
        }

        fn get_paragraph(&self, paragraph_id: i64) -> StoreResult<Option<Paragraph>> {
            self.inner.get_paragraph(paragraph_id)
        }

        fn delete_paragraphs(&self, book_id: i64) -> StoreResult<usize> {
            self.inner.delete_paragraphs(book_id)
        }

        fn remove_paragraphs(&self, paragraph_ids: &[i64]) -> StoreResult<usize> {
            self.inner.remove_paragraphs(paragraph_ids)
        }

        fn update_content(&self, paragraph_id: i64, content: &str) -> StoreResult<()> {
            self.inner.update_content(paragraph_id, content)
        }

        fn record_images(&self, assets: &[ImageAsset]) -> StoreResult<()> {
            self.inner.record_images(assets)
        }
    }

    fn config(dir: &TempDir, low: usize, high: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.segment.low_water = low;
        config.segment.high_water = high;
        config
    }

    fn write_text(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn long_text(blocks: usize) -> String {
        (0..blocks)
            .map(|i| format!("第{}段。{}", i, "内容".repeat(20)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_ingest_book_sequences_contiguous() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), store.clone());
        let path = write_text(&dir, "book.txt", &long_text(20));

        let report = pipeline
            .ingest_book(1, &path, FormatTag::PlainText, None)
            .unwrap();
        assert!(report.paragraph_count > 1);
        assert_eq!(report.cover_url, None);

        let paragraphs = store.list_paragraphs(1).unwrap();
        assert_eq!(paragraphs.len(), report.paragraph_count);
        for (index, paragraph) in paragraphs.iter().enumerate() {
            assert_eq!(paragraph.sequence, index as i64 + 1);
            assert_eq!(paragraph.word_count, recount(&paragraph.content));
        }
    }

    #[test]
    fn test_ingest_drafts_within_bounds() {
        let dir = TempDir::new().unwrap();
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), Arc::new(MemoryStore::new()));
        let path = write_text(&dir, "book.txt", &long_text(30));

        let drafts = pipeline.ingest(1, &path, FormatTag::PlainText).unwrap();
        let (last, rest) = drafts.split_last().unwrap();
        for draft in rest {
            assert!(draft.word_count >= 100 && draft.word_count <= 400);
        }
        assert!(last.word_count <= 400);
    }

    #[test]
    fn test_empty_file_yields_no_paragraphs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), store.clone());
        let path = write_text(&dir, "empty.txt", "");

        let report = pipeline
            .ingest_book(2, &path, FormatTag::PlainText, None)
            .unwrap();
        assert_eq!(report.paragraph_count, 0);
        assert!(store.list_paragraphs(2).unwrap().is_empty());
    }

    #[test]
    fn test_epub_images_and_cover() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(&config(&dir, 10, 4000), store.clone());
        let path = dir.path().join("book.epub");
        build_epub(
            &path,
            &xhtml(r#"<h1>One</h1><p>First chapter text.</p><img src="../images/pic.png"/>"#),
            &xhtml(r#"<p>Second chapter.</p><img src="../images/pic.png"/>"#),
        );

        let report = pipeline.ingest_book(3, &path, FormatTag::Epub, None).unwrap();
        assert_eq!(report.images, 1);
        assert!(report.cover_url.is_some());
        assert_eq!(store.image_count(3).unwrap(), 1);

        let all: String = store
            .list_paragraphs(3)
            .unwrap()
            .into_iter()
            .map(|p| p.content)
            .collect();
        assert!(all.contains("/uploads/images/3/"));
        assert!(!all.contains("../images/pic.png"));
    }

    #[test]
    fn test_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_at: 2,
        });
        let cfg = config(&dir, 10, 4000);
        let pipeline = IngestionPipeline::new(&cfg, store.clone());
        let path = dir.path().join("book.epub");
        build_epub(
            &path,
            &xhtml(r#"<p>First chapter text.</p><img src="../images/pic.png"/>"#),
            &xhtml(r#"<p>Second chapter text.</p>"#),
        );
        let manual = ManualCover {
            data: b"\x89PNG\r\n\x1a\ncover".to_vec(),
            filename: Some("cover.png".to_string()),
        };

        let err = pipeline
            .ingest_book(4, &path, FormatTag::Epub, Some(&manual))
            .unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));

        assert!(store.list_paragraphs(4).unwrap().is_empty());
        let images_dir = cfg.storage.images_root().join("4");
        let leftover = fs::read_dir(&images_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftover, 0);
        let covers = fs::read_dir(cfg.storage.covers_root()).map(|d| d.count()).unwrap_or(0);
        assert_eq!(covers, 0);
    }

    #[test]
    fn test_failed_reimport_keeps_existing_paragraphs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), store.clone());
        let path = write_text(&dir, "a.txt", &long_text(10));

        pipeline.ingest_book(1, &path, FormatTag::PlainText, None).unwrap();
        let before = store.list_paragraphs(1).unwrap();
        assert!(!before.is_empty());

        // 顺序号 1 已存在，第二次导入在第一个段落处失败
        let err = pipeline
            .ingest_book(1, &path, FormatTag::PlainText, None)
            .unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));
        assert_eq!(store.list_paragraphs(1).unwrap(), before);
    }

    #[test]
    fn test_rollback_removes_only_new_paragraphs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_at: 3,
        });
        let existing = store.inner.create_paragraph(7, 100, "<p>旧段落</p>", 3).unwrap();
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), store.clone());
        let path = write_text(&dir, "b.txt", &long_text(20));

        assert!(pipeline.ingest_book(7, &path, FormatTag::PlainText, None).is_err());
        let left = store.list_paragraphs(7).unwrap();
        assert_eq!(left.iter().map(|p| p.id).collect::<Vec<_>>(), vec![existing]);
    }

    #[test]
    fn test_unsupported_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(&config(&dir, 100, 400), store.clone());
        let path = write_text(&dir, "broken.epub", "not a zip");

        let err = pipeline.ingest_book(5, &path, FormatTag::Epub, None).unwrap_err();
        assert!(matches!(err, IngestError::CorruptDocument(_)));
        assert!(store.list_paragraphs(5).unwrap().is_empty());

        assert!(matches!(
            FormatTag::from_path(Path::new("book.xyz")),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }
}
