use super::*;
use epub::doc::EpubDoc;
use std::io::BufReader;
use std::fs::File;
use std::path::PathBuf;

use super::html_utils::{body_inner, rewrite_images, strip_scripts, tolerate_missing};
use crate::asset_manager::{is_relocatable, normalize_reference};

/// EPUB 解析器
///
/// 按 spine 顺序读取所有章节，去掉脚本与样式，
/// 章节中的图片写入公开目录后改写引用
#[derive(Clone, Default)]
pub struct EpubParser;

impl EpubParser {
    /// 创建新的 EPUB 解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 处理单个章节
    ///
    /// # 参数
    /// - `doc`: EPUB 文档（用于按路径读取图片资源）
    /// - `chapter_path`: 章节在包内的路径
    /// - `html`: 章节 XHTML
    /// - `ctx`: 解析上下文
    ///
    /// # 返回
    /// 章节 body 内的标记
    fn process_chapter(
        &self,
        doc: &mut EpubDoc<BufReader<File>>,
        chapter_path: &Path,
        html: &str,
        ctx: &mut ParseContext<'_>,
    ) -> IngestResult<String> {
        let chapter_dir = chapter_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let cleaned = strip_scripts(html);

        let rewritten = rewrite_images(&cleaned, |reference| {
            if !is_relocatable(reference, ctx.relocator.url_base()) {
                return Ok(None);
            }
            let result = self.load_image(doc, &chapter_dir, reference, ctx);
            tolerate_missing(reference, result)
        })?;

        Ok(body_inner(&rewritten))
    }

    /// 读取包内图片并重定位
    fn load_image(
        &self,
        doc: &mut EpubDoc<BufReader<File>>,
        chapter_dir: &Path,
        reference: &str,
        ctx: &mut ParseContext<'_>,
    ) -> IngestResult<String> {
        let resource_path: PathBuf = normalize_reference(chapter_dir, reference)
            .ok_or_else(|| IngestError::corrupt(format!("图片路径越界: {}", reference)))?;

        let data = doc
            .get_resource_by_path(&resource_path)
            .ok_or_else(|| IngestError::corrupt(format!("EPUB 中找不到图片: {}", resource_path.display())))?;

        ctx.relocator.relocate_bytes(&data, reference)
    }
}

impl Parser for EpubParser {
    fn name(&self) -> &'static str {
        "epub"
    }

    fn parse(&self, file_path: &Path, ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        if !file_path.exists() {
            return Err(IngestError::io(
                file_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "文件不存在"),
            ));
        }

        // 打开 EPUB 文件
        let mut doc = EpubDoc::new(file_path)
            .map_err(|e| IngestError::corrupt(format!("EPUB 解析错误: {}", e)))?;

        let mut chapters = Vec::new();

        // 获取章节数量
        let num_chapters = doc.get_num_chapters();

        for i in 0..num_chapters {
            // 设置当前章节
            if !doc.set_current_chapter(i) {
                continue;
            }

            // 获取章节内容
            let Some((html_content, _mime)) = doc.get_current_str() else {
                warn!(chapter = i, "章节内容无法读取，跳过");
                continue;
            };
            let chapter_path = doc.get_current_path().unwrap_or_default();

            let markup = self.process_chapter(&mut doc, &chapter_path, &html_content, ctx)?;
            if !markup.trim().is_empty() {
                chapters.push(markup);
            }
        }

        debug!(chapters = chapters.len(), total = num_chapters, "EPUB 章节读取完成");
        Ok(chapters.join("\n"))
    }
}
