use super::*;
use pulldown_cmark::{html, Options, Parser as MdParser};
use std::fs;

use super::html_utils::{rewrite_images, strip_scripts, tolerate_missing};
use crate::asset_manager::is_relocatable;

/// Markdown 解析器
///
/// 使用 pulldown-cmark 渲染为 HTML，相对路径的图片从文档所在目录重定位
#[derive(Clone, Default)]
pub struct MarkdownParser;

impl MarkdownParser {
    /// 创建新的 Markdown 解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 渲染 Markdown 为 HTML
    fn render(&self, content: &str) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TABLES);

        let parser = MdParser::new_ext(content, options);
        let mut output = String::with_capacity(content.len() * 3 / 2);
        html::push_html(&mut output, parser);
        strip_scripts(&output)
    }
}

impl Parser for MarkdownParser {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn parse(&self, file_path: &Path, ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        let bytes = fs::read(file_path).map_err(|e| IngestError::io(file_path, e))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| IngestError::EncodingUndetected { tried: "UTF-8".to_string() })?;

        let root = file_path.parent().unwrap_or_else(|| Path::new("."));
        let rendered = self.render(&content);

        rewrite_images(&rendered, |reference| {
            if !is_relocatable(reference, ctx.relocator.url_base()) {
                return Ok(None);
            }
            let result = ctx.relocator.relocate_file(root, reference);
            tolerate_missing(reference, result)
        })
    }
}
