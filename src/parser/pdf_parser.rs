use super::*;
use std::fs;

use crate::markup::wrap_paragraph;

/// PDF 解析器（基础版）
///
/// 只提取每页文本，不保留版式；扫描版 PDF 得到空内容
#[derive(Clone, Default)]
pub struct PdfParser;

impl PdfParser {
    /// 创建新的 PDF 解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 把提取出的文本转换为段落块
    ///
    /// 按分页符切分页面，每页内根据空行分割段落
    ///
    /// # 参数
    /// - `text`: 文本内容
    fn split_into_blocks(&self, text: &str) -> Vec<String> {
        text.replace("\r\n", "\n")
            .split('\u{c}')
            .flat_map(|page| {
                page.split("\n\n")
                    .map(|p| p.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|p| !p.is_empty())
            .map(|p| wrap_paragraph(&p))
            .collect()
    }
}

impl Parser for PdfParser {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn parse(&self, file_path: &Path, _ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        // 读取文件字节
        let bytes = fs::read(file_path).map_err(|e| IngestError::io(file_path, e))?;

        // 提取 PDF 文本（部分畸形文件会让提取库 panic）
        let text = match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&bytes)) {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(IngestError::corrupt(format!("PDF 解析失败: {}", e))),
            Err(_) => return Err(IngestError::corrupt("PDF 解析时发生异常")),
        };

        // 扫描版 PDF 没有文本层，结果为空内容而不是错误
        if text.trim().is_empty() {
            warn!(file = %file_path.display(), "PDF 没有可提取的文本，可能是扫描版");
            return Ok(String::new());
        }

        Ok(self.split_into_blocks(&text).join("\n"))
    }
}
