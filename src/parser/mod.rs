use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::asset_manager::ImageRelocator;
use crate::config::TextConfig;
use crate::error::{IngestError, IngestResult};

// 子模块声明
pub mod html_utils;
pub mod txt_parser;
pub mod md_parser;
pub mod docx_parser;
pub mod epub_parser;
pub mod mobi_parser;
pub mod pdf_parser;

/// 文档格式标签
///
/// 由上传层根据文件扩展名确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// 纯文本（支持轻量 Markdown 语法）
    PlainText,
    /// Markdown 文档
    Markdown,
    /// Word 文档（docx）
    Docx,
    /// EPUB 电子书
    Epub,
    /// MOBI / AZW 电子书
    Mobi,
    /// PDF 文档
    Pdf,
}

impl FormatTag {
    /// 根据扩展名确定格式
    pub fn from_extension(ext: &str) -> IngestResult<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "text" => Ok(Self::PlainText),
            "md" | "markdown" => Ok(Self::Markdown),
            "docx" => Ok(Self::Docx),
            "epub" => Ok(Self::Epub),
            "mobi" | "azw" | "azw3" => Ok(Self::Mobi),
            "pdf" => Ok(Self::Pdf),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }

    /// 根据文件路径确定格式
    pub fn from_path(file_path: &Path) -> IngestResult<Self> {
        let ext = file_path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| IngestError::UnsupportedFormat("无法识别文件扩展名".to_string()))?;
        Self::from_extension(ext)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "txt",
            Self::Markdown => "md",
            Self::Docx => "docx",
            Self::Epub => "epub",
            Self::Mobi => "mobi",
            Self::Pdf => "pdf",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s)
    }
}

/// 解析上下文
///
/// 解析过程中发现的图片交给重定位器处理
pub struct ParseContext<'a> {
    pub relocator: &'a mut ImageRelocator,
}

/// Parser trait
///
/// 每个实现是一种解码策略：成功时返回规范化标记，失败时返回带类型的错误。
/// 同一格式可以注册多个策略，按顺序尝试。
pub trait Parser: Send + Sync {
    /// 策略名称（用于日志）
    fn name(&self) -> &'static str;

    /// 解析文件为规范化标记
    ///
    /// # 参数
    /// - `file_path`: 要解析的文件路径
    /// - `ctx`: 解析上下文
    fn parse(&self, file_path: &Path, ctx: &mut ParseContext<'_>) -> IngestResult<String>;
}

/// Parser 路由器
///
/// 根据格式标签路由到对应的解码策略列表
pub struct ParserRouter {
    /// 格式到策略列表的映射
    parsers: HashMap<FormatTag, Vec<Box<dyn Parser>>>,
}

impl ParserRouter {
    /// 创建新的路由器实例
    ///
    /// 注册所有可用的解析器
    pub fn new(text: &TextConfig) -> Self {
        let mut parsers: HashMap<FormatTag, Vec<Box<dyn Parser>>> = HashMap::new();

        parsers.insert(
            FormatTag::PlainText,
            vec![Box::new(txt_parser::TxtParser::with_encodings(&text.encodings))],
        );
        parsers.insert(FormatTag::Markdown, vec![Box::new(md_parser::MarkdownParser::new())]);

        // 结构化解析失败时降级为逐段包裹纯文本
        parsers.insert(
            FormatTag::Docx,
            vec![
                Box::new(docx_parser::DocxParser::new()),
                Box::new(docx_parser::DocxPlainParser::new()),
            ],
        );

        parsers.insert(FormatTag::Epub, vec![Box::new(epub_parser::EpubParser::new())]);
        parsers.insert(FormatTag::Mobi, vec![Box::new(mobi_parser::MobiParser::new())]);
        parsers.insert(FormatTag::Pdf, vec![Box::new(pdf_parser::PdfParser::new())]);

        Self { parsers }
    }

    /// 获取格式对应的策略列表
    pub fn route(&self, format: FormatTag) -> IngestResult<&[Box<dyn Parser>]> {
        self.parsers
            .get(&format)
            .map(|p| p.as_slice())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| IngestError::UnsupportedFormat(format.to_string()))
    }

    /// 按顺序尝试各个策略，返回第一个成功的结果
    ///
    /// 只有 CorruptDocument 会继续尝试下一个策略，
    /// 其他错误（编码、读写、持久化）直接返回，避免掩盖无关故障
    pub fn decode(
        &self,
        file_path: &Path,
        format: FormatTag,
        ctx: &mut ParseContext<'_>,
    ) -> IngestResult<String> {
        let strategies = self.route(format)?;
        let mut last_error = None;

        for (index, parser) in strategies.iter().enumerate() {
            match parser.parse(file_path, ctx) {
                Ok(markup) => {
                    debug!(strategy = parser.name(), bytes = markup.len(), "解析完成");
                    return Ok(markup);
                }
                Err(IngestError::CorruptDocument(msg)) if index + 1 < strategies.len() => {
                    warn!(strategy = parser.name(), error = %msg, "解析失败，尝试下一个策略");
                    last_error = Some(IngestError::CorruptDocument(msg));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| IngestError::UnsupportedFormat(format.to_string())))
    }

    /// 检查是否支持指定的格式
    pub fn supports(&self, format: FormatTag) -> bool {
        self.parsers.get(&format).is_some_and(|p| !p.is_empty())
    }
}

impl Default for ParserRouter {
    fn default() -> Self {
        Self::new(&TextConfig::default())
    }
}
