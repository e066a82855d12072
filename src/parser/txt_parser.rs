use super::*;
use encoding_rs::*;
use regex::Regex;
use std::fs;

/// TXT 解析器
///
/// 按候选编码顺序解码纯文本，并把轻量 Markdown 语法转换为块级标记：
/// `#` 标题、空行分隔的段落、`**粗体**` / `__粗体__`、`*斜体*` / `_斜体_`
#[derive(Clone)]
pub struct TxtParser {
    /// 候选编码（按顺序尝试）
    encodings: Vec<&'static Encoding>,
    heading_regex: Regex,
    bold_regexes: [Regex; 2],
    italic_regexes: [Regex; 2],
}

impl TxtParser {
    /// 创建新的 TXT 解析器实例（默认候选编码）
    pub fn new() -> Self {
        Self::with_encodings(&crate::config::TextConfig::default().encodings)
    }

    /// 使用指定的候选编码标签创建解析器
    ///
    /// 无法识别的标签会被忽略（配置加载时已校验）
    pub fn with_encodings(labels: &[String]) -> Self {
        let encodings = labels
            .iter()
            .filter_map(|label| Encoding::for_label(label.as_bytes()))
            .collect();

        Self {
            encodings,
            heading_regex: Regex::new(r"^\s*(#{1,6})\s+(.+?)\s*#*\s*$").unwrap(),
            bold_regexes: [
                Regex::new(r"\*\*(.+?)\*\*").unwrap(),
                Regex::new(r"__(.+?)__").unwrap(),
            ],
            italic_regexes: [
                Regex::new(r"\*([^*\n]+?)\*").unwrap(),
                Regex::new(r"_([^_\n]+?)_").unwrap(),
            ],
        }
    }

    /// 解码文件内容
    ///
    /// 先检查 BOM，然后依次尝试候选编码，全部失败时返回 EncodingUndetected
    fn decode(&self, bytes: &[u8]) -> IngestResult<String> {
        // 1. 检查 BOM (Byte Order Mark)
        if let Some((encoding, bom_length)) = Encoding::for_bom(bytes) {
            if let Some(text) = encoding
                .decode_without_bom_handling_and_without_replacement(&bytes[bom_length..])
            {
                return Ok(text.into_owned());
            }
        }

        // 2. 按顺序尝试候选编码
        for (index, encoding) in self.encodings.iter().enumerate() {
            match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
                Some(text) => {
                    if index > 0 {
                        warn!(encoding = encoding.name(), "首选编码解码失败，使用候选编码");
                    }
                    return Ok(text.into_owned());
                }
                None => debug!(encoding = encoding.name(), "候选编码解码失败"),
            }
        }

        Err(IngestError::EncodingUndetected {
            tried: self
                .encodings
                .iter()
                .map(|e| e.name())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// 分割文本为段落
    ///
    /// 根据空行分割，段落内部保留换行
    fn split_into_paragraphs<'a>(&self, content: &'a str) -> Vec<Vec<&'a str>> {
        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() {
                // 空行，结束当前段落
                if !current.is_empty() {
                    paragraphs.push(std::mem::take(&mut current));
                }
            } else {
                current.push(trimmed);
            }
        }

        // 添加最后一个段落
        if !current.is_empty() {
            paragraphs.push(current);
        }

        paragraphs
    }

    /// 行内标记转换（先转义 HTML 特殊字符）
    fn convert_inline(&self, text: &str) -> String {
        let mut html = html_escape::encode_text(text).into_owned();
        for re in &self.bold_regexes {
            html = re.replace_all(&html, "<strong>$1</strong>").into_owned();
        }
        for re in &self.italic_regexes {
            html = re.replace_all(&html, "<em>$1</em>").into_owned();
        }
        html
    }

    /// 将轻量 Markdown 文本转换为块级标记
    pub fn convert_markdown(&self, content: &str) -> String {
        let mut blocks = Vec::new();

        for lines in self.split_into_paragraphs(content) {
            let mut pending: Vec<&str> = Vec::new();

            for line in lines {
                if let Some(caps) = self.heading_regex.captures(line) {
                    if !pending.is_empty() {
                        blocks.push(self.create_paragraph_block(&pending));
                        pending.clear();
                    }
                    let inner = self.convert_inline(&caps[2]);
                    let level = caps[1].len();
                    blocks.push(format!("<h{level}>{inner}</h{level}>"));
                } else {
                    pending.push(line);
                }
            }

            if !pending.is_empty() {
                blocks.push(self.create_paragraph_block(&pending));
            }
        }

        blocks.join("\n\n")
    }

    /// 创建段落块
    fn create_paragraph_block(&self, lines: &[&str]) -> String {
        format!("<p>{}</p>", self.convert_inline(&lines.join("\n")))
    }
}

impl Parser for TxtParser {
    fn name(&self) -> &'static str {
        "txt"
    }

    fn parse(&self, file_path: &Path, _ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        // 1. 读取文件字节
        let bytes = fs::read(file_path).map_err(|e| IngestError::io(file_path, e))?;

        // 2. 检测编码并解码
        let content = self.decode(&bytes)?.replace("\r\n", "\n");

        // 3. 转换为块级标记
        Ok(self.convert_markdown(&content))
    }
}

impl Default for TxtParser {
    fn default() -> Self {
        Self::new()
    }
}
