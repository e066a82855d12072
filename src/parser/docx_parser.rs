use super::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::sync::OnceLock;

use crate::markup::wrap_paragraph;

const DOCUMENT_PART: &str = "word/document.xml";
const STYLES_PART: &str = "word/styles.xml";

/// 文本片段（w:r）
#[derive(Debug, Default, Clone, PartialEq)]
struct DocxRun {
    text: String,
    bold: bool,
    italic: bool,
}

/// 段落（w:p）
#[derive(Debug, Default, Clone, PartialEq)]
struct DocxParagraph {
    style_id: Option<String>,
    runs: Vec<DocxRun>,
}

impl DocxParagraph {
    fn plain_text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

/// 读取压缩包中的一个 XML 部件
fn read_part(file_path: &Path, part: &str) -> IngestResult<Option<String>> {
    let file = File::open(file_path).map_err(|e| IngestError::io(file_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| IngestError::corrupt(format!("DOCX 不是有效的压缩包: {}", e)))?;

    let mut entry = match archive.by_name(part) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(IngestError::corrupt(format!("读取 {} 失败: {}", part, e))),
    };

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| IngestError::corrupt(format!("读取 {} 失败: {}", part, e)))?;
    Ok(Some(xml))
}

fn read_document(file_path: &Path) -> IngestResult<String> {
    read_part(file_path, DOCUMENT_PART)?
        .ok_or_else(|| IngestError::corrupt(format!("DOCX 缺少 {}", DOCUMENT_PART)))
}

/// 读取元素的 w:val 等属性（按本地名匹配）
fn attr_value(element: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == local)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// `<w:b/>` 开启，`<w:b w:val="0"/>` 关闭
fn toggle_on(element: &BytesStart<'_>) -> bool {
    !matches!(
        attr_value(element, b"val").as_deref(),
        Some("0") | Some("false") | Some("off") | Some("none")
    )
}

fn xml_error(part: &str, e: impl std::fmt::Display) -> IngestError {
    IngestError::corrupt(format!("{} 解析错误: {}", part, e))
}

/// 解析 styles.xml，得到 styleId → 样式名（小写）
fn parse_style_names(xml: &str) -> IngestResult<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut names = HashMap::new();
    let mut current_id: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"style" => current_id = attr_value(&e, b"styleId"),
                b"name" => {
                    if let (Some(id), Some(name)) = (&current_id, attr_value(&e, b"val")) {
                        names.insert(id.clone(), name.to_lowercase());
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"style" => current_id = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(STYLES_PART, e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(names)
}

/// 解析 document.xml 中的段落与文本片段
fn parse_paragraphs(xml: &str) -> IngestResult<Vec<DocxParagraph>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut paragraphs = Vec::new();
    let mut paragraph: Option<DocxParagraph> = None;
    let mut run: Option<DocxRun> = None;
    let mut in_run_props = false;
    let mut in_text = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(DOCUMENT_PART, e))?;

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"p" => paragraph = Some(DocxParagraph::default()),
                b"r" => run = Some(DocxRun::default()),
                b"rPr" => in_run_props = true,
                b"t" => in_text = true,
                b"pStyle" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.style_id = attr_value(&e, b"val");
                    }
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"pStyle" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.style_id = attr_value(&e, b"val");
                    }
                }
                b"b" if in_run_props => {
                    if let Some(r) = run.as_mut() {
                        r.bold = toggle_on(&e);
                    }
                }
                b"i" if in_run_props => {
                    if let Some(r) = run.as_mut() {
                        r.italic = toggle_on(&e);
                    }
                }
                b"tab" => {
                    if let Some(r) = run.as_mut() {
                        r.text.push('\t');
                    }
                }
                b"br" | b"cr" => {
                    if let Some(r) = run.as_mut() {
                        r.text.push('\n');
                    }
                }
                _ => {}
            },
            Event::Text(e) if in_text => {
                let text = e.unescape().map_err(|e| xml_error(DOCUMENT_PART, e))?;
                if let Some(r) = run.as_mut() {
                    r.text.push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"rPr" => in_run_props = false,
                b"r" => {
                    if let (Some(p), Some(r)) = (paragraph.as_mut(), run.take()) {
                        p.runs.push(r);
                    }
                }
                b"p" => {
                    if let Some(p) = paragraph.take() {
                        paragraphs.push(p);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

fn heading_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:heading|标题)\s*(\d+)").expect("heading regex"))
}

/// 根据样式名确定标题级别
///
/// heading 1-3 保持级别，其他标题样式统一为 h3，非标题返回 None
fn heading_level(style_name: &str) -> Option<usize> {
    if let Some(caps) = heading_regex().captures(style_name) {
        return match caps[1].parse::<usize>() {
            Ok(level @ 1..=3) => Some(level),
            _ => Some(3),
        };
    }
    if style_name.contains("heading") || style_name.contains("标题") {
        Some(3)
    } else {
        None
    }
}

fn render_run(run: &DocxRun) -> String {
    let mut html = html_escape::encode_text(&run.text).into_owned();
    if run.bold {
        html = format!("<strong>{}</strong>", html);
    }
    if run.italic {
        html = format!("<em>{}</em>", html);
    }
    html
}

/// DOCX 解析器
///
/// 按段落样式输出标题或段落，保留加粗与斜体
#[derive(Clone, Default)]
pub struct DocxParser;

impl DocxParser {
    pub fn new() -> Self {
        Self
    }

    fn render(&self, paragraphs: &[DocxParagraph], styles: &HashMap<String, String>) -> String {
        let mut blocks = Vec::new();

        for paragraph in paragraphs {
            if paragraph.plain_text().trim().is_empty() {
                continue;
            }

            let inner: String = paragraph
                .runs
                .iter()
                .filter(|r| !r.text.is_empty())
                .map(render_run)
                .collect();

            let level = paragraph
                .style_id
                .as_ref()
                .map(|id| styles.get(id).cloned().unwrap_or_else(|| id.to_lowercase()))
                .and_then(|name| heading_level(&name));

            blocks.push(match level {
                Some(level) => format!("<h{level}>{inner}</h{level}>"),
                None => format!("<p>{inner}</p>"),
            });
        }

        blocks.join("\n")
    }
}

impl Parser for DocxParser {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn parse(&self, file_path: &Path, _ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        let document = read_document(file_path)?;
        let styles = match read_part(file_path, STYLES_PART)? {
            Some(xml) => parse_style_names(&xml)?,
            None => HashMap::new(),
        };

        let paragraphs = parse_paragraphs(&document)?;
        Ok(self.render(&paragraphs, &styles))
    }
}

fn plain_paragraph_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<w:p[\s>].*?</w:p>").expect("paragraph regex"))
}

fn plain_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>").expect("text regex"))
}

/// DOCX 降级解析器
///
/// 结构化解析失败时使用：不解析样式，只按 w:p 提取文本，每段包裹为 `<p>`
#[derive(Clone, Default)]
pub struct DocxPlainParser;

impl DocxPlainParser {
    pub fn new() -> Self {
        Self
    }

    fn extract(&self, document: &str) -> String {
        plain_paragraph_regex()
            .find_iter(document)
            .map(|p| {
                plain_text_regex()
                    .captures_iter(p.as_str())
                    .map(|caps| html_escape::decode_html_entities(&caps[1]).into_owned())
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .map(|text| wrap_paragraph(&text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Parser for DocxPlainParser {
    fn name(&self) -> &'static str {
        "docx-plain"
    }

    fn parse(&self, file_path: &Path, _ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        let document = read_document(file_path)?;
        Ok(self.extract(&document))
    }
}
