//! 段落切分
//!
//! 按文档顺序遍历块级元素并累积成段落：累计的纯文本长度达到低水位即结束当前段落，
//! 任何段落都不超过高水位，放不下的块按文本长度切开，两侧保留原有标签和图片。
//! 除最后一个段落外，每个段落的长度都在 `[low_water, high_water]` 之间。

use scraper::{ElementRef, Html, Node};
use tracing::debug;

use crate::config::SegmentConfig;
use crate::markup::{strip_markup, text_len, wrap_paragraph};

/// 单独成块的元素
const LEAF_BLOCKS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "pre", "tr", "dt", "dd",
];

/// 不含其他块级元素时整体成块，否则继续向下遍历
const CONTAINER_BLOCKS: &[&str] = &["div", "section", "article", "figure"];

/// 只向下遍历、本身不成块的结构元素
const STRUCTURAL: &[&str] = &[
    "html", "body", "main", "header", "footer", "nav", "aside", "ul", "ol", "dl", "table",
    "thead", "tbody", "tfoot", "hgroup", "details",
];

/// 待累积的单元
#[derive(Debug, Clone)]
struct Unit {
    markup: String,
    len: usize,
}

impl Unit {
    fn new(markup: String) -> Self {
        let len = text_len(&strip_markup(&markup));
        Self { markup, len }
    }

    fn has_content(&self) -> bool {
        if self.len > 0 && !strip_markup(&self.markup).trim().is_empty() {
            return true;
        }
        let lower = self.markup.to_ascii_lowercase();
        lower.contains("<img") || lower.contains("<image")
    }
}

/// 段落切分器
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    low: usize,
    high: usize,
}

impl Segmenter {
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            low: config.low_water.max(1),
            high: config.high_water.max(config.low_water.max(1)),
        }
    }

    /// 切分规范化标记为段落列表
    ///
    /// 空输入返回空列表
    pub fn segment(&self, markup: &str) -> Vec<String> {
        let markup = markup.replace("\r\n", "\n").replace('\r', "\n");
        if markup.trim().is_empty() {
            return Vec::new();
        }

        let fragment = Html::parse_fragment(&markup);
        let mut units = Vec::new();
        let mut found_block = false;
        collect_units(fragment.root_element(), &mut units, &mut found_block);

        if !found_block {
            units = line_units(&markup);
        }

        let chunks = self.accumulate(units);
        debug!(chunks = chunks.len(), "段落切分完成");
        chunks
    }

    fn accumulate(&self, units: Vec<Unit>) -> Vec<String> {
        let mut chunker = Chunker::new(self.low, self.high);
        for unit in units {
            chunker.push(unit);
        }
        chunker.finish()
    }
}

/// 累积状态
struct Chunker {
    low: usize,
    high: usize,
    chunks: Vec<String>,
    parts: Vec<String>,
    len: usize,
}

impl Chunker {
    fn new(low: usize, high: usize) -> Self {
        Self {
            low,
            high,
            chunks: Vec::new(),
            parts: Vec::new(),
            len: 0,
        }
    }

    /// 追加后的长度（块之间以换行连接，换行计入长度）
    fn len_with(&self, extra: usize) -> usize {
        if self.parts.is_empty() {
            extra
        } else {
            self.len + 1 + extra
        }
    }

    fn append(&mut self, markup: String, len: usize) {
        self.len = self.len_with(len);
        self.parts.push(markup);
        if self.len >= self.low {
            self.close();
        }
    }

    fn close(&mut self) {
        if !self.parts.is_empty() {
            self.chunks.push(self.parts.join("\n"));
            self.parts.clear();
            self.len = 0;
        }
    }

    fn push(&mut self, unit: Unit) {
        if self.len_with(unit.len) <= self.high {
            self.append(unit.markup, unit.len);
            return;
        }

        let mut rest = unit;

        // 先用开头一部分把当前段落补到低水位以上
        if !self.parts.is_empty() {
            let budget = self.high - self.len - 1;
            let need = self.low.saturating_sub(self.len + 1).max(1);
            if need > budget {
                self.close();
            } else {
                let (head, tail) = split_unit(&rest, need, budget);
                self.append(head.markup, head.len);
                self.close();
                match tail {
                    Some(tail) => rest = tail,
                    None => return,
                }
            }
        }

        while rest.len > self.high {
            let (head, tail) = split_unit(&rest, self.low, self.high);
            self.chunks.push(head.markup);
            match tail {
                Some(tail) => rest = tail,
                None => return,
            }
        }

        if rest.has_content() {
            self.append(rest.markup, rest.len);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.close();
        self.chunks
    }
}

/// 在字符数 `[min, max]` 范围内寻找切分点
///
/// 优先选最靠后的换行，其次最靠后的空白，都没有时在 `max` 处硬切。
/// 作为切分点的换行 / 空白字符被丢弃。
fn cut(text: &str, min: usize, max: usize) -> (&str, &str) {
    let mut newline = None;
    let mut space = None;
    let mut hard = text.len();

    for (count, (idx, ch)) in text.char_indices().enumerate() {
        if count == max {
            hard = idx;
        }
        if count > max {
            break;
        }
        if count >= min {
            if ch == '\n' {
                newline = Some((idx, ch));
            } else if ch.is_whitespace() {
                space = Some((idx, ch));
            }
        }
    }

    match newline.or(space) {
        Some((idx, ch)) => (&text[..idx], &text[idx + ch.len_utf8()..]),
        None => (&text[..hard], &text[hard..]),
    }
}

/// 按文本长度切分一个单元，保留标签结构
///
/// 头部的纯文本长度落在 `[min, max]`。优先在子节点边界切分，
/// 必须切开文本节点时使用 `cut`，被切开的元素在两侧各自闭合。
/// 图片等无文本的节点原样保留。
fn split_unit(unit: &Unit, min: usize, max: usize) -> (Unit, Option<Unit>) {
    let fragment = Html::parse_fragment(&unit.markup);
    let mut splitter = MarkupSplitter {
        min,
        max,
        taken: 0,
        head: String::new(),
        tail: String::new(),
        done: false,
    };
    splitter.visit(fragment.root_element());

    let head = Unit::new(splitter.head);
    let tail = Unit::new(splitter.tail);
    if tail.has_content() {
        (head, Some(tail))
    } else {
        (head, None)
    }
}

struct MarkupSplitter {
    min: usize,
    max: usize,
    /// 头部已有的文本长度
    taken: usize,
    head: String,
    tail: String,
    /// 切分点已确定，其余节点全部进入尾部
    done: bool,
}

impl MarkupSplitter {
    fn visit(&mut self, parent: ElementRef<'_>) {
        for child in parent.children() {
            match child.value() {
                Node::Text(text) => {
                    let text: &str = text;
                    if self.done {
                        self.tail.push_str(&html_escape::encode_text(text));
                        continue;
                    }
                    let len = text_len(text);
                    if self.taken + len <= self.max {
                        self.head.push_str(&html_escape::encode_text(text));
                        self.taken += len;
                    } else if self.taken >= self.min {
                        self.done = true;
                        self.tail.push_str(&html_escape::encode_text(text));
                    } else {
                        let (piece, remainder) =
                            cut(text, self.min - self.taken, self.max - self.taken);
                        self.head.push_str(&html_escape::encode_text(piece));
                        self.taken += text_len(piece);
                        self.tail.push_str(&html_escape::encode_text(remainder));
                        self.done = true;
                    }
                }
                Node::Element(_) => {
                    let Some(element) = ElementRef::wrap(child) else {
                        continue;
                    };
                    let html = element.html();
                    if self.done {
                        self.tail.push_str(&html);
                        continue;
                    }
                    let len = text_len(&strip_markup(&html));
                    if self.taken + len <= self.max {
                        self.head.push_str(&html);
                        self.taken += len;
                    } else if self.taken >= self.min {
                        self.done = true;
                        self.tail.push_str(&html);
                    } else {
                        let open = start_tag(element);
                        let close = format!("</{}>", element.value().name());
                        let tail_start = self.tail.len();

                        self.head.push_str(&open);
                        self.visit(element);
                        self.head.push_str(&close);

                        self.tail.insert_str(tail_start, &open);
                        self.tail.push_str(&close);
                    }
                }
                _ => {}
            }
        }
    }
}

/// 重建开始标签
fn start_tag(element: ElementRef<'_>) -> String {
    let el = element.value();
    let mut tag = format!("<{}", el.name());
    for (name, value) in el.attrs() {
        tag.push_str(&format!(
            " {}=\"{}\"",
            name,
            html_escape::encode_double_quoted_attribute(value)
        ));
    }
    tag.push('>');
    tag
}

fn is_block_name(name: &str) -> bool {
    LEAF_BLOCKS.contains(&name) || CONTAINER_BLOCKS.contains(&name) || STRUCTURAL.contains(&name)
}

/// 容器内是否还有其他块级元素
fn has_nested_block(element: ElementRef<'_>) -> bool {
    element
        .descendants()
        .skip(1)
        .any(|node| node.value().as_element().is_some_and(|el| is_block_name(el.name())))
}

/// 递归收集块级单元
///
/// 块之间零散的文本和行内元素合并为一个单元
fn collect_units(parent: ElementRef<'_>, units: &mut Vec<Unit>, found_block: &mut bool) {
    let mut loose = String::new();

    for child in parent.children() {
        match child.value() {
            Node::Text(text) => loose.push_str(&html_escape::encode_text(&**text)),
            Node::Element(el) => {
                let name = el.name();
                let Some(element) = ElementRef::wrap(child) else {
                    continue;
                };

                let is_leaf = LEAF_BLOCKS.contains(&name)
                    || (CONTAINER_BLOCKS.contains(&name) && !has_nested_block(element));
                let descend = STRUCTURAL.contains(&name) || CONTAINER_BLOCKS.contains(&name);

                if is_leaf {
                    *found_block = true;
                    flush_loose(&mut loose, units);
                    let unit = Unit::new(element.html());
                    if unit.has_content() {
                        units.push(unit);
                    }
                } else if descend {
                    flush_loose(&mut loose, units);
                    collect_units(element, units, found_block);
                } else {
                    loose.push_str(&element.html());
                }
            }
            _ => {}
        }
    }

    flush_loose(&mut loose, units);
}

fn flush_loose(loose: &mut String, units: &mut Vec<Unit>) {
    if loose.is_empty() {
        return;
    }
    let unit = Unit::new(std::mem::take(loose).trim().to_string());
    if unit.has_content() {
        units.push(unit);
    }
}

/// 降级：按非空行切分纯文本
fn line_units(markup: &str) -> Vec<Unit> {
    strip_markup(markup)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Unit {
            markup: wrap_paragraph(line),
            len: text_len(line),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::recount;

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmentConfig::default())
    }

    fn small(low: usize, high: usize) -> Segmenter {
        Segmenter::new(SegmentConfig {
            low_water: low,
            high_water: high,
        })
    }

    /// 检查长度约束：全部不超过高水位，除最后一个外都不低于低水位
    fn assert_bounds(chunks: &[String], low: usize, high: usize) {
        for (i, chunk) in chunks.iter().enumerate() {
            let len = recount(chunk);
            assert!(len <= high, "第 {} 段长度 {} 超过 {}", i, len, high);
            if i + 1 < chunks.len() {
                assert!(len >= low, "第 {} 段长度 {} 低于 {}", i, len, low);
            }
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(segmenter().segment("").is_empty());
        assert!(segmenter().segment("  \n\n ").is_empty());
    }

    #[test]
    fn test_short_lines_merge_into_one() {
        let chunks = segmenter().segment("Line one.\n\nLine two.");
        assert_eq!(chunks, vec!["<p>Line one.</p>\n<p>Line two.</p>".to_string()]);
    }

    #[test]
    fn test_blocks_merge_until_low_water() {
        let html = "<h1>标题</h1><p>aaaa</p><p>bbbb</p><p>cccc</p>";
        let chunks = small(8, 20).segment(html);
        assert_eq!(
            chunks,
            vec![
                "<h1>标题</h1>\n<p>aaaa</p>\n<p>bbbb</p>".to_string(),
                "<p>cccc</p>".to_string(),
            ]
        );
    }

    #[test]
    fn test_large_plain_paragraph_is_bounded() {
        let text = "x".repeat(5000);
        let html = format!("<p>{}</p>", text);
        let chunks = segmenter().segment(&html);

        assert!(chunks.len() >= 2);
        assert_bounds(&chunks, 1000, 4000);
        let total: usize = chunks.iter().map(|c| recount(c)).sum();
        assert_eq!(total, 5000);
    }

    #[test]
    fn test_oversized_block_splits_at_lines() {
        let line = "y".repeat(99);
        let body = vec![line.as_str(); 60].join("\n");
        let html = format!("<pre>{}</pre>", body);
        let chunks = segmenter().segment(&html);

        assert_bounds(&chunks, 1000, 4000);
        assert!(chunks.len() >= 2);
        // 按行切分时不会切断行
        for chunk in &chunks {
            let text = strip_markup(chunk);
            assert!(text.split('\n').all(|l| l.len() == 99), "{:?}", text);
        }
    }

    #[test]
    fn test_oversized_block_after_short_one() {
        let html = format!("<p>{}</p><p>{}</p><p>tail</p>", "a".repeat(500), "b ".repeat(3000));
        let chunks = segmenter().segment(&html);
        assert_bounds(&chunks, 1000, 4000);
        assert!(chunks[0].starts_with("<p>aaaa"));
    }

    #[test]
    fn test_boundary_block_keeps_images_and_inline_marks() {
        let html = format!(
            r#"<p>{}</p><p><img src="/uploads/images/1/x.png"><strong>{}</strong></p>"#,
            "a".repeat(900),
            "b".repeat(3500)
        );
        let chunks = segmenter().segment(&html);

        assert_eq!(chunks.len(), 2);
        assert_bounds(&chunks, 1000, 4000);
        let all = chunks.join("\n");
        assert_eq!(all.matches("/uploads/images/1/x.png").count(), 1);
        assert!(chunks[0].contains("<img"));
        // 被切开的 <strong> 在两个段落中各自闭合
        assert!(chunks[0].contains("<strong>") && chunks[0].ends_with("</strong></p>"));
        assert!(chunks[1].starts_with("<p><strong>b"));
        assert_eq!(recount(&chunks[1]), 401);
    }

    #[test]
    fn test_boundary_block_splits_between_children() {
        let html = format!(
            "<p>{}</p><p><em>{}</em><em>{}</em></p>",
            "a".repeat(8),
            "b".repeat(10),
            "c".repeat(15)
        );
        let chunks = small(10, 30).segment(&html);
        assert_eq!(
            chunks,
            vec![
                format!("<p>{}</p>\n<p><em>{}</em></p>", "a".repeat(8), "b".repeat(10)),
                format!("<p><em>{}</em></p>", "c".repeat(15)),
            ]
        );
    }

    #[test]
    fn test_split_unit_keeps_attributes() {
        let unit = Unit::new(format!(r#"<p class="note">{} {}</p>"#, "x".repeat(5), "y".repeat(5)));
        let (head, tail) = split_unit(&unit, 3, 8);
        assert_eq!(head.markup, r#"<p class="note">xxxxx</p>"#);
        assert_eq!(tail.unwrap().markup, r#"<p class="note">yyyyy</p>"#);
    }

    #[test]
    fn test_many_blocks_respect_bounds() {
        let html: String = (0..200)
            .map(|i| format!("<p>{}</p>", "字".repeat(50 + (i * 37) % 900)))
            .collect();
        let chunks = segmenter().segment(&html);
        assert_bounds(&chunks, 1000, 4000);
    }

    #[test]
    fn test_nested_containers_descend() {
        let html = "<div><section><p>one</p><p>two</p></section><div>three</div></div>";
        let chunks = small(1, 100).segment(html);
        assert_eq!(chunks, vec!["<p>one</p>", "<p>two</p>", "<div>three</div>"]);
    }

    #[test]
    fn test_image_only_block_kept() {
        let html = r#"<p>text</p><p><img src="/uploads/images/1/a.png"></p><p></p>"#;
        let chunks = small(1, 100).segment(html);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].contains("<img"));
    }

    #[test]
    fn test_loose_text_between_blocks() {
        let html = "<p>first</p>loose <strong>bold</strong><p>last</p>";
        let chunks = small(1, 100).segment(html);
        assert_eq!(chunks, vec!["<p>first</p>", "loose <strong>bold</strong>", "<p>last</p>"]);
    }

    #[test]
    fn test_cut_prefers_newline_then_space() {
        assert_eq!(cut("abc\ndef ghi", 1, 9), ("abc", "def ghi"));
        assert_eq!(cut("abc def ghi", 1, 9), ("abc def", "ghi"));
        assert_eq!(cut("ab\ncd\nef", 1, 7), ("ab\ncd", "ef"));
        assert_eq!(cut("abcdefgh", 2, 5), ("abcde", "fgh"));
    }
}
