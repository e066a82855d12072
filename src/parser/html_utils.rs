//! HTML 清理与图片引用改写
//!
//! EPUB、MOBI、Markdown 的输出都会经过这里

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use tracing::warn;

use crate::error::{IngestError, IngestResult};

fn script_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*?/>|<script\b[^>]*>.*?</script\s*>").expect("script regex")
    })
}

fn style_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<style\b[^>]*?/>|<style\b[^>]*>.*?</style\s*>").expect("style regex")
    })
}

fn image_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(?:img|image)\b[^>]*>").expect("image tag regex"))
}

fn image_attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(\s(?:src|xlink:href|href)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
            .expect("image attr regex")
    })
}

/// 移除 script 和 style 元素
pub fn strip_scripts(html: &str) -> String {
    let without_scripts = script_regex().replace_all(html, "");
    style_regex().replace_all(&without_scripts, "").into_owned()
}

/// 获取 body 内容，如果没有 body 则返回整个文档
pub fn body_inner(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").expect("body selector");

    match document.select(&body_selector).next() {
        Some(body) => body.inner_html().trim().to_string(),
        None => html.trim().to_string(),
    }
}

/// 改写图片引用
///
/// 对每个 `<img>` / `<image>` 标签的 src / href 调用 `resolve`：
/// 返回 `Some(url)` 时替换为新地址，返回 `None` 时保持原样
pub fn rewrite_images<F>(html: &str, mut resolve: F) -> IngestResult<String>
where
    F: FnMut(&str) -> IngestResult<Option<String>>,
{
    let mut output = String::with_capacity(html.len());
    let mut last = 0;

    for tag in image_tag_regex().find_iter(html) {
        output.push_str(&html[last..tag.start()]);
        last = tag.end();

        let tag_text = tag.as_str();
        let mut rewritten = String::with_capacity(tag_text.len());
        let mut tag_last = 0;

        for caps in image_attr_regex().captures_iter(tag_text) {
            let whole = caps.get(0).expect("capture 0");
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("");
            let reference = html_escape::decode_html_entities(value);

            rewritten.push_str(&tag_text[tag_last..whole.start()]);
            match resolve(&*reference)? {
                Some(url) => {
                    rewritten.push_str(&caps[1]);
                    rewritten.push('"');
                    rewritten.push_str(&html_escape::encode_double_quoted_attribute(&url));
                    rewritten.push('"');
                }
                None => rewritten.push_str(whole.as_str()),
            }
            tag_last = whole.end();
        }

        rewritten.push_str(&tag_text[tag_last..]);
        output.push_str(&rewritten);
    }

    output.push_str(&html[last..]);
    Ok(output)
}

/// 处理单个图片重定位结果
///
/// 越界或缺失的图片只记录日志并保持原引用，其他错误（如写盘失败）继续向上传递
pub fn tolerate_missing(reference: &str, result: IngestResult<String>) -> IngestResult<Option<String>> {
    match result {
        Ok(url) => Ok(Some(url)),
        Err(IngestError::CorruptDocument(msg)) => {
            warn!(reference, error = %msg, "图片无法重定位，保留原引用");
            Ok(None)
        }
        Err(IngestError::Io { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
            warn!(reference, path = %path.display(), "图片不存在，保留原引用");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
