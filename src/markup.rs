//! 规范化标记（Normalized Markup）辅助函数
//!
//! 各格式解析器统一输出块级 HTML：`<h1>`-`<h6>`、`<p>`、`<strong>`、`<em>`、`<img>`。
//! 段落字数始终以去除标签后的纯文本字符数计算。

use scraper::Html;

/// 去除标签，只保留纯文本（实体会被解码）
pub fn strip_markup(markup: &str) -> String {
    if !markup.contains('<') && !markup.contains('&') {
        return markup.to_string();
    }
    let fragment = Html::parse_fragment(markup);
    fragment.root_element().text().collect()
}

/// 纯文本字符数
pub fn text_len(text: &str) -> usize {
    text.chars().count()
}

/// 重新计算段落字数
///
/// 段落内容被修改后必须通过该函数重新计算，不允许手动填写
pub fn recount(content: &str) -> usize {
    text_len(&strip_markup(content))
}

/// 将纯文本包装为段落块（会转义 HTML 特殊字符）
pub fn wrap_paragraph(text: &str) -> String {
    format!("<p>{}</p>", html_escape::encode_text(text))
}

/// 将纯文本包装为标题块，级别限制在 1-6
pub fn wrap_heading(level: usize, text: &str) -> String {
    let level = level.clamp(1, 6);
    format!("<h{level}>{}</h{level}>", html_escape::encode_text(text))
}
