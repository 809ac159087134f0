//! 呈现文本后处理
//!
//! 把呈现阶段输出里的 Markdown 链接与加粗转换为聊天端的轻量标记：
//! `[text](url)` → `<url|text>`，`**bold**` → `*bold*`。其余文本原样保留。

use std::sync::OnceLock;

use regex::Regex;

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("link regex"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold regex"))
}

/// Markdown 链接 / 加粗 → 聊天端标记
pub fn render_chat_markup(text: &str) -> String {
    let text = link_re().replace_all(text, "<$2|$1>");
    bold_re().replace_all(&text, "*$1*").into_owned()
}
