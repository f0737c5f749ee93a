//! Rich-text documents: a JSON node tree (`doc` > blocks > inline text with
//! marks) stored as a string on each recipe field.
//!
//! [`render_html`] turns a stored document into HTML. The `*_to_document`
//! functions build documents from plain text and HTML during imports.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const EMPTY_DOCUMENT: &str = r#"{"type":"doc","content":[]}"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Node>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
}

fn null_as_empty<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Node {
    fn block(kind: &str, content: Vec<Node>) -> Self {
        Self {
            kind: kind.to_string(),
            content: Some(content),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn doc(content: Vec<Node>) -> Self {
        Self::block("doc", content)
    }

    #[must_use]
    pub fn paragraph(content: Vec<Node>) -> Self {
        Self::block("paragraph", content)
    }

    #[must_use]
    pub fn heading(level: u8, content: Vec<Node>) -> Self {
        let mut attrs = Map::new();
        attrs.insert("level".to_string(), Value::from(level));
        Self {
            attrs: Some(attrs),
            ..Self::block("heading", content)
        }
    }

    #[must_use]
    pub fn text(text: &str) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn hard_break() -> Self {
        Self {
            kind: "hardBreak".to_string(),
            ..Self::default()
        }
    }

    /// A `bulletList` or `orderedList` with one list item per entry.
    #[must_use]
    pub fn list(ordered: bool, items: Vec<Vec<Node>>) -> Self {
        let kind = if ordered { "orderedList" } else { "bulletList" };
        let items = items
            .into_iter()
            .map(|inline| Self::block("listItem", vec![Self::paragraph(inline)]))
            .collect();
        Self::block(kind, items)
    }

    #[must_use]
    pub fn children(&self) -> &[Node] {
        self.content.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| EMPTY_DOCUMENT.to_string())
    }
}

impl Mark {
    fn simple(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            attrs: None,
        }
    }

    fn link(href: &str) -> Self {
        let mut attrs = Map::new();
        attrs.insert("href".to_string(), Value::from(href));
        Self {
            kind: "link".to_string(),
            attrs: Some(attrs),
        }
    }

    fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.as_ref()?.get(key)?.as_str()
    }
}

// --- Rendering ---

/// Render a stored document to HTML.
///
/// Empty input renders as nothing. Input that does not parse as a document
/// is returned unchanged.
#[must_use]
pub fn render_html(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let Ok(root) = serde_json::from_str::<Node>(input) else {
        return input.to_string();
    };

    let mut out = String::new();
    if root.kind == "doc" {
        render_root_blocks(root.children(), &mut out);
    } else {
        render_node(&root, &mut out);
    }
    out
}

/// Top-level blocks, with runs of `- ` paragraphs regrouped into one list.
fn render_root_blocks(nodes: &[Node], out: &mut String) {
    let mut in_list = false;
    for node in nodes {
        if let Some(item) = dash_paragraph_item(node) {
            if !in_list {
                out.push_str("<ul>");
                in_list = true;
            }
            render_list_item(&item, out);
            continue;
        }
        if in_list {
            out.push_str("</ul>");
            in_list = false;
        }
        render_node(node, out);
    }
    if in_list {
        out.push_str("</ul>");
    }
}

/// A paragraph whose first inline is text beginning with `- ` (after trimming),
/// rebuilt as a list item with the marker removed.
fn dash_paragraph_item(node: &Node) -> Option<Node> {
    if node.kind != "paragraph" {
        return None;
    }
    let first = node.children().first()?;
    if first.kind != "text" {
        return None;
    }
    let stripped = first.text.as_deref()?.trim().strip_prefix("- ")?;

    let mut inline = node.children().to_vec();
    inline[0].text = Some(stripped.to_string());
    Some(Node::block("listItem", vec![Node::paragraph(inline)]))
}

fn render_node(node: &Node, out: &mut String) {
    match node.kind.as_str() {
        "text" => render_text(node, out),
        "hardBreak" => out.push_str("<br/>"),
        "horizontalRule" => out.push_str("<hr/>"),
        "paragraph" => {
            let mut inner = String::new();
            render_children(node, &mut inner);
            if inner.is_empty() {
                out.push_str("<p><br/></p>");
            } else {
                let _ = write!(out, "<p>{inner}</p>");
            }
        }
        "heading" => {
            let level = heading_level(node);
            let _ = write!(out, "<h{level}>");
            render_children(node, out);
            let _ = write!(out, "</h{level}>");
        }
        "bulletList" => wrap("ul", node, out),
        "orderedList" => wrap("ol", node, out),
        "listItem" => render_list_item(node, out),
        "blockquote" => wrap("blockquote", node, out),
        "codeBlock" => {
            out.push_str("<pre><code>");
            render_children(node, out);
            out.push_str("</code></pre>");
        }
        _ => render_children(node, out),
    }
}

fn render_children(node: &Node, out: &mut String) {
    for child in node.children() {
        render_node(child, out);
    }
}

fn wrap(tag: &str, node: &Node, out: &mut String) {
    let _ = write!(out, "<{tag}>");
    render_children(node, out);
    let _ = write!(out, "</{tag}>");
}

// Paragraphs inside a list item render inline; consecutive ones are joined
// with a line break.
fn render_list_item(node: &Node, out: &mut String) {
    out.push_str("<li>");
    let mut previous_was_paragraph = false;
    for child in node.children() {
        if child.kind == "paragraph" {
            if previous_was_paragraph {
                out.push_str("<br/>");
            }
            render_children(child, out);
            previous_was_paragraph = true;
        } else {
            render_node(child, out);
            previous_was_paragraph = false;
        }
    }
    out.push_str("</li>");
}

fn heading_level(node: &Node) -> u64 {
    node.attrs
        .as_ref()
        .and_then(|a| a.get("level"))
        .and_then(Value::as_u64)
        .unwrap_or(2)
        .clamp(1, 6)
}

// Marks wrap from the last one outwards, so marks[0] ends up outermost.
fn render_text(node: &Node, out: &mut String) {
    let mut html = escape_html(node.text.as_deref().unwrap_or_default());
    for mark in node.marks.iter().rev() {
        html = match mark.kind.as_str() {
            "bold" => format!("<strong>{html}</strong>"),
            "italic" => format!("<em>{html}</em>"),
            "strike" => format!("<s>{html}</s>"),
            "underline" => format!("<u>{html}</u>"),
            "code" => format!("<code>{html}</code>"),
            "link" => {
                let href = safe_href(mark.attr_str("href").unwrap_or("#"));
                format!("<a href=\"{}\">{html}</a>", escape_html(href))
            }
            _ => html,
        };
    }
    out.push_str(&html);
}

/// Hrefs with a scheme other than http, https or mailto become `#`.
fn safe_href(href: &str) -> &str {
    let href = href.trim();
    let scheme_end = href.find(':');
    let path_start = href.find(['/', '?', '#']);
    match (scheme_end, path_start) {
        (Some(colon), Some(slash)) if slash < colon => href,
        (Some(colon), _) => {
            let scheme = href[..colon].to_ascii_lowercase();
            if matches!(scheme.as_str(), "http" | "https" | "mailto") {
                href
            } else {
                "#"
            }
        }
        (None, _) => href,
    }
}

#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// --- Conversion into documents ---

fn is_json(text: &str) -> bool {
    text.starts_with('{') && serde_json::from_str::<Value>(text).is_ok()
}

/// Convert plain text into a document, one paragraph per non-empty line.
///
/// A single leading `-` or `•` bullet is dropped from each line. Text that is
/// already JSON is returned as is.
#[must_use]
pub fn plain_text_to_document(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return EMPTY_DOCUMENT.to_string();
    }
    if is_json(trimmed) {
        return text.to_string();
    }

    let paragraphs = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line
                .strip_prefix('-')
                .or_else(|| line.strip_prefix('•'))
                .unwrap_or(line)
                .trim();
            if line.is_empty() {
                Node::paragraph(Vec::new())
            } else {
                Node::paragraph(vec![Node::text(line)])
            }
        })
        .collect();
    Node::doc(paragraphs).to_json()
}

/// Accept a document or plain text from an editor form and return a
/// document. Only JSON that parses as a node tree is kept verbatim.
#[must_use]
pub fn normalize_document(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with('{') && serde_json::from_str::<Node>(trimmed).is_ok() {
        return trimmed.to_string();
    }
    if trimmed.is_empty() {
        return EMPTY_DOCUMENT.to_string();
    }
    let lines: Vec<Node> = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Node::paragraph(vec![Node::text(line)]))
        .collect();
    Node::doc(lines).to_json()
}

// Lists match only their opening tag; the body is found by `list_extent`.
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]\s*>|<p\b[^>]*>(.*?)</p\s*>|<(ul|ol)\b[^>]*>")
        .expect("valid block regex")
});

static LIST_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?)(?:ul|ol)\b[^>]*>").expect("valid list tag regex"));

static LIST_BOUNDARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(/?)li\b[^>]*>|</?(?:ul|ol)\b[^>]*>").expect("valid list boundary regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(/?)([a-z][a-z0-9]*)\b([^>]*)>").expect("valid tag regex"));

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).expect("valid href regex")
});

static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&(#x[0-9a-f]+|#[0-9]+|[a-z]+);").expect("valid entity regex"));

static LINE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid line break regex"));

/// Convert CMS HTML into a document.
///
/// Handles headings, paragraphs, bullet and numbered lists, links, bold and
/// italic. `h1`-`h4` become level 2 headings and `h5`/`h6` level 3. Nested
/// lists are flattened into their outer list. Loose text between blocks
/// becomes paragraphs. JSON input is returned as is.
#[must_use]
pub fn html_to_document(html: &str) -> String {
    let trimmed = html.trim();
    if trimmed.is_empty() {
        return EMPTY_DOCUMENT.to_string();
    }
    if is_json(trimmed) {
        return html.to_string();
    }

    let mut blocks = Vec::new();
    let mut last = 0;
    while let Some(caps) = BLOCK_RE.captures_at(trimmed, last) {
        let Some(whole) = caps.get(0) else { break };
        loose_paragraphs(&trimmed[last..whole.start()], &mut blocks);
        last = whole.end();

        if let (Some(level), Some(body)) = (caps.get(1), caps.get(2)) {
            let inline = inline_nodes(body.as_str());
            if !inline.is_empty() {
                let level = if level.as_str() > "4" { 3 } else { 2 };
                blocks.push(Node::heading(level, inline));
            }
        } else if let Some(body) = caps.get(3) {
            let inline = inline_nodes(body.as_str());
            if !inline.is_empty() {
                blocks.push(Node::paragraph(inline));
            }
        } else if let Some(kind) = caps.get(4) {
            let (body_end, close_end) = list_extent(trimmed, whole.end());
            let items = list_items(&trimmed[whole.end()..body_end]);
            last = close_end;
            if !items.is_empty() {
                blocks.push(Node::list(kind.as_str().eq_ignore_ascii_case("ol"), items));
            }
        }
    }
    loose_paragraphs(&trimmed[last..], &mut blocks);

    if blocks.is_empty() {
        blocks.push(Node::paragraph(Vec::new()));
    }
    Node::doc(blocks).to_json()
}

/// End of a list body starting at `from` and the end of its closing tag,
/// counting nested lists. An unclosed list runs to the end of the input.
fn list_extent(html: &str, from: usize) -> (usize, usize) {
    let mut depth = 1usize;
    for caps in LIST_TAG_RE.captures_iter(&html[from..]) {
        let Some(tag) = caps.get(0) else { continue };
        if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
            depth -= 1;
            if depth == 0 {
                return (from + tag.start(), from + tag.end());
            }
        } else {
            depth += 1;
        }
    }
    (html.len(), html.len())
}

/// Items of a list body. Nested lists are flattened into the outer list, and
/// text after a nested list becomes an item of its own.
fn list_items(body: &str) -> Vec<Vec<Node>> {
    let mut items = Vec::new();
    let mut open_items = 0usize;
    let mut last = 0;
    let mut flush = |text: &str, open_items: usize| {
        if open_items > 0 {
            let inline = inline_nodes(text);
            if !inline.is_empty() {
                items.push(inline);
            }
        }
    };
    for caps in LIST_BOUNDARY_RE.captures_iter(body) {
        let Some(tag) = caps.get(0) else { continue };
        flush(&body[last..tag.start()], open_items);
        last = tag.end();
        // Group 1 only takes part for `li` tags.
        match caps.get(1).map(|m| m.as_str()) {
            Some("/") => open_items = open_items.saturating_sub(1),
            Some(_) => open_items += 1,
            None => {}
        }
    }
    flush(&body[last..], open_items);
    items
}

// Text outside any block element: one paragraph per `<br>`-separated line.
fn loose_paragraphs(fragment: &str, blocks: &mut Vec<Node>) {
    for line in LINE_BREAK_RE.split(fragment) {
        let inline = inline_nodes(line);
        if !inline.is_empty() {
            blocks.push(Node::paragraph(inline));
        }
    }
}

/// Inline HTML to text nodes, tracking bold/italic/link marks across tags.
fn inline_nodes(fragment: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut bold = 0usize;
    let mut italic = 0usize;
    let mut link: Option<String> = None;
    let mut last = 0;

    for caps in TAG_RE.captures_iter(fragment) {
        let Some(whole) = caps.get(0) else { continue };
        push_text(&fragment[last..whole.start()], bold, italic, link.as_deref(), &mut nodes);
        last = whole.end();

        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps.get(2).map_or(String::new(), |m| m.as_str().to_ascii_lowercase());
        match (name.as_str(), closing) {
            ("strong" | "b", false) => bold += 1,
            ("strong" | "b", true) => bold = bold.saturating_sub(1),
            ("em" | "i", false) => italic += 1,
            ("em" | "i", true) => italic = italic.saturating_sub(1),
            ("a", false) => {
                let attrs = caps.get(3).map_or("", |m| m.as_str());
                link = HREF_RE.captures(attrs).and_then(|h| {
                    h.get(1)
                        .or_else(|| h.get(2))
                        .or_else(|| h.get(3))
                        .map(|m| decode_entities(m.as_str()))
                });
            }
            ("a", true) => link = None,
            ("br", _) => nodes.push(Node::hard_break()),
            _ => {}
        }
    }
    push_text(&fragment[last..], bold, italic, link.as_deref(), &mut nodes);

    trim_inline(nodes)
}

fn push_text(raw: &str, bold: usize, italic: usize, link: Option<&str>, nodes: &mut Vec<Node>) {
    let text = collapse_whitespace(&decode_entities(raw));
    if text.is_empty() {
        return;
    }
    let mut marks = Vec::new();
    if let Some(href) = link {
        marks.push(Mark::link(href));
    }
    if bold > 0 {
        marks.push(Mark::simple("bold"));
    }
    if italic > 0 {
        marks.push(Mark::simple("italic"));
    }
    nodes.push(Node {
        marks,
        ..Node::text(&text)
    });
}

// Drop leading/trailing breaks and the whitespace at the edges of the run.
fn trim_inline(mut nodes: Vec<Node>) -> Vec<Node> {
    while nodes.first().is_some_and(|n| n.kind == "hardBreak") {
        nodes.remove(0);
    }
    while nodes.last().is_some_and(|n| n.kind == "hardBreak") {
        nodes.pop();
    }
    if let Some(text) = nodes.first_mut().and_then(|n| n.text.as_mut()) {
        *text = text.trim_start().to_string();
    }
    if let Some(text) = nodes.last_mut().and_then(|n| n.text.as_mut()) {
        *text = text.trim_end().to_string();
    }
    nodes.retain(|n| n.kind != "text" || n.text.as_deref().is_some_and(|t| !t.is_empty()));
    nodes
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let lower = entity.to_ascii_lowercase();
            let decoded = if let Some(hex) = lower.strip_prefix("#x") {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = lower.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match lower.as_str() {
                    "nbsp" => Some(' '),
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "ndash" => Some('\u{2013}'),
                    "mdash" => Some('\u{2014}'),
                    "hellip" => Some('\u{2026}'),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}
