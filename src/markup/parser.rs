//! Lenient markup parser.
//!
//! Tokenization is html5ever's: it decodes character references, switches to
//! raw text for `<script>`/`<style>` and friends and reports syntax errors.
//! html5ever only knows line numbers, so every token is also located in the
//! source text to give it a line and column, and text nodes keep the exact
//! source slice they came from.
//!
//! The tree is built leniently. Unclosed elements are closed at the end of
//! input and stray end tags are dropped. Each recovery is recorded as a
//! [`ParseIssue`].

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, Doctype, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer,
    TokenizerOpts,
};

use crate::source_map::Position;

/// Elements that never have children or an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose content is text up to the matching end tag.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title", "xmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    /// Decoded value. `None` for valueless attributes such as
    /// `<input disabled>`.
    pub value: Option<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub children: Vec<Node>,
    pub position: Position,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Document { children: Vec<Node> },
    Doctype { name: String, position: Position },
    Comment { data: String, position: Position },
    Text {
        /// Decoded text.
        value: String,
        /// The source text, character references intact.
        raw: String,
        position: Position,
    },
    Element(Element),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIssueKind {
    UnclosedElement,
    UnexpectedEndTag,
    UnterminatedComment,
    /// Reported by the tokenizer.
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub kind: ParseIssueKind,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct Parsed {
    /// Always a [`Node::Document`].
    pub document: Node,
    pub issues: Vec<ParseIssue>,
}

pub fn parse(source: &str) -> Parsed {
    let sink = TreeSink {
        src: source,
        lines: LineIndex::new(source),
        cursor: 0,
        text: None,
        open: Vec::new(),
        root: Vec::new(),
        issues: Vec::new(),
    };
    let mut tokenizer = Tokenizer::new(sink, TokenizerOpts::default());
    let mut queue = BufferQueue::new();
    queue.push_back(StrTendril::from_slice(source));
    // The sink never asks for script execution, so feeding always completes
    let _ = tokenizer.feed(&mut queue);
    tokenizer.end();

    let mut sink = tokenizer.sink;
    sink.finish();
    Parsed {
        document: Node::Document { children: sink.root },
        issues: sink.issues,
    }
}

/// Byte offset to 1-based line/column.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(src: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(src.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn position(&self, src: &str, offset: usize) -> Position {
        let line = self.starts.partition_point(|start| *start <= offset);
        let start = self.starts[line - 1];
        let column = src.get(start..offset).map_or(0, |s| s.chars().count());
        Position::new(line as u32, column as u32 + 1)
    }
}

/// Text collected since the last markup token.
struct PendingText {
    value: String,
    start: usize,
}

struct TreeSink<'a> {
    src: &'a str,
    lines: LineIndex,
    /// End of the last markup token located in `src`.
    cursor: usize,
    text: Option<PendingText>,
    open: Vec<Element>,
    root: Vec<Node>,
    issues: Vec<ParseIssue>,
}

impl<'a> TokenSink for TreeSink<'a> {
    type Handle = ();

    fn process_token(&mut self, token: Token, line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::CharacterTokens(text) => self.characters(&text),
            Token::NullCharacterToken => self.characters(""),
            Token::TagToken(tag) => return self.tag(tag),
            Token::CommentToken(data) => self.comment(&data),
            Token::DoctypeToken(doctype) => self.doctype(doctype),
            Token::ParseError(message) => {
                let line = u32::try_from(line_number).unwrap_or(u32::MAX);
                self.issues.push(ParseIssue {
                    kind: ParseIssueKind::Syntax(message.into_owned()),
                    position: Position::new(line, 1),
                });
            }
            Token::EOFToken => self.flush_text(self.src.len()),
        }
        TokenSinkResult::Continue
    }
}

impl<'a> TreeSink<'a> {
    fn position(&self, offset: usize) -> Position {
        self.lines.position(self.src, offset)
    }

    fn issue(&mut self, kind: ParseIssueKind, position: Position) {
        self.issues.push(ParseIssue { kind, position });
    }

    fn append(&mut self, node: Node) {
        let siblings = match self.open.last_mut() {
            Some(parent) => &mut parent.children,
            None => &mut self.root,
        };
        if let Node::Text { value, raw, .. } = &node {
            if let Some(Node::Text {
                value: previous,
                raw: previous_raw,
                ..
            }) = siblings.last_mut()
            {
                previous.push_str(value);
                previous_raw.push_str(raw);
                return;
            }
        }
        siblings.push(node);
    }

    fn characters(&mut self, text: &str) {
        let cursor = self.cursor;
        self.text
            .get_or_insert_with(|| PendingText {
                value: String::new(),
                start: cursor,
            })
            .value
            .push_str(text);
    }

    /// Emit pending text, which runs in the source up to `end`.
    fn flush_text(&mut self, end: usize) {
        let Some(text) = self.text.take() else {
            return;
        };
        let raw = self.src.get(text.start..end).unwrap_or_default().to_string();
        let position = self.position(text.start);
        self.append(Node::Text {
            value: text.value,
            raw,
            position,
        });
    }

    /// Locate the next markup token, flush the text before it and return its
    /// start offset.
    fn markup_start(&mut self, found: Option<usize>) -> usize {
        let start = found.unwrap_or(self.cursor);
        self.flush_text(start);
        start
    }

    fn tag(&mut self, tag: Tag) -> TokenSinkResult<()> {
        let name = tag.name.to_string();
        let end_tag = tag.kind == TagKind::EndTag;
        let found = find_tag(self.src, self.cursor, &name, end_tag);
        let start = self.markup_start(found);
        let position = self.position(start);
        let opener = if end_tag { 2 } else { 1 };
        let scanned = scan_tag(self.src, start + opener + name.len());
        self.cursor = scanned.end;

        if end_tag {
            self.end_tag(&name, position);
            return TokenSinkResult::Continue;
        }

        let attrs = tag
            .attrs
            .into_iter()
            .map(|attr| {
                let name = attr.name.local.to_string();
                let occurrence = scanned.attrs.iter().find(|a| a.name == name);
                let has_value = occurrence.map_or(!attr.value.is_empty(), |a| a.has_value);
                Attribute {
                    position: occurrence.map_or(position, |a| self.position(a.offset)),
                    value: has_value.then(|| attr.value.to_string()),
                    name,
                }
            })
            .collect();
        let element = Element {
            name,
            attrs,
            children: Vec::new(),
            position,
        };

        if tag.self_closing || element.is_void() {
            self.append(Node::Element(element));
            return TokenSinkResult::Continue;
        }
        let raw = raw_kind(&element.name);
        self.open.push(element);
        match raw {
            Some(kind) => TokenSinkResult::RawData(kind),
            None => TokenSinkResult::Continue,
        }
    }

    fn end_tag(&mut self, name: &str, position: Position) {
        let Some(index) = self.open.iter().rposition(|e| e.name == name) else {
            self.issue(ParseIssueKind::UnexpectedEndTag, position);
            return;
        };
        while self.open.len() > index {
            if let Some(element) = self.open.pop() {
                if self.open.len() > index {
                    self.issue(ParseIssueKind::UnclosedElement, element.position);
                }
                self.append(Node::Element(element));
            }
        }
    }

    fn comment(&mut self, data: &str) {
        let found = find_comment(self.src, self.cursor);
        let start = self.markup_start(found);
        let position = self.position(start);
        let (end, terminated) = comment_end(self.src, start);
        self.cursor = end;
        if !terminated {
            self.issue(ParseIssueKind::UnterminatedComment, position);
        }
        self.append(Node::Comment {
            data: data.to_string(),
            position,
        });
    }

    fn doctype(&mut self, doctype: Doctype) {
        let found = find_ignore_case(self.src, self.cursor, "<!doctype");
        let start = self.markup_start(found);
        let position = self.position(start);
        self.cursor = self.src[start..]
            .find('>')
            .map_or(self.src.len(), |i| start + i + 1);
        let name = doctype
            .name
            .map_or_else(|| "html".to_string(), |name| name.to_string());
        self.append(Node::Doctype { name, position });
    }

    fn finish(&mut self) {
        self.flush_text(self.src.len());
        while let Some(element) = self.open.pop() {
            self.issue(ParseIssueKind::UnclosedElement, element.position);
            self.append(Node::Element(element));
        }
    }
}

fn raw_kind(name: &str) -> Option<RawKind> {
    if !RAW_TEXT_ELEMENTS.contains(&name) {
        return None;
    }
    Some(match name {
        "script" => RawKind::ScriptData,
        "textarea" | "title" => RawKind::Rcdata,
        _ => RawKind::Rawtext,
    })
}

fn is_space(b: u8) -> bool {
    b.is_ascii_whitespace()
}

fn find_ignore_case(src: &str, from: usize, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    src.as_bytes()
        .get(from..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|i| from + i)
}

/// Offset of `<name` (or `</name`) followed by a tag-name boundary.
fn find_tag(src: &str, from: usize, name: &str, end_tag: bool) -> Option<usize> {
    let open = if end_tag { "</" } else { "<" };
    let needle = format!("{}{}", open, name);
    let bytes = src.as_bytes();
    let mut at = from;
    while let Some(start) = find_ignore_case(src, at, &needle) {
        let after = start + needle.len();
        if bytes
            .get(after)
            .map_or(true, |&b| is_space(b) || b == b'/' || b == b'>')
        {
            return Some(start);
        }
        at = start + 1;
    }
    None
}

/// Offset of the next `<!`, `<?` or `</` that does not open an end tag.
fn find_comment(src: &str, from: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    (from..bytes.len()).find(|&i| {
        bytes[i] == b'<'
            && match bytes.get(i + 1) {
                Some(b'!') | Some(b'?') => true,
                Some(b'/') => bytes
                    .get(i + 2)
                    .is_some_and(|b| !b.is_ascii_alphabetic() && *b != b'>'),
                _ => false,
            }
    })
}

/// End offset of the comment starting at `start` and whether it was closed.
fn comment_end(src: &str, start: usize) -> (usize, bool) {
    let rest = &src[start..];
    if let Some(body) = rest.strip_prefix("<!--") {
        if body.starts_with('>') {
            return (start + 5, true);
        }
        if body.starts_with("->") {
            return (start + 6, true);
        }
        let close = [("-->", 3), ("--!>", 4)]
            .iter()
            .filter_map(|(marker, len)| body.find(marker).map(|i| (i, *len)))
            .min();
        return match close {
            Some((i, len)) => (start + 4 + i + len, true),
            None => (src.len(), false),
        };
    }
    match rest.find('>') {
        Some(i) => (start + i + 1, true),
        None => (src.len(), false),
    }
}

struct ScannedAttribute {
    name: String,
    offset: usize,
    has_value: bool,
}

struct ScannedTag {
    /// Offset just past the closing `>`, or the end of input.
    end: usize,
    attrs: Vec<ScannedAttribute>,
}

/// Walk a tag's attribute list from just after its name, recording where each
/// attribute starts and whether it has a value.
fn scan_tag(src: &str, from: usize) -> ScannedTag {
    let bytes = src.as_bytes();
    let mut attrs = Vec::new();
    let mut i = from.min(src.len());
    while !src.is_char_boundary(i) {
        i += 1;
    }
    loop {
        while i < bytes.len() && (is_space(bytes[i]) || bytes[i] == b'/') {
            i += 1;
        }
        match bytes.get(i) {
            None => return ScannedTag { end: bytes.len(), attrs },
            Some(b'>') => return ScannedTag { end: i + 1, attrs },
            Some(_) => {}
        }

        let offset = i;
        // The first character is always taken so a stray '=' cannot stall
        i += src[i..].chars().next().map_or(1, char::len_utf8);
        while i < bytes.len() && !matches!(bytes[i], b'/' | b'>' | b'=') && !is_space(bytes[i]) {
            i += 1;
        }
        let name = src[offset..i].to_ascii_lowercase();

        let mut j = i;
        while j < bytes.len() && is_space(bytes[j]) {
            j += 1;
        }
        let has_value = bytes.get(j) == Some(&b'=');
        if has_value {
            i = j + 1;
            while i < bytes.len() && is_space(bytes[i]) {
                i += 1;
            }
            match bytes.get(i) {
                Some(&quote) if quote == b'"' || quote == b'\'' => {
                    i = src[i + 1..]
                        .find(quote as char)
                        .map_or(bytes.len(), |close| i + 1 + close + 1);
                }
                _ => {
                    while i < bytes.len() && bytes[i] != b'>' && !is_space(bytes[i]) {
                        i += 1;
                    }
                }
            }
        }

        if !attrs.iter().any(|a: &ScannedAttribute| a.name == name) {
            attrs.push(ScannedAttribute {
                name,
                offset,
                has_value,
            });
        }
    }
}
