//! Recovering markup parser for analyzer frames
//!
//! Tokenizes with winnow, then builds an element tree with a tag stack.
//! Lexical errors are fatal. Unbalanced tags are repaired where the intent is
//! recoverable:
//! - an end tag closes the nearest open element with the same name, along
//!   with anything still open inside it
//! - an end tag with no open counterpart is ignored
//!
//! The document element itself must be closed and nothing may follow it.
//! Nesting is capped at [`MAX_DEPTH`] elements.

use std::borrow::Cow;

use winnow::ascii::{multispace0, multispace1};
use winnow::combinator::{alt, cut_err, delimited, preceded, repeat, terminated};
use winnow::error::{ContextError, ErrMode, StrContext};
use winnow::prelude::*;
use winnow::token::{one_of, take_till, take_until, take_while};

type PResult<T> = winnow::ModalResult<T>;

/// Deepest element nesting `parse_document` accepts; tree walks recurse per level
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub(crate) fn at(message: impl Into<String>, input: &str, offset: usize) -> Self {
        let (line, column) = offset_to_line_column(input, offset);
        ParseError {
            message: message.into(),
            offset,
            line,
            column,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {}, offset {})",
            self.message, self.line, self.column, self.offset
        )
    }
}

impl std::error::Error for ParseError {}

fn offset_to_line_column(input: &str, offset: usize) -> (usize, usize) {
    let bounded = offset.min(input.len());
    let mut line = 1usize;
    let mut column = 1usize;

    for ch in input[..bounded].chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }

    (line, column)
}

// ============ Tree ============

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn new(name: &str, attributes: Vec<(String, String)>) -> Self {
        Self {
            name: name.to_string(),
            attributes,
            children: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Concatenated text of all descendants, in document order
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// First element in document order whose trailing ancestry matches
    /// `path`, like the XPath `//a/b`.
    pub fn find(&self, path: &str) -> Option<&Element> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut trail = Vec::new();
        find_in(&self.root, &segments, &mut trail)
    }

    /// Text of the first element matching `path`
    pub fn text_at(&self, path: &str) -> Option<String> {
        self.find(path).map(Element::text)
    }
}

fn find_in<'a>(
    element: &'a Element,
    segments: &[&str],
    trail: &mut Vec<&'a str>,
) -> Option<&'a Element> {
    trail.push(element.name.as_str());
    if trail.ends_with(segments) {
        return Some(element);
    }
    for child in element.child_elements() {
        if let Some(found) = find_in(child, segments, trail) {
            return Some(found);
        }
    }
    trail.pop();
    None
}

// ============ Document builder ============

/// Parse a document with a single root element.
pub fn parse_document(input: &str) -> Result<Document, ParseError> {
    let mut stream = input;
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    while !stream.is_empty() {
        let offset = input.len() - stream.len();
        let token = token
            .parse_next(&mut stream)
            .map_err(|e| ParseError::at(describe(e), input, offset))?;

        match token {
            Token::Skip => {}
            Token::Text(raw) => {
                let text = decode_entities(raw)
                    .map_err(|message| ParseError::at(message, input, offset))?;
                push_text(&mut stack, text, input, offset)?;
            }
            Token::CData(raw) => push_text(&mut stack, Cow::Borrowed(raw), input, offset)?,
            Token::Start {
                name,
                attributes,
                empty,
            } => {
                if stack.is_empty() && root.is_some() {
                    return Err(ParseError::at(
                        format!("element <{}> after the document element", name),
                        input,
                        offset,
                    ));
                }
                let mut decoded = Vec::with_capacity(attributes.len());
                for (key, raw) in attributes {
                    let value = decode_entities(raw)
                        .map_err(|message| ParseError::at(message, input, offset))?;
                    decoded.push((key.to_string(), value.into_owned()));
                }
                let element = Element::new(name, decoded);
                if empty {
                    attach(&mut stack, &mut root, element);
                } else if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::at(
                        format!("elements nested deeper than {} levels", MAX_DEPTH),
                        input,
                        offset,
                    ));
                } else {
                    stack.push(element);
                }
            }
            Token::End(name) => match stack.iter().rposition(|el| el.name == name) {
                Some(depth) => {
                    let mut closed = stack.split_off(depth);
                    while let Some(element) = closed.pop() {
                        match closed.last_mut() {
                            Some(parent) => parent.children.push(Node::Element(element)),
                            None => attach(&mut stack, &mut root, element),
                        }
                    }
                }
                None if stack.is_empty() => {
                    return Err(ParseError::at(
                        format!("end tag </{}> outside the document element", name),
                        input,
                        offset,
                    ));
                }
                None => log::debug!("Ignoring unmatched end tag </{}>", name),
            },
        }
    }

    if let Some(open) = stack.first() {
        return Err(ParseError::at(
            format!("unclosed element <{}>", open.name),
            input,
            input.len(),
        ));
    }
    root.map(|root| Document { root })
        .ok_or_else(|| ParseError::at("no document element", input, input.len()))
}

fn push_text(
    stack: &mut [Element],
    text: Cow<'_, str>,
    input: &str,
    offset: usize,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Text(text.into_owned())),
        None if text.trim().is_empty() => {}
        None => {
            return Err(ParseError::at(
                "text outside the document element",
                input,
                offset,
            ));
        }
    }
    Ok(())
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

fn describe(err: ErrMode<ContextError>) -> String {
    let message = match err {
        ErrMode::Backtrack(ctx) | ErrMode::Cut(ctx) => ctx.to_string(),
        ErrMode::Incomplete(_) => String::new(),
    };
    if message.is_empty() {
        "malformed markup".to_string()
    } else {
        format!("malformed markup: {}", message.replace('\n', "; "))
    }
}

// ============ Entities ============

fn decode_entities(raw: &str) -> Result<Cow<'_, str>, String> {
    if !raw.contains('&') {
        return Ok(Cow::Borrowed(raw));
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| "unterminated entity reference".to_string())?;
        let entity = &after[..semi];
        let ch = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => numeric_reference(entity)
                .ok_or_else(|| format!("unknown entity &{};", entity))?,
        };
        out.push(ch);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

fn numeric_reference(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    char::from_u32(code)
}

// ============ Tokens ============

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Start {
        name: &'a str,
        attributes: Vec<(&'a str, &'a str)>,
        empty: bool,
    },
    End(&'a str),
    Text(&'a str),
    CData(&'a str),
    /// Comments, processing instructions, declarations
    Skip,
}

fn token<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    alt((comment, cdata, declaration, processing_instruction, end_tag, start_tag, text))
        .parse_next(input)
}

fn comment<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        "<!--",
        cut_err(terminated(take_until(0.., "-->"), "-->"))
            .context(StrContext::Label("comment")),
    )
    .value(Token::Skip)
    .parse_next(input)
}

fn cdata<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        "<![CDATA[",
        cut_err(terminated(take_until(0.., "]]>"), "]]>"))
            .context(StrContext::Label("CDATA section")),
    )
    .map(Token::CData)
    .parse_next(input)
}

fn declaration<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        "<!",
        cut_err(terminated(take_till(0.., '>'), '>')).context(StrContext::Label("declaration")),
    )
    .value(Token::Skip)
    .parse_next(input)
}

fn processing_instruction<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        "<?",
        cut_err(terminated(take_until(0.., "?>"), "?>"))
            .context(StrContext::Label("processing instruction")),
    )
    .value(Token::Skip)
    .parse_next(input)
}

fn end_tag<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        "</",
        cut_err(terminated(name, (ws, '>'))).context(StrContext::Label("end tag")),
    )
    .map(Token::End)
    .parse_next(input)
}

fn start_tag<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    preceded(
        '<',
        cut_err(start_tag_body).context(StrContext::Label("start tag")),
    )
    .parse_next(input)
}

fn start_tag_body<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    let name = name.parse_next(input)?;
    let attributes: Vec<(&str, &str)> = repeat(0.., attribute).parse_next(input)?;
    ws.parse_next(input)?;
    let empty = alt(("/>".value(true), '>'.value(false))).parse_next(input)?;
    Ok(Token::Start {
        name,
        attributes,
        empty,
    })
}

fn attribute<'a>(input: &mut &'a str) -> PResult<(&'a str, &'a str)> {
    (multispace1, name, ws, '=', ws, quoted)
        .map(|(_, key, _, _, _, value)| (key, value))
        .parse_next(input)
}

fn quoted<'a>(input: &mut &'a str) -> PResult<&'a str> {
    alt((
        delimited('"', take_till(0.., ['"', '<']), '"'),
        delimited('\'', take_till(0.., ['\'', '<']), '\''),
    ))
    .parse_next(input)
}

fn text<'a>(input: &mut &'a str) -> PResult<Token<'a>> {
    take_till(1.., '<').map(Token::Text).parse_next(input)
}

fn name<'a>(input: &mut &'a str) -> PResult<&'a str> {
    (
        one_of(|c: char| c.is_alphabetic() || c == '_' || c == ':'),
        take_while(0.., |c: char| {
            c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')
        }),
    )
        .take()
        .parse_next(input)
}

fn ws(input: &mut &str) -> PResult<()> {
    multispace0.void().parse_next(input)
}
