//! Content extraction: one page file in, one [`Page`] record out.
//!
//! Page files are XML documents with a `<Page>` root (or the abbreviated
//! `<P>`), a `<Path>` of `<Section>` names, optional `<Identifiers>` and an
//! HTML-like `<Body>`:
//!
//! ```xml
//! <Page Id="4711" HelpId="12345" Title="MC_BR_MoveAbsolute" Category="Motion">
//!   <Path><Section>Motion</Section><Section>mapp Motion</Section></Path>
//!   <Body><p>Moves an axis to an absolute position.</p></Body>
//! </Page>
//! ```
//!
//! Parsing is defensive: document type declarations are rejected outright,
//! so no DTD, internal entity or external entity is ever processed. Only the
//! predefined XML entities, character references and a fixed table of common
//! HTML entities are decoded.

use std::{
    fs::File,
    io::Read,
    path::Path,
    time::{Duration, Instant},
};

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

use crate::{
    doc_id::PageId,
    incremental::hash_bytes,
    page::Page,
    text_util::{ParagraphBuffer, collapse_whitespace},
};

/// Files above this size are rejected without parsing.
pub const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

/// Deepest section path accepted.
pub const MAX_SECTION_DEPTH: usize = 100;

/// Default per-file extraction budget.
pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How many parser events pass between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// Elements that end a paragraph of body text.
const BLOCK_TAGS: &[&str] = &[
    "p",
    "div",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "li",
    "td",
    "th",
    "tr",
    "table",
    "blockquote",
    "pre",
    "br",
    "section",
    "article",
    "ul",
    "ol",
    "dl",
    "dt",
    "dd",
];

/// Elements whose text never reaches the body.
const SKIPPED_TAGS: &[&str] = &["script", "style"];

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("malformed markup in {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("unsafe markup in {path}: {reason}")]
    UnsafeMarkup { path: String, reason: String },

    #[error("{path} is missing required field {field}")]
    MissingField { path: String, field: &'static str },

    #[error("{path} has an invalid {field}: {value:?}")]
    InvalidField {
        path: String,
        field: &'static str,
        value: String,
    },

    #[error("extraction of {path} ran past its deadline")]
    TimedOut { path: String },
}

impl ExtractionError {
    /// Corpus-relative path of the file that failed.
    pub fn path(&self) -> &str {
        match self {
            ExtractionError::Unreadable { path, .. }
            | ExtractionError::TooLarge { path, .. }
            | ExtractionError::Malformed { path, .. }
            | ExtractionError::UnsafeMarkup { path, .. }
            | ExtractionError::MissingField { path, .. }
            | ExtractionError::InvalidField { path, .. }
            | ExtractionError::TimedOut { path } => path,
        }
    }

    /// Short machine-readable failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::Unreadable { .. } => "unreadable",
            ExtractionError::TooLarge { .. } => "too_large",
            ExtractionError::Malformed { .. } => "malformed",
            ExtractionError::UnsafeMarkup { .. } => "unsafe_markup",
            ExtractionError::MissingField { .. } => "missing_field",
            ExtractionError::InvalidField { .. } => "invalid_field",
            ExtractionError::TimedOut { .. } => "timed_out",
        }
    }
}

/// Read and extract one page file.
pub fn extract_file(
    relative_path: &str,
    absolute_path: &Path,
    deadline: Instant,
) -> Result<Page, ExtractionError> {
    let unreadable = |source| ExtractionError::Unreadable {
        path: relative_path.to_string(),
        source,
    };

    let file = File::open(absolute_path).map_err(unreadable)?;
    let declared_size = file.metadata().map(|m| m.len()).ok();
    let mut bytes = Vec::new();
    file.take(MAX_FILE_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(unreadable)?;

    if bytes.len() as u64 > MAX_FILE_BYTES {
        return Err(ExtractionError::TooLarge {
            path: relative_path.to_string(),
            size: declared_size.unwrap_or(bytes.len() as u64),
            limit: MAX_FILE_BYTES,
        });
    }

    let content_hash = hash_bytes(&bytes);
    let markup =
        String::from_utf8(bytes).map_err(|_| ExtractionError::Malformed {
            path: relative_path.to_string(),
            reason: "file is not valid UTF-8".to_string(),
        })?;

    parse_page(relative_path, markup, content_hash, deadline)
}

/// Extract a page from in-memory markup.
pub fn extract_str(
    relative_path: &str,
    markup: &str,
    deadline: Instant,
) -> Result<Page, ExtractionError> {
    let content_hash = hash_bytes(markup.as_bytes());
    parse_page(relative_path, markup.to_string(), content_hash, deadline)
}

fn parse_page(
    relative_path: &str,
    markup: String,
    content_hash: String,
    deadline: Instant,
) -> Result<Page, ExtractionError> {
    let parsed = {
        let mut parser = PageParser::new(relative_path);
        parser.run(&markup, deadline)?;
        parser.finish()?
    };

    Ok(Page {
        page_id: PageId::from_source_path(relative_path),
        topic_id: parsed.topic_id,
        help_id: parsed.help_id,
        title: parsed.title,
        category: parsed.category,
        section_path: parsed.section_path,
        body_text: parsed.body_text,
        raw_markup: markup,
        source_path: relative_path.to_string(),
        content_hash,
        href: parsed.href,
        order: parsed.order,
        indexed_seq: 0,
        indexed_at: 0,
    })
}

/// Decode the fixed set of HTML named entities accepted in page text.
fn resolve_html_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "nbsp" => "\u{a0}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "deg" => "\u{b0}",
        "micro" => "\u{b5}",
        "plusmn" => "\u{b1}",
        "times" => "\u{d7}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "shy" => "\u{ad}",
        _ => return None,
    })
}

fn name_is(name: &[u8], full: &str, short: &str) -> bool {
    name == full.as_bytes() || name == short.as_bytes()
}

fn tag_in(name: &[u8], tags: &[&str]) -> bool {
    tags.iter().any(|t| name.eq_ignore_ascii_case(t.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Page,
    Path,
    Section,
    Body,
    Identifiers,
    HelpId,
    Html { block: bool, skip: bool },
    Other,
}

#[derive(Debug, Default)]
struct PageAttrs {
    topic_id: Option<u64>,
    help_id: Option<u64>,
    title: Option<String>,
    category: Option<String>,
    href: Option<String>,
    order: Option<i64>,
}

#[derive(Debug)]
struct ParsedPage {
    topic_id: u64,
    help_id: Option<u64>,
    title: String,
    category: String,
    section_path: Vec<String>,
    body_text: String,
    href: Option<String>,
    order: Option<i64>,
}

struct PageParser<'p> {
    path: &'p str,
    stack: Vec<Frame>,
    attrs: Option<PageAttrs>,
    root_closed: bool,
    sections: Vec<String>,
    section_text: Option<String>,
    nested_help_id: Option<u64>,
    body: ParagraphBuffer,
    in_body: bool,
    skip_depth: usize,
}

impl<'p> PageParser<'p> {
    fn new(path: &'p str) -> Self {
        Self {
            path,
            stack: Vec::new(),
            attrs: None,
            root_closed: false,
            sections: Vec::new(),
            section_text: None,
            nested_help_id: None,
            body: ParagraphBuffer::new(),
            in_body: false,
            skip_depth: 0,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> ExtractionError {
        ExtractionError::Malformed {
            path: self.path.to_string(),
            reason: reason.into(),
        }
    }

    fn invalid(&self, field: &'static str, value: &str) -> ExtractionError {
        ExtractionError::InvalidField {
            path: self.path.to_string(),
            field,
            value: value.to_string(),
        }
    }

    fn run(
        &mut self,
        markup: &str,
        deadline: Instant,
    ) -> Result<(), ExtractionError> {
        let mut reader = Reader::from_str(markup);
        reader.config_mut().check_end_names = true;

        let mut events = 0usize;
        loop {
            if events % DEADLINE_CHECK_INTERVAL == 0
                && Instant::now() >= deadline
            {
                return Err(ExtractionError::TimedOut {
                    path: self.path.to_string(),
                });
            }
            events += 1;

            let event = reader
                .read_event()
                .map_err(|e| self.malformed(e.to_string()))?;

            match event {
                Event::DocType(_) => {
                    return Err(ExtractionError::UnsafeMarkup {
                        path: self.path.to_string(),
                        reason: "document type declarations are not allowed"
                            .to_string(),
                    });
                }
                Event::Start(start) => {
                    let frame = self.open(&start)?;
                    self.stack.push(frame);
                }
                Event::Empty(start) => {
                    let frame = self.open(&start)?;
                    self.close(frame)?;
                }
                Event::End(_) => {
                    let frame = self
                        .stack
                        .pop()
                        .ok_or_else(|| self.malformed("unbalanced end tag"))?;
                    self.close(frame)?;
                }
                Event::Text(text) => {
                    let decoded = text
                        .unescape_with(resolve_html_entity)
                        .map_err(|e| self.malformed(e.to_string()))?;
                    self.text(&decoded)?;
                }
                Event::CData(cdata) => {
                    let raw = String::from_utf8_lossy(&cdata).into_owned();
                    self.text(&raw)?;
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            }
        }

        if !self.stack.is_empty() {
            return Err(self.malformed("unexpected end of file"));
        }
        Ok(())
    }

    fn open(&mut self, start: &BytesStart<'_>) -> Result<Frame, ExtractionError> {
        let name = start.local_name();
        let name = name.as_ref();

        let Some(parent) = self.stack.last().copied() else {
            if self.root_closed || self.attrs.is_some() {
                return Err(self.malformed("more than one root element"));
            }
            if !name_is(name, "Page", "P") {
                return Err(self.malformed(format!(
                    "root element must be <Page>, found <{}>",
                    String::from_utf8_lossy(name)
                )));
            }
            self.attrs = Some(self.page_attrs(start)?);
            return Ok(Frame::Page);
        };

        let frame = match parent {
            Frame::Page if name_is(name, "Path", "T") => Frame::Path,
            Frame::Page if name_is(name, "Body", "B") => {
                self.in_body = true;
                Frame::Body
            }
            Frame::Page if name_is(name, "Identifiers", "I") => {
                Frame::Identifiers
            }
            Frame::Path if name_is(name, "Section", "S") => {
                self.section_text = Some(String::new());
                Frame::Section
            }
            Frame::Identifiers if name_is(name, "HelpID", "H") => {
                self.read_nested_help_id(start)?;
                Frame::HelpId
            }
            Frame::Body | Frame::Html { .. } => {
                let block = tag_in(name, BLOCK_TAGS);
                let skip = tag_in(name, SKIPPED_TAGS);
                if block {
                    self.body.break_paragraph();
                }
                if skip {
                    self.skip_depth += 1;
                }
                Frame::Html { block, skip }
            }
            _ => Frame::Other,
        };
        Ok(frame)
    }

    fn close(&mut self, frame: Frame) -> Result<(), ExtractionError> {
        match frame {
            Frame::Page => self.root_closed = true,
            Frame::Section => {
                let raw = self.section_text.take().unwrap_or_default();
                let name = collapse_whitespace(&raw);
                if name.is_empty() {
                    return Err(self.invalid("Section", &raw));
                }
                if self.sections.len() >= MAX_SECTION_DEPTH {
                    return Err(self.invalid(
                        "Path",
                        &format!("more than {MAX_SECTION_DEPTH} sections"),
                    ));
                }
                self.sections.push(name);
            }
            Frame::Body => {
                self.body.break_paragraph();
                self.in_body = false;
            }
            Frame::Html { block, skip } => {
                if skip {
                    self.skip_depth = self.skip_depth.saturating_sub(1);
                }
                if block {
                    self.body.break_paragraph();
                }
            }
            Frame::Path | Frame::Identifiers | Frame::HelpId | Frame::Other => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), ExtractionError> {
        if let Some(buf) = self.section_text.as_mut() {
            buf.push_str(text);
        } else if self.in_body && self.skip_depth == 0 {
            self.body.push_text(text);
        } else if self.stack.is_empty() && !text.trim().is_empty() {
            return Err(self.malformed("text outside the root element"));
        }
        Ok(())
    }

    fn attributes(
        &self,
        start: &BytesStart<'_>,
    ) -> Result<Vec<(String, String)>, ExtractionError> {
        let mut out = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| self.malformed(e.to_string()))?;
            let key =
                String::from_utf8_lossy(attr.key.local_name().as_ref())
                    .into_owned();
            let value = attr
                .unescape_value_with(resolve_html_entity)
                .map_err(|e| self.malformed(e.to_string()))?;
            out.push((key, value.into_owned()));
        }
        Ok(out)
    }

    fn page_attrs(
        &self,
        start: &BytesStart<'_>,
    ) -> Result<PageAttrs, ExtractionError> {
        let attrs = self.attributes(start)?;
        let get = |full: &str, short: &str| {
            attrs
                .iter()
                .find(|(k, _)| k == full || k == short)
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty())
        };

        let topic_id = get("Id", "i")
            .map(|v| v.parse::<u64>().map_err(|_| self.invalid("Id", v)))
            .transpose()?;
        let help_id = get("HelpId", "h")
            .map(|v| v.parse::<u64>().map_err(|_| self.invalid("HelpId", v)))
            .transpose()?;
        let order = get("Order", "o")
            .map(|v| v.parse::<i64>().map_err(|_| self.invalid("Order", v)))
            .transpose()?;

        Ok(PageAttrs {
            topic_id,
            help_id,
            title: get("Title", "t").map(collapse_whitespace),
            category: get("Category", "c").map(collapse_whitespace),
            href: get("Href", "f").map(|v| v.replace('\\', "/")),
            order,
        })
    }

    fn read_nested_help_id(
        &mut self,
        start: &BytesStart<'_>,
    ) -> Result<(), ExtractionError> {
        let attrs = self.attributes(start)?;
        let value = attrs
            .iter()
            .find(|(k, _)| k == "Value" || k == "v")
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty());
        if let Some(value) = value {
            let parsed = value
                .parse::<u64>()
                .map_err(|_| self.invalid("HelpID", value))?;
            self.nested_help_id = Some(parsed);
        }
        Ok(())
    }

    fn finish(self) -> Result<ParsedPage, ExtractionError> {
        let path = self.path.to_string();
        let missing = |field| ExtractionError::MissingField {
            path: path.clone(),
            field,
        };

        let attrs = self.attrs.ok_or_else(|| ExtractionError::Malformed {
            path: path.clone(),
            reason: "no <Page> root element".to_string(),
        })?;

        let topic_id = attrs.topic_id.ok_or_else(|| missing("Id"))?;
        let title = attrs
            .title
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing("Title"))?;
        let category = attrs
            .category
            .or_else(|| self.sections.first().cloned())
            .ok_or_else(|| missing("Category"))?;

        Ok(ParsedPage {
            topic_id,
            help_id: self.nested_help_id.or(attrs.help_id),
            title,
            category,
            section_path: self.sections,
            body_text: self.body.finish(),
            href: attrs.href,
            order: attrs.order,
        })
    }
}
