//! Streaming dump parser
//!
//! Reads a gzipped dump with quick-xml's pull parser, keeping only the record
//! currently being assembled in memory. Records come out in batches over a
//! bounded channel so a slow writer throttles the parser.
//!
//! Nesting is tracked by depth, not by tag: `<label>` appears inside
//! `<label><sublabels>` and `<artist>` inside every release, but only elements
//! that open directly under the root start a new record.

use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::ParseError;
use super::records::{CatalogRecord, Element, EntitySpec};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Counts reported once a file has been fully read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub records: u64,
    pub skipped: u64,
    pub batches: u64,
}

pub struct EntityParser<R: BufRead> {
    reader: Reader<R>,
    spec: &'static EntitySpec,
    buf: Vec<u8>,
    /// Open elements of the current record, outermost first
    stack: Vec<Element>,
    skipped: u64,
}

impl EntityParser<BufReader<GzDecoder<BufReader<File>>>> {
    pub fn open(path: &Path, spec: &'static EntitySpec) -> Result<Self, ParseError> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::with_capacity(READ_BUFFER_SIZE, file));
        Ok(Self::new(
            BufReader::with_capacity(READ_BUFFER_SIZE, decoder),
            spec,
        ))
    }
}

impl<R: BufRead> EntityParser<R> {
    pub fn new(source: R, spec: &'static EntitySpec) -> Self {
        Self {
            reader: Reader::from_reader(source),
            spec,
            buf: Vec::with_capacity(8 * 1024),
            stack: Vec::new(),
            skipped: 0,
        }
    }

    /// Records dropped because they could not be built
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next well-formed record, or `None` at end of file
    pub fn next_record(&mut self) -> Result<Option<CatalogRecord>, ParseError> {
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|e| ParseError::Xml {
                    position: self.reader.buffer_position() as u64,
                    message: e.to_string(),
                })?;

            let finished = match event {
                Event::Start(ref start) => {
                    let element = open_element(start);
                    if !self.stack.is_empty() || element.name == self.spec.record_tag {
                        self.stack.push(element);
                    }
                    None
                },
                Event::Empty(ref start) => {
                    let element = open_element(start);
                    match self.stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(element);
                            None
                        },
                        None if element.name == self.spec.record_tag => Some(element),
                        None => None,
                    }
                },
                Event::End(_) => match self.stack.pop() {
                    Some(element) => match self.stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(element);
                            None
                        },
                        None => Some(element),
                    },
                    None => None,
                },
                Event::Text(ref text) => {
                    if let Some(current) = self.stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(text));
                    }
                    None
                },
                Event::CData(ref data) => {
                    if let Some(current) = self.stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(data));
                    }
                    None
                },
                Event::GeneralRef(ref reference) => {
                    if let Some(current) = self.stack.last_mut() {
                        push_reference(&mut current.text, &String::from_utf8_lossy(reference));
                    }
                    None
                },
                Event::Eof => {
                    if let Some(open) = self.stack.first() {
                        return Err(ParseError::UnexpectedEof(open.name.clone()));
                    }
                    return Ok(None);
                },
                _ => None,
            };

            if let Some(element) = finished {
                match self.spec.build(&element) {
                    Ok(record) => return Ok(Some(record)),
                    Err(e) => {
                        self.skipped += 1;
                        warn!(entity = %self.spec.entity, error = %e, "Skipping malformed record");
                    },
                }
            }
        }
    }
}

fn open_element(start: &BytesStart<'_>) -> Element {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        let value = match quick_xml::escape::unescape(&raw) {
            Ok(unescaped) => unescaped.into_owned(),
            Err(_) => raw,
        };
        element.attrs.push((key, value));
    }
    element
}

/// Expand `&name;` (given without the delimiters) into `out`
fn push_reference(out: &mut String, name: &str) {
    let resolved = match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => name
            .strip_prefix("#x")
            .or_else(|| name.strip_prefix("#X"))
            .map(|hex| u32::from_str_radix(hex, 16))
            .or_else(|| name.strip_prefix('#').map(str::parse::<u32>))
            .and_then(Result::ok)
            .and_then(char::from_u32),
    };

    match resolved {
        Some(c) => out.push(c),
        None => {
            out.push('&');
            out.push_str(name);
            out.push(';');
        },
    }
}

/// Parse a whole file, sending batches of `batch_size` records down `tx`.
///
/// Blocking: run it on `spawn_blocking`. Stops early (without error) if the
/// receiver goes away.
pub fn parse_file(
    path: &Path,
    spec: &'static EntitySpec,
    batch_size: usize,
    tx: mpsc::Sender<Vec<CatalogRecord>>,
) -> Result<ParseSummary, ParseError> {
    let mut parser = EntityParser::open(path, spec)?;
    let mut summary = ParseSummary::default();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(record) = parser.next_record()? {
        batch.push(record);
        summary.records += 1;

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.blocking_send(full).is_err() {
                debug!(entity = %spec.entity, "Batch receiver dropped, stopping parse");
                summary.skipped = parser.skipped();
                return Ok(summary);
            }
            summary.batches += 1;
        }
    }

    if !batch.is_empty() && tx.blocking_send(batch).is_ok() {
        summary.batches += 1;
    }

    summary.skipped = parser.skipped();
    Ok(summary)
}
