//! Sparse in-memory model of one worksheet part.
//!
//! Only `<sheetData>` is parsed. Everything before and after it is kept as raw
//! bytes, and so is every row and cell until it is written to.

use crate::{
    coord::{MAX_COLS, MAX_ROWS, col_letter, coord, split_coord},
    escape::{decode_excel_escapes, encode_excel_escapes, needs_encoding},
};
use anyhow::{Context, Result, bail};
use quick_xml::{
    Reader, Writer,
    events::{BytesStart, BytesText, Event},
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub(crate) enum CellContent {
    /// Cell as found in the source file, kept verbatim.
    Loaded {
        raw: Vec<u8>,
        kind: Option<String>,
        value: Option<String>,
        inline: Option<String>,
        formula: bool,
        blank: bool,
    },
    /// Inline string written through the session.
    Text(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Cell {
    pub(crate) style: Option<String>,
    pub(crate) content: CellContent,
}

impl Cell {
    pub(crate) fn is_blank(&self) -> bool {
        match &self.content {
            CellContent::Loaded { blank, .. } => *blank,
            CellContent::Text(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Row {
    attrs: Vec<(String, String)>,
    pub(crate) cells: BTreeMap<u32, Cell>,
    // `<row>…</row>` bytes as read from the file; dropped on first write
    raw: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct CellBody {
    value: Option<String>,
    inline: Option<String>,
    formula: bool,
    has_content: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SheetModel {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    // namespace prefix used by the part, e.g. "x:" or ""
    ns: String,
    rows: BTreeMap<u32, Row>,
    // A1 references of formula cells replaced by text
    cleared_formulas: BTreeSet<String>,
    dirty: bool,
}

pub(crate) fn attr_map(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .with_checks(false)
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&a.value).into_owned(),
            )
        })
        .collect()
}

pub(crate) fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find_map(|(k, v)| (k == key).then_some(v.as_str()))
}

fn unescape_span(xml: &[u8], start: usize, end: usize) -> Result<String> {
    let s = std::str::from_utf8(&xml[start..end]).context("worksheet text is not UTF-8")?;
    Ok(quick_xml::escape::unescape(s)
        .context("bad XML escape in worksheet")?
        .into_owned())
}

impl SheetModel {
    pub(crate) fn parse(xml: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        let mut rows = BTreeMap::new();
        let mut bounds: Option<(usize, usize)> = None;
        let mut ns = String::new();

        loop {
            let start = reader.buffer_position() as usize;
            match reader.read_event().context("malformed worksheet XML")? {
                Event::Empty(ref e) if e.local_name().as_ref() == b"sheetData" => {
                    ns = ns_prefix(e);
                    bounds = Some((start, reader.buffer_position() as usize));
                }
                Event::Start(ref e) if e.local_name().as_ref() == b"sheetData" => {
                    ns = ns_prefix(e);
                    Self::parse_rows(&mut reader, xml, &mut rows)?;
                    bounds = Some((start, reader.buffer_position() as usize));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let (sd_start, sd_end) = bounds.context("<sheetData> not found in worksheet")?;
        log::debug!("parsed worksheet: {} rows", rows.len());
        Ok(Self {
            prefix: xml[..sd_start].to_vec(),
            suffix: xml[sd_end..].to_vec(),
            ns,
            rows,
            cleared_formulas: BTreeSet::new(),
            dirty: false,
        })
    }

    fn parse_rows(
        reader: &mut Reader<&[u8]>,
        xml: &[u8],
        rows: &mut BTreeMap<u32, Row>,
    ) -> Result<()> {
        let mut next_row = 0u32;
        loop {
            let start = reader.buffer_position() as usize;
            match reader.read_event().context("malformed worksheet XML")? {
                Event::Empty(ref e) if e.local_name().as_ref() == b"row" => {
                    let attrs = attr_map(e);
                    let (idx, explicit) = row_index(&attrs, next_row)?;
                    let raw = explicit.then(|| xml[start..reader.buffer_position() as usize].to_vec());
                    rows.insert(idx, Row { attrs, cells: BTreeMap::new(), raw });
                    next_row = idx + 1;
                }
                Event::Start(ref e) if e.local_name().as_ref() == b"row" => {
                    let attrs = attr_map(e);
                    let (idx, explicit) = row_index(&attrs, next_row)?;
                    let cells = Self::parse_cells(reader, xml, idx)?;
                    let raw = explicit.then(|| xml[start..reader.buffer_position() as usize].to_vec());
                    rows.insert(idx, Row { attrs, cells, raw });
                    next_row = idx + 1;
                }
                Event::End(ref e) if e.local_name().as_ref() == b"sheetData" => return Ok(()),
                Event::Eof => bail!("unexpected end of worksheet inside <sheetData>"),
                _ => {}
            }
        }
    }

    fn parse_cells(
        reader: &mut Reader<&[u8]>,
        xml: &[u8],
        row: u32,
    ) -> Result<BTreeMap<u32, Cell>> {
        let mut cells = BTreeMap::new();
        let mut next_col = 0u32;
        loop {
            let start = reader.buffer_position() as usize;
            match reader.read_event().context("malformed worksheet XML")? {
                Event::Empty(ref e) if e.local_name().as_ref() == b"c" => {
                    let attrs = attr_map(e);
                    let end = reader.buffer_position() as usize;
                    let (col, raw) = cell_ref(&attrs, e, &xml[start..end], end - start, row, next_col)?;
                    cells.insert(
                        col,
                        Cell {
                            style: attr(&attrs, "s").map(str::to_owned),
                            content: CellContent::Loaded {
                                raw,
                                kind: attr(&attrs, "t").map(str::to_owned),
                                value: None,
                                inline: None,
                                formula: false,
                                blank: true,
                            },
                        },
                    );
                    next_col = col + 1;
                }
                Event::Start(ref e) if e.local_name().as_ref() == b"c" => {
                    let attrs = attr_map(e);
                    let tag_len = reader.buffer_position() as usize - start;
                    let body = Self::parse_cell_body(reader, xml)?;
                    let end = reader.buffer_position() as usize;
                    let (col, raw) = cell_ref(&attrs, e, &xml[start..end], tag_len, row, next_col)?;
                    cells.insert(
                        col,
                        Cell {
                            style: attr(&attrs, "s").map(str::to_owned),
                            content: CellContent::Loaded {
                                raw,
                                kind: attr(&attrs, "t").map(str::to_owned),
                                value: body.value,
                                inline: body.inline,
                                formula: body.formula,
                                blank: !body.has_content,
                            },
                        },
                    );
                    next_col = col + 1;
                }
                Event::End(ref e) if e.local_name().as_ref() == b"row" => return Ok(cells),
                Event::Eof => bail!("unexpected end of worksheet inside <row>"),
                _ => {}
            }
        }
    }

    /// Reads the children of `<c>` up to and including `</c>`.
    fn parse_cell_body(reader: &mut Reader<&[u8]>, xml: &[u8]) -> Result<CellBody> {
        let mut body = CellBody::default();
        loop {
            match reader.read_event().context("malformed worksheet XML")? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"v" => {
                        let span = reader.read_to_end(e.name())?;
                        body.value =
                            Some(unescape_span(xml, span.start as usize, span.end as usize)?);
                        body.has_content = true;
                    }
                    b"is" => {
                        body.inline = Some(read_rich_text(reader, xml)?);
                        body.has_content = true;
                    }
                    b"f" => {
                        reader.read_to_end(e.name())?;
                        body.formula = true;
                        body.has_content = true;
                    }
                    _ => {
                        reader.read_to_end(e.name())?;
                    }
                },
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"f" => {
                        body.formula = true;
                        body.has_content = true;
                    }
                    b"v" | b"is" => body.has_content = true,
                    _ => {}
                },
                Event::End(ref e) if e.local_name().as_ref() == b"c" => return Ok(body),
                Event::Eof => bail!("unexpected end of worksheet inside <c>"),
                _ => {}
            }
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn last_row(&self) -> Option<u32> {
        self.rows.keys().next_back().copied()
    }

    pub(crate) fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.rows.get(&row)?.cells.get(&col)
    }

    /// Returns the row at `idx`, creating an empty one if needed.
    pub(crate) fn row_mut(&mut self, idx: u32) -> &mut Row {
        self.dirty = true;
        let row = self.rows.entry(idx).or_default();
        row.raw = None;
        row
    }

    pub(crate) fn set_text(&mut self, row: u32, col: u32, value: &str) {
        if self.row_mut(row).set_text(col, value) {
            self.cleared_formulas.insert(coord(row, col));
        }
    }

    /// Formula cells overwritten since `open`; their calc chain entries are stale.
    pub(crate) fn cleared_formulas(&self) -> &BTreeSet<String> {
        &self.cleared_formulas
    }

    pub(crate) fn is_row_empty(&self, row: u32) -> bool {
        match self.rows.get(&row) {
            None => true,
            Some(r) => r.cells.values().all(Cell::is_blank),
        }
    }

    /// Serializes the sheet back to XML.
    pub(crate) fn to_xml(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.prefix.len() + self.suffix.len() + 64 * self.rows.len());
        out.extend_from_slice(&self.prefix_with_dimension());

        let ns = &self.ns;
        if self.rows.is_empty() {
            out.extend_from_slice(format!("<{ns}sheetData/>").as_bytes());
        } else {
            out.extend_from_slice(format!("<{ns}sheetData>").as_bytes());
            for (idx, row) in &self.rows {
                row.write_xml(&mut out, ns, *idx)?;
            }
            out.extend_from_slice(format!("</{ns}sheetData>").as_bytes());
        }

        out.extend_from_slice(&self.suffix);
        Ok(out)
    }

    /// `prefix` with `<dimension ref="…"/>` recomputed from the cells.
    fn prefix_with_dimension(&self) -> Vec<u8> {
        let mut prefix = self.prefix.clone();
        let tag = format!("<{}dimension", self.ns);
        let Some(pos) = memchr::memmem::find(&prefix, tag.as_bytes()) else {
            return prefix;
        };
        let Some(attr_pos) = memchr::memmem::find(&prefix[pos..], b"ref=\"").map(|p| p + pos + 5)
        else {
            return prefix;
        };
        let Some(end) = memchr::memchr(b'"', &prefix[attr_pos..]).map(|p| p + attr_pos) else {
            return prefix;
        };
        let dim = self.dimension();
        prefix.splice(attr_pos..end, dim.into_bytes());
        prefix
    }

    fn dimension(&self) -> String {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (r, row) in &self.rows {
            let (Some(first), Some(last)) = (row.cells.keys().next(), row.cells.keys().next_back())
            else {
                continue;
            };
            bounds = Some(match bounds {
                None => (*r, *r, *first, *last),
                Some((r0, r1, c0, c1)) => (r0.min(*r), r1.max(*r), c0.min(*first), c1.max(*last)),
            });
        }
        match bounds {
            None => "A1".to_owned(),
            Some((r0, r1, c0, c1)) if r0 == r1 && c0 == c1 => coord(r0, c0),
            Some((r0, r1, c0, c1)) => format!("{}:{}", coord(r0, c0), coord(r1, c1)),
        }
    }
}

impl Row {
    /// Returns `true` if a formula cell was replaced.
    pub(crate) fn set_text(&mut self, col: u32, value: &str) -> bool {
        self.raw = None;
        let cell = Cell {
            style: None,
            content: CellContent::Text(value.to_owned()),
        };
        match self.cells.insert(col, cell) {
            Some(old) => {
                if let Some(c) = self.cells.get_mut(&col) {
                    c.style = old.style;
                }
                matches!(old.content, CellContent::Loaded { formula: true, .. })
            }
            None => false,
        }
    }

    fn write_xml(&self, out: &mut Vec<u8>, ns: &str, idx: u32) -> Result<()> {
        if let Some(raw) = &self.raw {
            out.extend_from_slice(raw);
            return Ok(());
        }

        out.extend_from_slice(format!("<{ns}row r=\"{}\"", idx + 1).as_bytes());
        // stale once cells change, and optional anyway
        for (k, v) in self.attrs.iter().filter(|(k, _)| k != "r" && k != "spans") {
            out.extend_from_slice(format!(" {k}=\"{v}\"").as_bytes());
        }
        if self.cells.is_empty() {
            out.extend_from_slice(b"/>");
            return Ok(());
        }
        out.push(b'>');

        for (col, cell) in &self.cells {
            match &cell.content {
                CellContent::Loaded { raw, .. } => out.extend_from_slice(raw),
                CellContent::Text(text) => {
                    write_text_cell(out, ns, &coord(idx, *col), cell.style.as_deref(), text)?
                }
            }
        }
        out.extend_from_slice(format!("</{ns}row>").as_bytes());
        Ok(())
    }
}

/// `<c r=".." t="inlineStr"><is><t>text</t></is></c>`
fn write_text_cell(
    out: &mut Vec<u8>,
    ns: &str,
    coord: &str,
    style: Option<&str>,
    text: &str,
) -> Result<()> {
    let mut writer = Writer::new(out);
    let mut c_elem = writer
        .create_element(format!("{ns}c"))
        .with_attribute(("r", coord));
    if let Some(s) = style {
        c_elem = c_elem.with_attribute(("s", s));
    }
    c_elem
        .with_attribute(("t", "inlineStr"))
        .write_inner_content(|w| {
            w.create_element(format!("{ns}is")).write_inner_content(|w2| {
                let mut t_elem = w2.create_element(format!("{ns}t"));
                if text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace) {
                    t_elem = t_elem.with_attribute(("xml:space", "preserve"));
                }
                if needs_encoding(text) {
                    t_elem.write_text_content(BytesText::new(&encode_excel_escapes(text)))?;
                } else {
                    t_elem.write_text_content(BytesText::new(text))?;
                }
                Ok(())
            })?;
            Ok(())
        })?;
    Ok(())
}

/// Concatenated `<t>` runs of an `<is>`/`<si>` element, phonetic runs skipped.
/// Consumes events up to the element's end tag.
pub(crate) fn read_rich_text(reader: &mut Reader<&[u8]>, xml: &[u8]) -> Result<String> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event().context("malformed rich text XML")? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"t" => {
                    let span = reader.read_to_end(e.name())?;
                    let raw = unescape_span(xml, span.start as usize, span.end as usize)?;
                    text.push_str(&decode_excel_escapes(&raw));
                }
                b"rPh" | b"phoneticPr" => {
                    reader.read_to_end(e.name())?;
                }
                _ => depth += 1,
            },
            Event::End(_) if depth == 0 => return Ok(text),
            Event::End(_) => depth -= 1,
            Event::Eof => bail!("unexpected end of XML inside rich text"),
            _ => {}
        }
    }
}

fn ns_prefix(e: &BytesStart<'_>) -> String {
    e.name()
        .prefix()
        .map(|p| format!("{}:", String::from_utf8_lossy(p.as_ref())))
        .unwrap_or_default()
}

/// 0-based row index from the `r` attribute, or the implicit next index.
fn row_index(attrs: &[(String, String)], next: u32) -> Result<(u32, bool)> {
    let (idx, explicit) = match attr(attrs, "r").map(str::parse::<u32>) {
        Some(Ok(r)) if r > 0 => (r - 1, true),
        Some(_) => {
            log::warn!("unparsable row reference, using implicit row {}", next + 1);
            (next, false)
        }
        None => (next, false),
    };
    if idx >= MAX_ROWS {
        bail!("row {} is beyond the last worksheet row ({MAX_ROWS})", u64::from(idx) + 1);
    }
    Ok((idx, explicit))
}

/// Column of a cell and its raw bytes. A missing or unparsable `r` is
/// replaced by the implicit position so the cell stays put when neighbours
/// are added. `tag_len` is the length of the start tag within `raw`.
fn cell_ref(
    attrs: &[(String, String)],
    e: &BytesStart<'_>,
    raw: &[u8],
    tag_len: usize,
    row: u32,
    next: u32,
) -> Result<(u32, Vec<u8>)> {
    match attr(attrs, "r").map(split_coord) {
        Some(Ok((col, _))) if col >= MAX_COLS => {
            bail!("column {} in row {} is beyond the last worksheet column", u64::from(col) + 1, row + 1)
        }
        Some(Ok((col, _))) => return Ok((col, raw.to_vec())),
        Some(Err(_)) => log::warn!(
            "unparsable cell reference in row {}, using column {}",
            row + 1,
            col_letter(next)
        ),
        None => {}
    }
    if next >= MAX_COLS {
        bail!("implicit cell in row {} is beyond the last worksheet column", row + 1);
    }

    let name = e.name();
    let mut out = format!("<{} r=\"{}\"", String::from_utf8_lossy(name.as_ref()), coord(row, next))
        .into_bytes();
    for a in e.attributes().with_checks(false).flatten() {
        if a.key.as_ref() == b"r" {
            continue;
        }
        out.push(b' ');
        out.extend_from_slice(a.key.as_ref());
        out.extend_from_slice(b"=\"");
        out.extend_from_slice(&a.value);
        out.push(b'"');
    }
    let self_closing = tag_len == raw.len() && raw.ends_with(b"/>");
    out.extend_from_slice(if self_closing { &b"/>"[..] } else { &b">"[..] });
    out.extend_from_slice(&raw[tag_len..]);
    Ok((next, out))
}
