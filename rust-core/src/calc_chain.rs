//! Editing of `xl/calcChain.xml` when formula cells are replaced by text.
//!
//! Entries of the chain inherit the sheet id `i` from the previous entry, so
//! kept entries are rewritten with an explicit `i`. A chain left without
//! entries is not valid and must be dropped from the package together with its
//! relationship and content-type override.

use crate::sheet::{attr, attr_map};
use anyhow::{Context, Result};
use quick_xml::{Reader, events::Event};
use std::collections::BTreeSet;

pub(crate) const CALC_CHAIN: &str = "xl/calcChain.xml";

#[derive(Debug, PartialEq)]
pub(crate) enum CalcChainEdit {
    Rewrite(Vec<u8>),
    Remove,
}

/// Drops the entries of `cells` on sheet `sheet_id` from the chain.
pub(crate) fn prune(xml: &[u8], sheet_id: u32, cells: &BTreeSet<String>) -> Result<CalcChainEdit> {
    let sheet_id = sheet_id.to_string();
    let mut reader = Reader::from_reader(xml);
    let mut out = Vec::with_capacity(xml.len());
    let mut copied = 0usize;
    let mut current_i = "0".to_owned();
    let mut kept = 0usize;

    loop {
        let start = reader.buffer_position() as usize;
        let (e, is_start) = match reader.read_event().context("malformed calcChain.xml")? {
            Event::Empty(e) if e.local_name().as_ref() == b"c" => (e, false),
            Event::Start(e) if e.local_name().as_ref() == b"c" => (e, true),
            Event::Eof => break,
            _ => continue,
        };
        if is_start {
            reader.read_to_end(e.name())?;
        }
        let end = reader.buffer_position() as usize;
        let attrs = attr_map(&e);
        if let Some(i) = attr(&attrs, "i") {
            current_i = i.to_owned();
        }

        out.extend_from_slice(&xml[copied..start]);
        copied = end;
        if current_i == sheet_id && attr(&attrs, "r").is_some_and(|r| cells.contains(r)) {
            continue;
        }
        kept += 1;
        let name = e.name();
        out.push(b'<');
        out.extend_from_slice(name.as_ref());
        for (k, v) in attrs.iter().filter(|(k, _)| k != "i") {
            out.extend_from_slice(format!(" {k}=\"{v}\"").as_bytes());
        }
        out.extend_from_slice(format!(" i=\"{current_i}\"/>").as_bytes());
    }
    out.extend_from_slice(&xml[copied..]);

    log::debug!("calc chain: {kept} entries kept");
    Ok(if kept == 0 {
        CalcChainEdit::Remove
    } else {
        CalcChainEdit::Rewrite(out)
    })
}

/// Copy of `xml` without the `local` elements whose attributes match `drop`.
pub(crate) fn remove_elements<F>(xml: &[u8], local: &[u8], drop: F) -> Result<Vec<u8>>
where
    F: Fn(&[(String, String)]) -> bool,
{
    let mut reader = Reader::from_reader(xml);
    let mut out = Vec::with_capacity(xml.len());
    let mut copied = 0usize;
    loop {
        let start = reader.buffer_position() as usize;
        let (e, is_start) = match reader.read_event().context("malformed package part")? {
            Event::Empty(e) if e.local_name().as_ref() == local => (e, false),
            Event::Start(e) if e.local_name().as_ref() == local => (e, true),
            Event::Eof => break,
            _ => continue,
        };
        if is_start {
            reader.read_to_end(e.name())?;
        }
        if drop(&attr_map(&e)) {
            out.extend_from_slice(&xml[copied..start]);
            copied = reader.buffer_position() as usize;
        }
    }
    out.extend_from_slice(&xml[copied..]);
    Ok(out)
}
