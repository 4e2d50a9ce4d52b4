use crate::{
    XlsxSession,
    calc_chain::{CALC_CHAIN, CalcChainEdit, prune, remove_elements},
    shared_strings::SharedStrings,
    sheet::{SheetModel, attr},
};
use ::zip as zip_crate;
use anyhow::{Context, Result};
use quick_xml::{Reader, escape::unescape, events::Event};
use std::{
    fs::File,
    io::{Read, Seek, Write},
    path::Path,
};
use tempfile::NamedTempFile;

const WORKBOOK: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS: &str = "xl/sharedStrings.xml";
const CONTENT_TYPES: &str = "[Content_Types].xml";

/// Work with files
impl XlsxSession {
    /// Opens the workbook at `src` and selects the sheet called `sheet_name`.
    ///
    /// The file is read completely and closed before this returns; the session
    /// keeps only the in-memory model. A sheet name that is not in the workbook
    /// is an error.
    pub fn open<P: AsRef<Path>>(src: P, sheet_name: &str) -> Result<Self> {
        let src_path = src.as_ref().to_path_buf();
        let file = File::open(&src_path)
            .with_context(|| format!("cannot open {}", src_path.display()))?;
        let mut zip = zip_crate::ZipArchive::new(file)
            .with_context(|| format!("{} is not an xlsx package", src_path.display()))?;

        let workbook_xml = read_part(&mut zip, WORKBOOK)?;
        let rels_xml = read_part(&mut zip, WORKBOOK_RELS)?;

        let sheets = sheet_entries(&workbook_xml)?;
        let (rid, sheet_id) = sheets
            .iter()
            .find_map(|(name, rid, id)| (name == sheet_name).then_some((rid.as_str(), *id)))
            .with_context(|| {
                let names: Vec<&str> = sheets.iter().map(|(n, _, _)| n.as_str()).collect();
                format!("Sheet '{sheet_name}' not found (available: {names:?})")
            })?;
        let sheet_path = resolve_target(&rels_xml, rid)?
            .with_context(|| format!("relationship {rid} for sheet '{sheet_name}' not found"))?;
        log::debug!("sheet '{sheet_name}' -> {sheet_path}");

        let sheet_xml = read_part(&mut zip, &sheet_path)?;
        let sheet = SheetModel::parse(&sheet_xml)
            .with_context(|| format!("cannot parse {sheet_path}"))?;

        let shared_strings = if zip.index_for_name(SHARED_STRINGS).is_some() {
            SharedStrings::parse(&read_part(&mut zip, SHARED_STRINGS)?)?
        } else {
            SharedStrings::default()
        };

        log::info!(
            "opened {} (sheet '{sheet_name}', last row {:?})",
            src_path.display(),
            sheet.last_row()
        );
        Ok(Self {
            src_path,
            sheet_name: sheet_name.to_owned(),
            sheet_path,
            sheet_id,
            sheet,
            shared_strings,
        })
    }

    /// Writes the workbook to `dst`, replacing any file there.
    ///
    /// The package is assembled in a temporary file next to `dst` and moved
    /// into place only once it is complete, so a failed save leaves `dst`
    /// untouched. Every part other than the selected sheet is copied as is,
    /// except the calculation chain when formula cells were overwritten.
    pub fn save_as<P: AsRef<Path>>(&self, dst: P) -> Result<()> {
        let dst = dst.as_ref();
        let dir = match dst.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut zin = zip_crate::ZipArchive::new(
            File::open(&self.src_path)
                .with_context(|| format!("cannot reopen {}", self.src_path.display()))?,
        )?;
        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot write to {}", dir.display()))?;
        let mut zout = zip_crate::ZipWriter::new(tmp);

        let opt: zip_crate::write::FileOptions<'_, ()> = zip_crate::write::FileOptions::default()
            .compression_method(zip_crate::CompressionMethod::Deflated)
            .compression_level(Some(1));

        let sheet_xml = if self.sheet.is_dirty() {
            Some(self.sheet.to_xml()?)
        } else {
            None
        };

        let mut new_files: Vec<(String, Vec<u8>)> = Vec::new();
        if let Some(xml) = sheet_xml {
            new_files.push((self.sheet_path.clone(), xml));
        }
        let mut drop_calc_chain = false;
        match self.calc_chain_edit(&mut zin)? {
            Some(CalcChainEdit::Rewrite(xml)) => new_files.push((CALC_CHAIN.to_owned(), xml)),
            Some(CalcChainEdit::Remove) => {
                drop_calc_chain = true;
                let rels = remove_elements(&read_part(&mut zin, WORKBOOK_RELS)?, b"Relationship", |a| {
                    attr(a, "Type").is_some_and(|t| t.ends_with("/calcChain"))
                })?;
                new_files.push((WORKBOOK_RELS.to_owned(), rels));
                if zin.index_for_name(CONTENT_TYPES).is_some() {
                    let types = remove_elements(&read_part(&mut zin, CONTENT_TYPES)?, b"Override", |a| {
                        attr(a, "PartName") == Some("/xl/calcChain.xml")
                    })?;
                    new_files.push((CONTENT_TYPES.to_owned(), types));
                }
            }
            None => {}
        }

        for i in 0..zin.len() {
            let file = zin.by_index_raw(i)?;
            let name = file.name().to_owned();
            if drop_calc_chain && name == CALC_CHAIN {
                log::info!("{CALC_CHAIN} dropped, no formulas left in it");
                continue;
            }
            match new_files.iter().find(|(path, _)| *path == name) {
                Some((_, xml)) => {
                    zout.start_file(name.as_str(), opt)?;
                    zout.write_all(xml)?;
                }
                None => zout.raw_copy_file(file)?,
            }
        }

        let tmp = zout.finish()?;
        drop(zin);
        tmp.as_file().sync_all()?;
        tmp.persist(dst)
            .with_context(|| format!("cannot replace {}", dst.display()))?;
        log::info!("saved {}", dst.display());
        Ok(())
    }

    /// Replacement for the calculation chain once formulas of the sheet were
    /// overwritten with text, `None` when the chain stays as it is.
    fn calc_chain_edit<R: Read + Seek>(
        &self,
        zin: &mut zip_crate::ZipArchive<R>,
    ) -> Result<Option<CalcChainEdit>> {
        let cleared = self.sheet.cleared_formulas();
        if cleared.is_empty() || zin.index_for_name(CALC_CHAIN).is_none() {
            return Ok(None);
        }
        let xml = read_part(zin, CALC_CHAIN)?;
        match self.sheet_id {
            Some(id) => prune(&xml, id, cleared).map(Some),
            None => Ok(Some(CalcChainEdit::Remove)),
        }
    }

    /// Saves back to the path the workbook was opened from and ends the session.
    pub fn save_and_close(self) -> Result<()> {
        self.save_as(&self.src_path)
    }
}

/// Sheet names of the workbook at `src`, in tab order.
pub fn scan<P: AsRef<Path>>(src: P) -> Result<Vec<String>> {
    let src = src.as_ref();
    let file = File::open(src).with_context(|| format!("cannot open {}", src.display()))?;
    let mut zip = zip_crate::ZipArchive::new(file)?;
    let wb_xml = read_part(&mut zip, WORKBOOK)?;
    Ok(sheet_entries(&wb_xml)?
        .into_iter()
        .map(|(name, _, _)| name)
        .collect())
}

fn read_part<R: Read + Seek>(zip: &mut zip_crate::ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut part = zip
        .by_name(name)
        .with_context(|| format!("{name} not found"))?;
    let mut buf = Vec::with_capacity(part.size() as usize);
    part.read_to_end(&mut buf)?;
    Ok(buf)
}

/// `(name, r:id, sheetId)` of every `<sheet>` in workbook.xml.
fn sheet_entries(workbook_xml: &[u8]) -> Result<Vec<(String, String, Option<u32>)>> {
    let mut rdr = Reader::from_reader(workbook_xml);
    rdr.config_mut().trim_text(true);

    let mut sheets = Vec::new();
    loop {
        match rdr.read_event().context("malformed workbook.xml")? {
            Event::Empty(ref e) | Event::Start(ref e) if e.local_name().as_ref() == b"sheet" => {
                let mut name: Option<String> = None;
                let mut rid: Option<String> = None;
                let mut sheet_id: Option<u32> = None;
                for a in e.attributes().with_checks(false).flatten() {
                    let v = String::from_utf8_lossy(&a.value).into_owned();
                    match a.key.as_ref() {
                        b"name" => name = Some(unescape(&v)?.into_owned()),
                        b"sheetId" => sheet_id = v.trim().parse().ok(),
                        k if k.ends_with(b":id") => rid = Some(v),
                        _ => {}
                    }
                }
                if let (Some(n), Some(r)) = (name, rid) {
                    sheets.push((n, r, sheet_id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheets)
}

/// Part name inside the package for relationship `rid`.
fn resolve_target(rels_xml: &[u8], rid: &str) -> Result<Option<String>> {
    let mut rdr = Reader::from_reader(rels_xml);
    rdr.config_mut().trim_text(true);

    loop {
        match rdr.read_event().context("malformed workbook.xml.rels")? {
            Event::Empty(ref e) | Event::Start(ref e)
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let mut id: Option<String> = None;
                let mut target: Option<String> = None;
                for a in e.attributes().with_checks(false).flatten() {
                    let v = String::from_utf8_lossy(&a.value).into_owned();
                    match a.key.as_ref() {
                        b"Id" => id = Some(v),
                        b"Target" => target = Some(v),
                        _ => {}
                    }
                }
                if let (Some(idv), Some(t)) = (id, target) {
                    if idv == rid {
                        return Ok(Some(part_name(&t)));
                    }
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Targets are relative to `xl/` unless they start with `/`.
fn part_name(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(abs) => abs.to_owned(),
        None if target.starts_with("xl/") => target.to_owned(),
        None => format!("xl/{target}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets() {
        assert_eq!(part_name("worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(part_name("/xl/worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
        assert_eq!(part_name("xl/worksheets/sheet3.xml"), "xl/worksheets/sheet3.xml");
    }

    #[test]
    fn sheet_names_are_unescaped() {
        let wb = br#"<workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>
<sheet name="P&amp;L" sheetId="1" r:id="rId1"/><sheet name="Data" sheetId="2" r:id="rId2"/>
</sheets></workbook>"#;
        let sheets = sheet_entries(wb).unwrap();
        assert_eq!(
            sheets,
            vec![
                ("P&L".to_owned(), "rId1".to_owned(), Some(1)),
                ("Data".to_owned(), "rId2".to_owned(), Some(2))
            ]
        );
    }
}
