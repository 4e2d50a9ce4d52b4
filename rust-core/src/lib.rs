//! Small editing session over an `.xlsx` workbook: open a sheet, write string
//! cells, append rows after the last used one, and save the file back.
//!
//! ```no_run
//! use xlsx_session_core::XlsxSession;
//!
//! let mut session = XlsxSession::open("TestData.xlsx", "Sheet1")?;
//! session.set_cell_value_in_next_row(["Test User", "testuser@example.com"])?;
//! session.save_and_close()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod calc_chain;
pub mod coord;
mod escape;
mod files_part;
mod shared_strings;
mod sheet;

use crate::{
    coord::{MAX_COLS, check_bounds},
    shared_strings::SharedStrings,
    sheet::{CellContent, SheetModel},
};
use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

pub use files_part::scan;

/// An open workbook with one selected sheet.
///
/// Created by [`XlsxSession::open`] and consumed by
/// [`XlsxSession::save_and_close`]. Sessions are independent of each other;
/// two sessions on the same file do not see each other's changes.
#[derive(Debug)]
pub struct XlsxSession {
    src_path: PathBuf,
    sheet_name: String,
    sheet_path: String,
    sheet_id: Option<u32>,
    sheet: SheetModel,
    shared_strings: SharedStrings,
}

impl XlsxSession {
    /// Writes `value` as a string into cell (`row`, `col`), both 0-based.
    ///
    /// The row and cell are created if they do not exist; no other rows are
    /// touched. An existing value is replaced, its style is kept.
    pub fn set_cell_value(&mut self, row: u32, col: u32, value: &str) -> Result<()> {
        check_bounds(row, col)?;
        self.sheet.set_text(row, col, value);
        log::debug!("{}!{} = {value:?}", self.sheet_name, coord::coord(row, col));
        Ok(())
    }

    /// Writes `values` into a new row right after the last existing one
    /// (row 0 on a sheet without rows), starting at column 0.
    pub fn set_cell_value_in_next_row<I, S>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let row_num = match self.sheet.last_row() {
            Some(last) => last + 1,
            None => 0,
        };
        check_bounds(row_num, 0)?;

        let values: Vec<S> = values.into_iter().collect();
        if values.len() > MAX_COLS as usize {
            bail!("{} values do not fit in a row (max {MAX_COLS})", values.len());
        }

        let row = self.sheet.row_mut(row_num);
        for (col, val) in values.iter().enumerate() {
            row.set_text(col as u32, val.as_ref());
        }
        log::debug!(
            "{}: appended row {} ({} cells)",
            self.sheet_name,
            row_num + 1,
            values.len()
        );
        Ok(())
    }

    /// `true` if the row does not exist or holds only blank cells.
    ///
    /// A cell with an empty string is not blank.
    pub fn is_row_empty(&self, row: u32) -> bool {
        self.sheet.is_row_empty(row)
    }

    /// Value of cell (`row`, `col`) as text, `None` for absent or blank cells.
    ///
    /// Shared strings are resolved; numbers and booleans come back as stored
    /// (`"42"`, `"1"`), formulas as their cached result.
    pub fn get_cell_value(&self, row: u32, col: u32) -> Option<String> {
        let cell = self.sheet.cell(row, col)?;
        match &cell.content {
            CellContent::Text(s) => Some(s.clone()),
            CellContent::Loaded { blank: true, .. } => None,
            CellContent::Loaded {
                kind,
                value,
                inline,
                ..
            } => match kind.as_deref() {
                Some("s") => {
                    let idx: usize = value.as_deref()?.trim().parse().ok()?;
                    let s = self.shared_strings.get(idx);
                    if s.is_none() {
                        log::warn!("shared string index {idx} out of range");
                    }
                    s.map(str::to_owned)
                }
                Some("inlineStr") => inline.clone().or_else(|| value.clone()),
                _ => value.clone(),
            },
        }
    }

    /// 0-based index of the last row of the sheet, `None` if it has no rows.
    pub fn last_row_num(&self) -> Option<u32> {
        self.sheet.last_row()
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    /// Path the workbook was opened from and will be saved to.
    pub fn path(&self) -> &Path {
        &self.src_path
    }
}
