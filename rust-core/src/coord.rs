//! A1-style cell references.
//!
//! Rows and columns are 0-based everywhere in the public API; the `r="B7"`
//! attribute in the sheet XML is 1-based on the row side.

use anyhow::{Context, Result, bail};
use regex::Regex;
use std::sync::LazyLock;

/// Row count of a worksheet in the `.xlsx` format.
pub const MAX_ROWS: u32 = 1_048_576;
/// Column count of a worksheet in the `.xlsx` format (`XFD`).
pub const MAX_COLS: u32 = 16_384;

static RE_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$?([A-Za-z]{1,3})\$?([0-9]{1,7})$").expect("valid regex"));

/// 0 → `A`, 25 → `Z`, 26 → `AA`.
pub fn col_letter(mut n: u32) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// `A` → 0, `AA` → 26. Case-insensitive.
pub fn col_index(s: &str) -> Result<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphabetic()) {
        bail!("invalid column letters `{s}`");
    }
    let n = s
        .bytes()
        .try_fold(0u32, |acc, b| {
            acc.checked_mul(26)?
                .checked_add((b.to_ascii_uppercase() - b'A' + 1) as u32)
        })
        .with_context(|| format!("column `{s}` overflows"))?;
    Ok(n - 1)
}

/// Splits `B7` into `(col, row)`, both 0-based: `(1, 6)`.
pub fn split_coord(coord: &str) -> Result<(u32, u32)> {
    let caps = RE_CELL
        .captures(coord)
        .with_context(|| format!("invalid cell reference `{coord}`"))?;
    let col = col_index(&caps[1])?;
    let row: u32 = caps[2]
        .parse()
        .with_context(|| format!("invalid row in cell reference `{coord}`"))?;
    if row == 0 {
        bail!("row 0 in cell reference `{coord}`");
    }
    Ok((col, row - 1))
}

/// `(row, col)` → `"C6"` for `(5, 2)`.
pub fn coord(row: u32, col: u32) -> String {
    format!("{}{}", col_letter(col), row + 1)
}

pub(crate) fn check_bounds(row: u32, col: u32) -> Result<()> {
    if row >= MAX_ROWS {
        bail!("row index {row} out of range (max {})", MAX_ROWS - 1);
    }
    if col >= MAX_COLS {
        bail!("column index {col} out of range (max {})", MAX_COLS - 1);
    }
    Ok(())
}
