//! Writes rows of string data into an existing `.xlsx` workbook.
//!
//! Re-exports the session API of `xlsx-session-core`; see [`XlsxSession`].

pub use xlsx_session_core::{XlsxSession, coord, scan};
