use crate::sheet::read_rich_text;
use anyhow::{Context, Result};
use quick_xml::{Reader, events::Event};

/// Read-only view of `xl/sharedStrings.xml`.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStrings {
    items: Vec<String>,
}

impl SharedStrings {
    pub(crate) fn parse(xml: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        let mut items = Vec::new();
        loop {
            match reader.read_event().context("malformed sharedStrings.xml")? {
                Event::Start(ref e) if e.local_name().as_ref() == b"si" => {
                    items.push(read_rich_text(&mut reader, xml)?);
                }
                Event::Empty(ref e) if e.local_name().as_ref() == b"si" => items.push(String::new()),
                Event::Eof => break,
                _ => {}
            }
        }
        log::debug!("loaded {} shared strings", items.len());
        Ok(Self { items })
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&str> {
        self.items.get(idx).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rich_and_plain_items() {
        let xml = br#"<?xml version="1.0"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
  <si><t>Name</t></si>
  <si><r><rPr><b/></rPr><t>Bold</t></r><r><t xml:space="preserve"> &amp; plain</t></r><rPh sb="0" eb="1"><t>x</t></rPh></si>
  <si/>
</sst>"#;
        let sst = SharedStrings::parse(xml).unwrap();
        assert_eq!(sst.get(0), Some("Name"));
        assert_eq!(sst.get(1), Some("Bold & plain"));
        assert_eq!(sst.get(2), Some(""));
        assert_eq!(sst.get(3), None);
    }
}
