//! Sidecar XML encoding
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <directory>
//!   <file name="foo.txt" keyword="important" timestamp="1160000000"/>
//!   <file name="a%20b.png" timestamp="1160000001">
//!     <emblem name="urgent"/>
//!   </file>
//! </directory>
//! ```
//!
//! File names are percent-escaped in the `name` attribute. Any other
//! attribute on a `file` element is a scalar; child elements are list
//! entries tagged with the list key.

use crate::document::{Document, FileRecord, ListEntry};
use crate::types::{NAME_ATTRIBUTE, TIMESTAMP_ATTRIBUTE};
use dirmeta_common::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use tracing::warn;

/// Root element of a sidecar document
pub const ROOT_ELEMENT: &str = "directory";

/// Element holding one file's metadata
pub const FILE_ELEMENT: &str = "file";

const XML_VERSION: &str = "1.0";

/// Serialize a document to sidecar XML
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(
        &mut writer,
        Event::Decl(BytesDecl::new(XML_VERSION, Some("UTF-8"), None)),
    )?;
    emit(&mut writer, Event::Start(BytesStart::new(ROOT_ELEMENT)))?;

    for record in document.records() {
        let name = urlencoding::encode(&record.name);
        let timestamp = record.timestamp.to_string();

        let mut element = BytesStart::new(FILE_ELEMENT);
        element.push_attribute((NAME_ATTRIBUTE, name.as_ref()));
        for (key, value) in &record.attributes {
            element.push_attribute((key.as_str(), value.as_str()));
        }
        element.push_attribute((TIMESTAMP_ATTRIBUTE, timestamp.as_str()));

        if record.entries.is_empty() {
            emit(&mut writer, Event::Empty(element))?;
            continue;
        }

        emit(&mut writer, Event::Start(element))?;
        for entry in &record.entries {
            let mut child = BytesStart::new(entry.key.as_str());
            for (key, value) in &entry.attributes {
                child.push_attribute((key.as_str(), value.as_str()));
            }
            emit(&mut writer, Event::Empty(child))?;
        }
        emit(&mut writer, Event::End(BytesEnd::new(FILE_ELEMENT)))?;
    }

    emit(&mut writer, Event::End(BytesEnd::new(ROOT_ELEMENT)))?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse sidecar XML into a document
///
/// Every top-level `file` element is indexed by its decoded name. When a
/// name appears more than once the first element wins and the rest are
/// dropped with a warning. Empty input is an empty document.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::deserialization(format!("sidecar is not UTF-8: {e}")))?;
    if text.trim().is_empty() {
        return Ok(Document::new());
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut document = Document::new();
    let mut current: Option<FileRecord> = None;
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::deserialization(e.to_string()))?;
        match event {
            Event::Start(element) => {
                depth += 1;
                match depth {
                    1 => document = Document::materialized(),
                    2 if is_file_element(&element) => current = parse_file(&element)?,
                    3 => {
                        if let Some(record) = current.as_mut() {
                            record.entries.push(parse_entry(&element)?);
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => match depth + 1 {
                1 => document = Document::materialized(),
                2 if is_file_element(&element) => {
                    if let Some(record) = parse_file(&element)? {
                        index_record(&mut document, record);
                    }
                }
                3 => {
                    if let Some(record) = current.as_mut() {
                        record.entries.push(parse_entry(&element)?);
                    }
                }
                _ => {}
            },
            Event::End(_) => {
                if depth == 2 {
                    if let Some(record) = current.take() {
                        index_record(&mut document, record);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(Error::deserialization("unexpected end of document"));
    }
    Ok(document)
}

fn is_file_element(element: &BytesStart<'_>) -> bool {
    element.name().as_ref() == FILE_ELEMENT.as_bytes()
}

fn index_record(document: &mut Document, record: FileRecord) {
    let name = record.name.clone();
    if !document.insert_loaded(record) {
        warn!("Ignoring duplicate metadata record for {:?}", name);
    }
}

fn parse_attributes(element: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| Error::deserialization(e.to_string()))?;
        let key = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|e| Error::deserialization(e.to_string()))?
            .to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| Error::deserialization(e.to_string()))?
            .into_owned();
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn parse_file(element: &BytesStart<'_>) -> Result<Option<FileRecord>> {
    let mut attributes = parse_attributes(element)?;

    let Some(escaped_name) = attributes.remove(NAME_ATTRIBUTE) else {
        warn!("Ignoring metadata record without a name");
        return Ok(None);
    };
    let name = urlencoding::decode(&escaped_name)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(escaped_name);
    let timestamp = attributes
        .remove(TIMESTAMP_ATTRIBUTE)
        .and_then(|t| t.parse().ok())
        .unwrap_or_default();

    Ok(Some(FileRecord {
        name,
        timestamp,
        attributes,
        entries: Vec::new(),
        sequence: 0,
    }))
}

fn parse_entry(element: &BytesStart<'_>) -> Result<ListEntry> {
    let key = std::str::from_utf8(element.name().as_ref())
        .map_err(|e| Error::deserialization(e.to_string()))?
        .to_string();
    Ok(ListEntry {
        key,
        attributes: parse_attributes(element)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_encode_scalar_record() {
        let mut doc = Document::new();
        doc.set_scalar("foo.txt", "keyword", "", "important");
        let xml = String::from_utf8(encode(&doc).unwrap()).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<directory>"));
        assert!(xml.contains("<file name=\"foo.txt\" keyword=\"important\" timestamp=\""));
        assert!(xml.contains("\"/>"));
        assert!(xml.trim_end().ends_with("</directory>"));
    }

    #[test]
    fn test_encode_escapes_names_and_values() {
        let mut doc = Document::new();
        doc.set_scalar("a b&c.txt", "note", "", "x < \"y\"");
        let xml = String::from_utf8(encode(&doc).unwrap()).unwrap();
        assert!(xml.contains("name=\"a%20b%26c.txt\""));
        assert!(!xml.contains("x < \"y\""));

        let decoded = decode(xml.as_bytes()).unwrap();
        assert_eq!(decoded.get_scalar("a b&c.txt", "note", ""), "x < \"y\"");
    }

    #[test]
    fn test_list_entries_survive_reload() {
        let mut doc = Document::new();
        doc.set_list("pic.png", "emblem", "name", &strings(&["urgent", "new"]));
        doc.set_scalar("pic.png", "icon_position", "", "10,20");

        let decoded = decode(&encode(&doc).unwrap()).unwrap();
        let record = decoded.record("pic.png").unwrap();
        assert_eq!(record.list("emblem", "name"), strings(&["urgent", "new"]));
        assert_eq!(record.get("icon_position"), Some("10,20"));
        assert_eq!(record.timestamp, doc.record("pic.png").unwrap().timestamp);
    }

    #[test]
    fn test_decode_duplicate_first_wins() {
        let xml = r#"<?xml version="1.0"?>
<directory>
  <file name="dup.txt" keyword="first" timestamp="1"/>
  <file name="dup.txt" keyword="second" icon="x" timestamp="2">
    <emblem name="ignored"/>
  </file>
</directory>"#;
        let doc = decode(xml.as_bytes()).unwrap();
        assert_eq!(doc.len(), 1);
        let record = doc.record("dup.txt").unwrap();
        assert_eq!(record.get("keyword"), Some("first"));
        assert_eq!(record.get("icon"), None);
        assert_eq!(record.timestamp, 1);
        assert!(record.entries.is_empty());
    }

    #[test]
    fn test_decode_skips_unknown_elements() {
        let xml = r#"<directory>
  <note text="hello"/>
  <file timestamp="5"/>
  <file name="a.txt"><emblem name="e"><deeper x="y"/></emblem></file>
</directory>"#;
        let doc = decode(xml.as_bytes()).unwrap();
        assert_eq!(doc.file_names(), strings(&["a.txt"]));
        assert_eq!(doc.get_list("a.txt", "emblem", "name"), strings(&["e"]));
        assert_eq!(doc.record("a.txt").unwrap().timestamp, 0);
    }

    #[test]
    fn test_decode_empty_input() {
        let doc = decode(b"").unwrap();
        assert!(doc.is_empty());
        assert!(!doc.is_materialized());

        let doc = decode(b"<directory/>").unwrap();
        assert!(doc.is_empty());
        assert!(doc.is_materialized());
    }

    #[test]
    fn test_decode_malformed() {
        let err = decode(b"<directory><file name=\"a\">").unwrap_err();
        assert!(err.is_corrupt_document());
        let err = decode(b"<directory></file></directory>").unwrap_err();
        assert!(err.is_corrupt_document());
        let err = decode(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(err.is_corrupt_document());
    }
}
