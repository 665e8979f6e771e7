//! The XML data blob.
//!
//! The XML document is UTF-16LE with a byte-order mark. The core treats it
//! as opaque bytes except for the per-image `NAME`/`DESCRIPTION` elements
//! and the byte totals, which must stay consistent with the header's image
//! count. When no image was added, renamed, or deleted and the archive
//! totals did not change, the original bytes are written back unchanged.

use crate::encoding::{utf16_from_le_bytes, utf16_to_le_bytes};
use crate::error::{Result, WimError};

/// Per-image information carried in the XML document.
#[derive(Clone, Debug, Default)]
pub struct XmlImage {
    /// The image name (may be empty).
    pub name: String,
    /// The image description, if any.
    pub description: Option<String>,
    /// Total bytes of the image's file contents.
    pub total_bytes: u64,
}

/// The parsed-enough XML document.
#[derive(Clone, Debug, Default)]
pub struct XmlData {
    /// Original serialized bytes, kept for unmodified round-trips.
    raw: Option<Vec<u8>>,
    /// Whether `images` diverged from `raw`.
    dirty: bool,
    /// One entry per image, in image order.
    pub images: Vec<XmlImage>,
    /// Total bytes of the archive, as last written.
    pub total_bytes: u64,
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Extracts the inner text of the first `<tag>...</tag>` in `doc`,
/// returning it with the remaining document after the close tag.
fn find_element<'a>(doc: &'a str, tag: &str) -> Option<(&'a str, usize)> {
    let open_plain = format!("<{tag}>");
    let open_attr = format!("<{tag} ");
    let close = format!("</{tag}>");

    let after_open = if let Some(p) = doc.find(&open_plain) {
        p + open_plain.len()
    } else if let Some(p) = doc.find(&open_attr) {
        doc[p..].find('>')? + p + 1
    } else {
        return None;
    };
    let end = doc[after_open..].find(&close)? + after_open;
    Some((&doc[after_open..end], end + close.len()))
}

impl XmlData {
    /// An empty document for a new archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the UTF-16LE document into per-image records.
    ///
    /// Unknown elements are preserved via the raw bytes; only the elements
    /// the core must track are extracted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let units = utf16_from_le_bytes(bytes);
        let units = if units.first() == Some(&0xfeff) {
            &units[1..]
        } else {
            &units[..]
        };
        let doc = String::from_utf16(units)
            .map_err(|_| WimError::InvalidMetadata("XML data is not valid UTF-16".into()))?;

        let mut images = Vec::new();
        let mut rest = doc.as_str();
        while let Some((body, consumed)) = find_element(rest, "IMAGE") {
            let name = find_element(body, "NAME")
                .map(|(t, _)| xml_unescape(t))
                .unwrap_or_default();
            let description = find_element(body, "DESCRIPTION").map(|(t, _)| xml_unescape(t));
            let total_bytes = find_element(body, "TOTALBYTES")
                .and_then(|(t, _)| t.trim().parse().ok())
                .unwrap_or(0);
            images.push(XmlImage {
                name,
                description,
                total_bytes,
            });
            rest = &rest[consumed..];
        }

        let total_bytes = find_element(&doc, "TOTALBYTES")
            .and_then(|(t, _)| t.trim().parse().ok())
            .unwrap_or(0);

        Ok(Self {
            raw: Some(bytes.to_vec()),
            dirty: false,
            images,
            total_bytes,
        })
    }

    /// Marks the in-memory image list as diverged from the raw bytes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Number of image elements.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Serializes the document as UTF-16LE with BOM.
    ///
    /// `total_bytes` is the archive size to record; pass the value computed
    /// by the writer.
    pub fn serialize(&self, total_bytes: u64) -> Vec<u8> {
        if !self.dirty && self.total_bytes == total_bytes {
            if let Some(raw) = &self.raw {
                return raw.clone();
            }
        }

        let mut doc = String::new();
        doc.push_str("<WIM>");
        doc.push_str(&format!("<TOTALBYTES>{total_bytes}</TOTALBYTES>"));
        for (i, image) in self.images.iter().enumerate() {
            doc.push_str(&format!("<IMAGE INDEX=\"{}\">", i + 1));
            doc.push_str(&format!(
                "<TOTALBYTES>{}</TOTALBYTES>",
                image.total_bytes
            ));
            if !image.name.is_empty() {
                doc.push_str(&format!("<NAME>{}</NAME>", xml_escape(&image.name)));
            }
            if let Some(desc) = &image.description {
                doc.push_str(&format!(
                    "<DESCRIPTION>{}</DESCRIPTION>",
                    xml_escape(desc)
                ));
            }
            doc.push_str("</IMAGE>");
        }
        doc.push_str("</WIM>");

        let mut units = vec![0xfeffu16];
        units.extend(doc.encode_utf16());
        utf16_to_le_bytes(&units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_images() {
        let mut xml = XmlData::new();
        xml.images.push(XmlImage {
            name: "Base <&> Image".into(),
            description: Some("first".into()),
            total_bytes: 123,
        });
        xml.images.push(XmlImage {
            name: "Second".into(),
            description: None,
            total_bytes: 456,
        });
        xml.mark_dirty();

        let bytes = xml.serialize(1000);
        assert_eq!(&bytes[..2], &[0xff, 0xfe], "BOM must lead");

        let parsed = XmlData::parse(&bytes).unwrap();
        assert_eq!(parsed.image_count(), 2);
        assert_eq!(parsed.images[0].name, "Base <&> Image");
        assert_eq!(parsed.images[0].description.as_deref(), Some("first"));
        assert_eq!(parsed.images[0].total_bytes, 123);
        assert_eq!(parsed.images[1].name, "Second");
        assert_eq!(parsed.total_bytes, 1000);
    }

    #[test]
    fn clean_document_round_trips_bytes() {
        let mut xml = XmlData::new();
        xml.images.push(XmlImage {
            name: "A".into(),
            ..Default::default()
        });
        xml.mark_dirty();
        let bytes = xml.serialize(50);

        let parsed = XmlData::parse(&bytes).unwrap();
        assert_eq!(parsed.serialize(50), bytes);
    }

    #[test]
    fn empty_document() {
        let xml = XmlData::parse(&[]).unwrap();
        assert_eq!(xml.image_count(), 0);
    }
}
