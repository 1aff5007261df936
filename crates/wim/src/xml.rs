//! The archive's XML data block.
//!
//! Every WIM carries a UTF-16LE XML document describing its images. The
//! engine needs very little of it: per-image names (to resolve an image
//! selector and to name all-images subdirectories) and per-image
//! `TOTALBYTES` (the progress estimate when extracting from a pipe, where
//! the exact stream set is unknown up front).

use crate::apply::ImageSelect;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    /// 1-based image index.
    pub index: usize,
    pub name: Option<String>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WimInfo {
    /// Total size of the archive per the XML data, when declared.
    pub total_bytes: u64,
    images: Vec<ImageInfo>,
}

impl WimInfo {
    /// Decodes the XML data block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() % 2 != 0 {
            return Err(Error::XmlInconsistent(
                "XML data length is not a multiple of 2".into(),
            ));
        }
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let units = match units.first() {
            Some(&0xfeff) => &units[1..],
            _ => &units[..],
        };
        let text = String::from_utf16(units)
            .map_err(|_| Error::XmlInconsistent("XML data is not valid UTF-16".into()))?;

        let mut images = Vec::new();
        let mut rest = text.as_str();
        let images_start = text.find("<IMAGE").unwrap_or(text.len());
        while let Some(start) = rest.find("<IMAGE") {
            let block = &rest[start..];
            let tag_end = block
                .find('>')
                .ok_or_else(|| Error::XmlInconsistent("unterminated <IMAGE> tag".into()))?;
            let body_end = block
                .find("</IMAGE>")
                .ok_or_else(|| Error::XmlInconsistent("unterminated <IMAGE> element".into()))?;
            let body = &block[tag_end + 1..body_end];

            let index = match attribute_value(&block[..tag_end], "INDEX") {
                Some(v) => v
                    .parse()
                    .map_err(|_| Error::XmlInconsistent("bad IMAGE INDEX attribute".into()))?,
                None => images.len() + 1,
            };
            images.push(ImageInfo {
                index,
                name: element_text(body, "NAME").map(unescape),
                total_bytes: element_text(body, "TOTALBYTES")
                    .and_then(|t| t.trim().parse().ok())
                    .unwrap_or(0),
            });
            rest = &block[body_end + "</IMAGE>".len()..];
        }
        images.sort_by_key(|i| i.index);

        Ok(Self {
            total_bytes: element_text(&text[..images_start], "TOTALBYTES")
                .and_then(|t| t.trim().parse().ok())
                .unwrap_or(0),
            images,
        })
    }

    pub fn add_image(&mut self, info: ImageInfo) {
        self.images.push(info);
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn image(&self, index: usize) -> Option<&ImageInfo> {
        self.images.iter().find(|i| i.index == index)
    }

    /// Name of the 1-based image `index`.
    pub fn image_name(&self, index: usize) -> Option<&str> {
        self.image(index).and_then(|i| i.name.as_deref())
    }

    /// Declared total byte count of the 1-based image `index`.
    pub fn image_total_bytes(&self, index: usize) -> Option<u64> {
        self.image(index).map(|i| i.total_bytes)
    }

    pub fn max_image_name_len(&self) -> usize {
        self.images
            .iter()
            .filter_map(|i| i.name.as_deref())
            .map(str::len)
            .max()
            .unwrap_or(0)
    }

    /// Resolves an image selector string: `all`, a 1-based image number,
    /// or an image name.
    pub fn resolve_image(&self, name_or_num: &str) -> Option<ImageSelect> {
        if name_or_num.eq_ignore_ascii_case("all") {
            return Some(ImageSelect::All);
        }
        if let Ok(n) = name_or_num.parse::<usize>() {
            if (1..=self.image_count()).contains(&n) {
                return Some(ImageSelect::Index(n));
            }
            return None;
        }
        self.images
            .iter()
            .find(|i| i.name.as_deref() == Some(name_or_num))
            .map(|i| ImageSelect::Index(i.index))
    }
}

fn attribute_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let pattern = format!("{name}=\"");
    let start = tag.find(&pattern)? + pattern.len();
    let end = tag[start..].find('"')?;
    Some(&tag[start..start + end])
}

fn element_text<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)?;
    Some(&body[start..start + end])
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
