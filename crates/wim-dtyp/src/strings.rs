use binrw::io::Write;
use binrw::{Endian, prelude::*};
use core::fmt::{self, Write as _};
use std::{io::prelude::*, string::FromUtf16Error};

/// A UTF-16 string sized by an external byte count rather than a null
/// terminator, as WIM metadata and reparse buffers store names.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct WideString {
    /// The raw UTF-16 code units.
    units: Vec<u16>,
}

impl WideString {
    const CHAR_WIDTH: u64 = std::mem::size_of::<u16>() as u64;

    /// Size of the string's data, in bytes.
    pub fn size(&self) -> u64 {
        self.units.len() as u64 * Self::CHAR_WIDTH
    }

    /// Number of UTF-16 code units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Decodes to a `String`, mapping unpaired surrogates to U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }

    /// Case-insensitive comparison using simple Unicode case folding,
    /// matching how NTFS-style volumes compare names.
    pub fn eq_ignore_case(&self, other: &WideString) -> bool {
        let lower = |s: &WideString| -> String {
            s.to_string_lossy().chars().flat_map(char::to_lowercase).collect()
        };
        lower(self) == lower(other)
    }
}

impl BinRead for WideString {
    type Args<'a> = (u64,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        size_bytes: Self::Args<'_>,
    ) -> BinResult<Self> {
        // Size is in bytes, but we need to read in chars.
        if size_bytes.0 % Self::CHAR_WIDTH != 0 {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: "UTF-16 string size must be a multiple of 2".into(),
            });
        }
        let size_chars = size_bytes.0 / Self::CHAR_WIDTH;

        let mut units = Vec::with_capacity(size_chars as usize);
        for _ in 0..size_chars {
            units.push(u16::read_options(reader, endian, ())?);
        }
        Ok(Self { units })
    }
}

impl BinWrite for WideString {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.units.write_options(writer, endian, args)
    }
}

impl From<&str> for WideString {
    fn from(s: &str) -> Self {
        Self {
            units: s.encode_utf16().collect(),
        }
    }
}

impl From<String> for WideString {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Vec<u16>> for WideString {
    fn from(units: Vec<u16>) -> Self {
        Self { units }
    }
}

impl From<&[u16]> for WideString {
    fn from(units: &[u16]) -> Self {
        Self {
            units: units.to_vec(),
        }
    }
}

impl FromIterator<u16> for WideString {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        Self {
            units: iter.into_iter().collect(),
        }
    }
}

impl TryFrom<&WideString> for String {
    type Error = FromUtf16Error;

    fn try_from(value: &WideString) -> Result<Self, Self::Error> {
        String::from_utf16(&value.units)
    }
}

impl PartialEq<&str> for WideString {
    fn eq(&self, other: &&str) -> bool {
        other.encode_utf16().eq(self.units.iter().copied())
    }
}

impl fmt::Display for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_utf16(&self.units, f, core::iter::once)
    }
}

impl fmt::Debug for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WideString(\"")?;
        display_utf16(&self.units, f, char::escape_debug)?;
        write!(f, "\")")
    }
}

#[inline]
fn display_utf16<Transformer: Fn(char) -> O, O: Iterator<Item = char>>(
    input: &[u16],
    f: &mut fmt::Formatter<'_>,
    t: Transformer,
) -> fmt::Result {
    char::decode_utf16(input.iter().copied())
        .flat_map(|r| t(r.unwrap_or(char::REPLACEMENT_CHARACTER)))
        .try_for_each(|c| f.write_char(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_wide_string_eq() {
        let a = WideString::from("hello");
        assert_eq!(a, "hello");
        assert_ne!(a, "hello world");
        assert_ne!(a, "hel");
        assert_ne!(a, "hello\0");

        let b = a.clone();
        assert_eq!(b, a);
        assert_eq!(b.units(), a.units());
    }

    #[test]
    fn test_wide_string_case_fold() {
        let a = WideString::from("Foo");
        let b = WideString::from("foo");
        let c = WideString::from("bar");
        assert!(a.eq_ignore_case(&b));
        assert!(!a.eq_ignore_case(&c));
    }

    #[test]
    fn test_wide_string_binrw_round_trip() {
        let s = WideString::from("ab\u{fffd}");
        let mut out = Cursor::new(vec![]);
        s.write_le(&mut out).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes.len() as u64, s.size());

        let read = WideString::read_le_args(&mut Cursor::new(&bytes), (s.size(),)).unwrap();
        assert_eq!(read, s);
    }

    #[test]
    fn test_wide_string_odd_size_rejected() {
        let bytes = [0u8; 3];
        assert!(WideString::read_le_args(&mut Cursor::new(&bytes[..]), (3,)).is_err());
    }
}
