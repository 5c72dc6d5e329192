#![forbid(unsafe_code)]
//! Little-endian binary cursor and string encodings shared by the page and
//! property codecs.

use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::{UTF_16LE, WINDOWS_1252};

/// Character encoding used for string fields.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StringEncoding {
    /// Narrow strings in the windows-1252 code page.
    Ansi,
    /// Wide strings as UTF-16 little-endian code units.
    Utf16Le,
    /// UTF-8.
    Utf8,
}

impl StringEncoding {
    /// Size in bytes of one code unit (and of the terminator).
    pub fn unit_len(self) -> usize {
        match self {
            StringEncoding::Utf16Le => 2,
            StringEncoding::Ansi | StringEncoding::Utf8 => 1,
        }
    }

    /// Encodes `s`.
    ///
    /// Fails with `InvalidInput` when the code page cannot represent a
    /// character of `s`.
    pub fn encode(self, s: &str) -> io::Result<Vec<u8>> {
        match self {
            StringEncoding::Ansi => {
                let (bytes, _, had_errors) = WINDOWS_1252.encode(s);
                if had_errors {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        "string not representable in windows-1252",
                    ));
                }
                Ok(bytes.into_owned())
            }
            StringEncoding::Utf16Le => Ok(s.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            StringEncoding::Utf8 => Ok(s.as_bytes().to_vec()),
        }
    }

    /// Decodes `bytes`, substituting U+FFFD for malformed sequences.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            StringEncoding::Ansi => WINDOWS_1252
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            StringEncoding::Utf16Le => UTF_16LE.decode_without_bom_handling(bytes).0.into_owned(),
            StringEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Typed little-endian reader/writer over a seekable stream.
#[derive(Debug)]
pub struct BinaryCursor<S> {
    inner: S,
}

impl<S> BinaryCursor<S> {
    /// Wraps `inner`; the cursor starts at the stream's current position.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Borrows the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: Seek> BinaryCursor<S> {
    /// Current stream position.
    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    /// Moves to the absolute `offset`.
    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    /// Total stream length; the position is left unchanged.
    pub fn len(&mut self) -> io::Result<u64> {
        let saved = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(saved))?;
        Ok(end)
    }

    /// Bytes left between the position and the end of the stream.
    pub fn remaining(&mut self) -> io::Result<u64> {
        let pos = self.position()?;
        Ok(self.len()?.saturating_sub(pos))
    }
}

impl<S: Read> BinaryCursor<S> {
    /// Reads one byte.
    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.inner.read_u16::<LittleEndian>()
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.inner.read_u32::<LittleEndian>()
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> io::Result<u64> {
        self.inner.read_u64::<LittleEndian>()
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> io::Result<i32> {
        self.inner.read_i32::<LittleEndian>()
    }

    /// Reads a little-endian `i64`.
    pub fn read_i64(&mut self) -> io::Result<i64> {
        self.inner.read_i64::<LittleEndian>()
    }

    /// Reads a little-endian IEEE-754 double.
    pub fn read_f64(&mut self) -> io::Result<f64> {
        self.inner.read_f64::<LittleEndian>()
    }

    /// Reads a one-byte boolean; any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads exactly `n` bytes.
    ///
    /// Fails with `UnexpectedEof` rather than returning a short buffer, and
    /// never allocates more than the stream can actually supply.
    pub fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n.min(64 * 1024));
        (&mut self.inner).take(n as u64).read_to_end(&mut buf)?;
        if buf.len() != n {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("wanted {n} bytes, stream supplied {}", buf.len()),
            ));
        }
        Ok(buf)
    }

    /// Reads an `{len:i32}{bytes}` string.
    pub fn read_length_prefixed_string(&mut self, encoding: StringEncoding) -> io::Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "negative string length prefix",
            ));
        }
        let bytes = self.read_bytes(len as usize)?;
        Ok(encoding.decode(&bytes))
    }

    /// Reads code units up to (and consuming) a zero terminator.
    pub fn read_null_terminated_string(&mut self, encoding: StringEncoding) -> io::Result<String> {
        let unit = encoding.unit_len();
        let mut bytes = Vec::new();
        loop {
            let chunk = self.read_bytes(unit)?;
            if chunk.iter().all(|&b| b == 0) {
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(encoding.decode(&bytes))
    }
}

impl<S: Write> BinaryCursor<S> {
    /// Writes one byte.
    pub fn write_u8(&mut self, v: u8) -> io::Result<()> {
        self.inner.write_u8(v)
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16(&mut self, v: u16) -> io::Result<()> {
        self.inner.write_u16::<LittleEndian>(v)
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.inner.write_u32::<LittleEndian>(v)
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.inner.write_u64::<LittleEndian>(v)
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.inner.write_i32::<LittleEndian>(v)
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64(&mut self, v: i64) -> io::Result<()> {
        self.inner.write_i64::<LittleEndian>(v)
    }

    /// Writes a little-endian IEEE-754 double.
    pub fn write_f64(&mut self, v: f64) -> io::Result<()> {
        self.inner.write_f64::<LittleEndian>(v)
    }

    /// Writes a one-byte boolean.
    pub fn write_bool(&mut self, v: bool) -> io::Result<()> {
        self.write_u8(u8::from(v))
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    /// Writes an `{len:i32}{bytes}` string.
    pub fn write_length_prefixed_string(
        &mut self,
        s: &str,
        encoding: StringEncoding,
    ) -> io::Result<()> {
        let bytes = encoding.encode(s)?;
        let len = i32::try_from(bytes.len()).map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, "string longer than i32::MAX bytes")
        })?;
        self.write_i32(len)?;
        self.write_bytes(&bytes)
    }

    /// Writes the encoded string followed by one zero code unit.
    pub fn write_null_terminated_string(
        &mut self,
        s: &str,
        encoding: StringEncoding,
    ) -> io::Result<()> {
        self.write_bytes(&encoding.encode(s)?)?;
        self.write_bytes(&[0u8; 2][..encoding.unit_len()])
    }
}

impl<S: Write + Seek> BinaryCursor<S> {
    /// Runs `f` with the cursor positioned at `offset`, then restores the
    /// previous position whether or not `f` (or the seek) failed.
    pub fn write_at<T, F>(&mut self, offset: u64, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut Self) -> io::Result<T>,
    {
        let saved = self.inner.stream_position()?;
        let result = self
            .inner
            .seek(SeekFrom::Start(offset))
            .and_then(|_| f(self));
        let restored = self.inner.seek(SeekFrom::Start(saved));
        let value = result?;
        restored?;
        Ok(value)
    }
}
