//! Stream abstraction (spec §4.D): the capability set every concrete
//! payload (`StringIo`, `FileBackedObject`, `ZipFileSegment`,
//! `AFF4Image`, `AFF4Map`) is read and written through.

use std::fs::{File, OpenOptions};
use std::io::{Read, SeekFrom, Write};

use log::debug;

use crate::error::{Aff4Result, Aff4Status};
use crate::object::AFF4Object;
use crate::rdf::{self, WriteMode};
use crate::store::DataStore;
use crate::urn::Urn;

/// The capability set of spec §4.D. `read`/`write` take/return byte
/// counts rather than panicking on short operations — a read past
/// `size()` is a short read, not an error, and a write past `size()`
/// extends the stream with implicit zero bytes in between.
pub trait Aff4Stream: AFF4Object {
    fn read(&mut self, buf: &mut [u8]) -> Aff4Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Aff4Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> Aff4Result<u64>;
    fn size(&self) -> u64;
    fn truncate(&mut self) -> Aff4Result<()>;
}

/// Default-method extension over [`Aff4Stream`]: `Tell`, `sprintf`,
/// `WriteStream`, `CopyToStream` (spec §4.D), implemented once for
/// every concrete stream rather than re-derived per type.
pub trait Aff4StreamExt: Aff4Stream {
    fn tell(&mut self) -> Aff4Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    /// Formats `fmt` against `args` (minimum directives `%d`, `%#x`,
    /// `%02d`, `%%`) and appends the result, matching
    /// `stream_test.cc`'s `"I have %d arms and %#x legs."` usage.
    fn sprintf(&mut self, fmt: &str, args: &[i64]) -> Aff4Result<usize> {
        let formatted = format_sprintf(fmt, args)?;
        self.write(formatted.as_bytes())
    }

    /// Reads from `source` until EOF, writing every chunk into this
    /// stream; returns the total byte count written.
    fn write_stream(
        &mut self,
        source: &mut dyn Read,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Aff4Result<u64> {
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).map_err(|e| Aff4Status::IoError(e.to_string()))?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
            total += n as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(total);
            }
        }
        Ok(total)
    }

    /// Copies up to `n` bytes from the current position into `dest`.
    fn copy_to_stream(&mut self, dest: &mut dyn Write, n: u64) -> Aff4Result<u64> {
        let mut buf = [0u8; 64 * 1024];
        let mut remaining = n;
        let mut total = 0u64;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = self.read(&mut buf[..want])?;
            if got == 0 {
                break;
            }
            dest.write_all(&buf[..got])
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;
            total += got as u64;
            remaining -= got as u64;
        }
        Ok(total)
    }
}

impl<T: Aff4Stream + ?Sized> Aff4StreamExt for T {}

/// Minimal printf-style formatter: `%d`, `%#x`, `%0<width>d`, `%%`.
/// Consumes `args` left to right; out-of-range directives are a
/// programmer error, so a missing argument is an `InvalidInput`.
pub fn format_sprintf(fmt: &str, args: &[i64]) -> Aff4Result<String> {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut arg_idx = 0;

    let mut next_arg = |idx: &mut usize| -> Aff4Result<i64> {
        let v = args
            .get(*idx)
            .copied()
            .ok_or_else(|| Aff4Status::InvalidInput("sprintf: not enough arguments".into()))?;
        *idx += 1;
        Ok(v)
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('#') => {
                chars.next();
                if chars.next() != Some('x') {
                    return Err(Aff4Status::InvalidInput(
                        "sprintf: only %#x is supported after '#'".into(),
                    ));
                }
                let v = next_arg(&mut arg_idx)?;
                out.push_str(&format!("{:#x}", v));
            }
            Some('0') => {
                chars.next();
                let mut width = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        width.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.next() != Some('d') {
                    return Err(Aff4Status::InvalidInput(
                        "sprintf: only %0<width>d is supported after '0'".into(),
                    ));
                }
                let width: usize = width.parse().unwrap_or(0);
                let v = next_arg(&mut arg_idx)?;
                out.push_str(&format!("{:0width$}", v, width = width));
            }
            Some('d') => {
                chars.next();
                let v = next_arg(&mut arg_idx)?;
                out.push_str(&v.to_string());
            }
            other => {
                return Err(Aff4Status::InvalidInput(format!(
                    "sprintf: unsupported directive '%{:?}'",
                    other
                )));
            }
        }
    }
    Ok(out)
}

fn zero_extend(buf: &mut Vec<u8>, new_len: usize) {
    if new_len > buf.len() {
        buf.resize(new_len, 0);
    }
}

/// An entirely in-memory stream (spec §2 component D). Used for
/// `information.turtle` staging, test fixtures, and any object that
/// does not need to be backed by a file.
pub struct StringIo {
    urn: Urn,
    buf: Vec<u8>,
    pos: u64,
    dirty: bool,
}

impl StringIo {
    pub fn new(urn: Urn) -> Self {
        StringIo {
            urn,
            buf: Vec::new(),
            pos: 0,
            dirty: false,
        }
    }

    pub fn with_data(urn: Urn, data: Vec<u8>) -> Self {
        StringIo {
            urn,
            buf: data,
            pos: 0,
            dirty: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl AFF4Object for StringIo {
    fn urn(&self) -> &Urn {
        &self.urn
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn load_from_urn(&mut self, _store: &DataStore) -> Aff4Result<()> {
        Ok(())
    }
    fn flush(&mut self, _store: &DataStore) -> Aff4Result<()> {
        self.dirty = false;
        Ok(())
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

impl Aff4Stream for StringIo {
    fn read(&mut self, out: &mut [u8]) -> Aff4Result<usize> {
        let pos = self.pos as usize;
        if pos >= self.buf.len() {
            return Ok(0);
        }
        let n = out.len().min(self.buf.len() - pos);
        out[..n].copy_from_slice(&self.buf[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Aff4Result<usize> {
        let pos = self.pos as usize;
        zero_extend(&mut self.buf, pos);
        if pos + data.len() > self.buf.len() {
            self.buf.resize(pos + data.len(), 0);
        }
        self.buf[pos..pos + data.len()].copy_from_slice(data);
        self.pos += data.len() as u64;
        self.dirty = true;
        Ok(data.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Aff4Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.buf.len() as i64 + delta,
        };
        if new_pos < 0 {
            return Err(Aff4Status::InvalidInput("seek before start of stream".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        self.buf.clear();
        self.pos = 0;
        self.dirty = true;
        Ok(())
    }
}

/// A stream backed directly by a filesystem file, used both as a raw
/// input source for the imager and as the backing object opened via
/// `aff4:stream_write_mode` (spec §9 Open Questions / §10 supplement).
pub struct FileBackedObject {
    urn: Urn,
    file: File,
    mode: WriteMode,
    dirty: bool,
}

impl FileBackedObject {
    pub fn open(urn: Urn, mode: WriteMode) -> Aff4Result<Self> {
        let path = urn.path();
        let file = match mode {
            WriteMode::Read => OpenOptions::new().read(true).open(path),
            WriteMode::Truncate => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
            WriteMode::Append => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path),
        }
        .map_err(|e| Aff4Status::IoError(format!("{}: {}", path, e)))?;
        debug!("opened {} in {:?} mode", urn, mode);
        Ok(FileBackedObject {
            urn,
            file,
            mode,
            dirty: false,
        })
    }
}

impl AFF4Object for FileBackedObject {
    fn urn(&self) -> &Urn {
        &self.urn
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn load_from_urn(&mut self, _store: &DataStore) -> Aff4Result<()> {
        Ok(())
    }
    fn flush(&mut self, _store: &DataStore) -> Aff4Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.dirty = false;
        Ok(())
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

impl Aff4Stream for FileBackedObject {
    fn read(&mut self, buf: &mut [u8]) -> Aff4Result<usize> {
        use std::io::Read as _;
        self.file.read(buf).map_err(|e| Aff4Status::IoError(e.to_string()))
    }

    fn write(&mut self, buf: &[u8]) -> Aff4Result<usize> {
        if self.mode == WriteMode::Read {
            return Err(Aff4Status::InvalidInput(
                "write on a stream opened in read mode".into(),
            ));
        }
        use std::io::Write as _;
        let n = self
            .file
            .write(buf)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.dirty = true;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Aff4Result<u64> {
        use std::io::Seek as _;
        self.file.seek(pos).map_err(|e| Aff4Status::IoError(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        use std::io::Seek as _;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.dirty = true;
        Ok(())
    }
}

/// Factory entry point for `aff4:file_type` / the `aff4:stream_write_mode`
/// fallback path in `DataStore::construct`.
pub fn construct(store: &DataStore, urn: &Urn) -> Aff4Result<Box<dyn AFF4Object>> {
    let mode = store
        .get_string(urn, &Urn::new(rdf::AFF4_STREAM_WRITE_MODE))
        .ok()
        .and_then(|s| WriteMode::from_str(&s).ok())
        .unwrap_or(WriteMode::Read);
    let obj = FileBackedObject::open(urn.clone(), mode)?;
    Ok(Box::new(obj))
}

pub fn construct_file(store: &DataStore, urn: &Urn) -> Aff4Result<Box<dyn AFF4Object>> {
    construct(store, urn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprintf_matches_reference_directives() {
        let mut s = StringIo::new(Urn::new("mem://s"));
        s.sprintf("I have %d arms and %#x legs.", &[2, 1025]).unwrap();
        assert_eq!(
            String::from_utf8(s.as_slice().to_vec()).unwrap(),
            "I have 2 arms and 0x401 legs."
        );
    }

    #[test]
    fn sprintf_zero_padded_width() {
        let mut s = StringIo::new(Urn::new("mem://s"));
        for i in 0..3 {
            s.sprintf("Hello world %02d!", &[i]).unwrap();
        }
        assert_eq!(
            String::from_utf8(s.as_slice().to_vec()).unwrap(),
            "Hello world 00!Hello world 01!Hello world 02!"
        );
    }

    #[test]
    fn write_past_size_zero_fills_gap() {
        let mut s = StringIo::new(Urn::new("mem://s"));
        s.write(b"ab").unwrap();
        s.seek(SeekFrom::Start(5)).unwrap();
        s.write(b"z").unwrap();
        assert_eq!(s.as_slice(), b"ab\0\0\0z");
    }

    #[test]
    fn read_past_size_is_short_read_not_error() {
        let mut s = StringIo::with_data(Urn::new("mem://s"), b"hi".to_vec());
        let mut buf = [0u8; 10];
        let n = s.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");
        let n2 = s.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn copy_to_stream_round_trips_through_write_stream() {
        let mut src = StringIo::with_data(Urn::new("mem://a"), b"hello world".to_vec());
        let mut dst = StringIo::new(Urn::new("mem://b"));
        let mut sink = Vec::new();
        src.copy_to_stream(&mut sink, 5).unwrap();
        assert_eq!(sink, b"hello");

        dst.write_stream(&mut &b"more data"[..], None).unwrap();
        assert_eq!(dst.as_slice(), b"more data");
    }
}
