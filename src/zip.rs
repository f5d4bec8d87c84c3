//! The ZIP64 volume (spec §4.E): central-directory parsing tolerant of
//! concatenation, URN↔member-name escaping, and the append-on-reopen
//! `ZipFileSegment` writer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression as FlateLevel;
use log::{debug, warn};

use crate::error::{Aff4Result, Aff4Status};
use crate::object::AFF4Object;
use crate::store::DataStore;
use crate::stream::Aff4Stream;
use crate::urn::Urn;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CD_HEADER_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_EXTRA_TAG: u16 = 0x0001;

const COMPRESSION_STORED: u16 = 0;
const COMPRESSION_DEFLATE: u16 = 8;

/// A central-directory entry, resolved to an absolute physical file
/// offset (the concatenation-correction delta of §4.E already applied).
#[derive(Clone, Debug)]
pub struct CdFileHeader {
    pub member_name: String,
    pub local_header_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub compression_method: u16,
}

/// Percent-encodes every byte outside `[A-Za-z0-9/._-]` (spec §4.E);
/// `/` is deliberately in the preserved set so relative paths stay
/// readable.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_safe = b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'_' | b'-');
        if is_safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The encoding half of spec §4.E's URN↔member-name mapping.
pub fn member_name_for_urn(urn: &Urn, volume_urn: &Urn) -> String {
    if volume_urn.is_ancestor_of(urn) {
        let rel = volume_urn.relative_path(urn);
        percent_encode(rel.trim_start_matches('/'))
    } else {
        percent_encode(&urn.serialize())
    }
}

/// The inverse: a member name that decodes to a `scheme://` prefix is
/// returned as-is, never reattached to `volume_urn`.
pub fn urn_from_member_name(name: &str, volume_urn: &Urn) -> Urn {
    let decoded = percent_decode(name);
    if decoded.contains("://") {
        Urn::new(&decoded)
    } else {
        volume_urn.append(&decoded)
    }
}

fn crc32_of(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

fn compress(data: &[u8], method: u16) -> Aff4Result<Vec<u8>> {
    match method {
        COMPRESSION_STORED => Ok(data.to_vec()),
        COMPRESSION_DEFLATE => {
            let mut enc = DeflateEncoder::new(Vec::new(), FlateLevel::default());
            enc.write_all(data)
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;
            enc.finish().map_err(|e| Aff4Status::IoError(e.to_string()))
        }
        other => Err(Aff4Status::InvalidInput(format!(
            "unsupported zip compression method {}",
            other
        ))),
    }
}

fn decompress(data: &[u8], method: u16, uncompressed_size: u64) -> Aff4Result<Vec<u8>> {
    match method {
        COMPRESSION_STORED => Ok(data.to_vec()),
        COMPRESSION_DEFLATE => {
            let mut dec = DeflateDecoder::new(data);
            let mut out = Vec::with_capacity(uncompressed_size as usize);
            dec.read_to_end(&mut out)
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;
            Ok(out)
        }
        other => Err(Aff4Status::InvalidInput(format!(
            "unsupported zip compression method {}",
            other
        ))),
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Shared, physically-mutable state behind every `ZipFile` /
/// `ZipFileSegment` handle on the same archive.
struct ZipVolumeState {
    path: String,
    file: File,
    members: HashMap<String, CdFileHeader>,
    /// Segment accumulation buffers keyed by member name: a second
    /// `CreateMember` on the same URN must return the same buffer, so
    /// writes append rather than overwrite (spec §4.E). Entries are
    /// never evicted on their own; a caller that knows a member is
    /// one-shot (a bevy, an index, a map, the reserved container
    /// members) must call `ZipFile::release_member` once it has
    /// committed, or the buffer sits resident for the rest of the
    /// volume's life.
    open_buffers: HashMap<String, Rc<RefCell<Vec<u8>>>>,
    next_write_offset: u64,
    description: String,
    /// Set whenever a member is physically written; cleared when the
    /// central directory is (re)written. Lives here, not on `ZipFile`,
    /// so an `AFF4Image`/`AFF4Map` writing through its own volume
    /// handle marks the same dirty bit the resolver's cache flushes.
    dirty: bool,
}

impl ZipVolumeState {
    fn create(path: &str, description: &str) -> Aff4Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Aff4Status::IoError(format!("{}: {}", path, e)))?;
        Ok(ZipVolumeState {
            path: path.to_string(),
            file,
            members: HashMap::new(),
            open_buffers: HashMap::new(),
            next_write_offset: 0,
            description: description.to_string(),
            dirty: true,
        })
    }

    fn open(path: &str) -> Aff4Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Aff4Status::IoError(format!("{}: {}", path, e)))?;
        let len = file
            .metadata()
            .map_err(|e| Aff4Status::IoError(e.to_string()))?
            .len();

        let tail_len = len.min(66_000);
        let mut tail = vec![0u8; tail_len as usize];
        file.seek(SeekFrom::Start(len - tail_len))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        file.read_exact(&mut tail)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        // Scan backward for the EOCD signature; never trust a
        // recorded offset for *locating* it, only its own position.
        let eocd_rel = (0..=tail.len().saturating_sub(22))
            .rev()
            .find(|&i| read_u32(&tail, i) == EOCD_SIG)
            .ok_or_else(|| Aff4Status::InvalidInput("no end-of-central-directory record found".into()))?;
        let eocd_physical = len - tail_len + eocd_rel as u64;

        let mut total_entries = read_u16(&tail, eocd_rel + 10) as u64;
        let mut cd_size = read_u32(&tail, eocd_rel + 12) as u64;
        let mut cd_offset_recorded = read_u32(&tail, eocd_rel + 16) as u64;

        // Zip64: the locator sits in the fixed 20 bytes immediately
        // before the standard EOCD record.
        let mut trailer_start = eocd_physical;
        if eocd_rel >= 20 && read_u32(&tail, eocd_rel - 20) == ZIP64_LOCATOR_SIG {
            // The zip64 EOCD record immediately precedes its locator,
            // which immediately precedes the standard EOCD — both at
            // fixed sizes (56 and 20 bytes), so their physical position
            // is derived the same prefix-immune way as the CD itself,
            // never from the locator's recorded (and possibly stale)
            // offset field.
            let locator_physical = eocd_physical - 20;
            let zip64_record_physical = locator_physical - 56;
            if zip64_record_physical >= len - tail_len {
                let rel = (zip64_record_physical - (len - tail_len)) as usize;
                if read_u32(&tail, rel) == ZIP64_EOCD_SIG {
                    total_entries = read_u64(&tail, rel + 32);
                    cd_size = read_u64(&tail, rel + 40);
                    cd_offset_recorded = read_u64(&tail, rel + 48);
                    trailer_start = zip64_record_physical;
                }
            }
        }

        // The size field is a size, not an offset, so it is immune to
        // any prefix bytes: the CD always physically ends exactly
        // where the trailer (zip64 record, or plain EOCD) begins.
        let cd_physical_start = trailer_start.saturating_sub(cd_size);
        let correction = cd_physical_start as i64 - cd_offset_recorded as i64;

        let mut cd_buf = vec![0u8; cd_size as usize];
        file.seek(SeekFrom::Start(cd_physical_start))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        file.read_exact(&mut cd_buf)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        let mut members = HashMap::new();
        let mut pos = 0usize;
        for _ in 0..total_entries {
            if pos + 46 > cd_buf.len() || read_u32(&cd_buf, pos) != CD_HEADER_SIG {
                warn!("central directory entry truncated or malformed, stopping scan early");
                break;
            }
            let compression_method = read_u16(&cd_buf, pos + 10);
            let crc32 = read_u32(&cd_buf, pos + 16);
            let mut compressed_size = read_u32(&cd_buf, pos + 20) as u64;
            let mut uncompressed_size = read_u32(&cd_buf, pos + 24) as u64;
            let name_len = read_u16(&cd_buf, pos + 28) as usize;
            let extra_len = read_u16(&cd_buf, pos + 30) as usize;
            let comment_len = read_u16(&cd_buf, pos + 32) as usize;
            let mut local_header_offset = read_u32(&cd_buf, pos + 42) as u64;

            let name_start = pos + 46;
            let name = String::from_utf8_lossy(&cd_buf[name_start..name_start + name_len]).into_owned();

            let extra_start = name_start + name_len;
            let extra = &cd_buf[extra_start..extra_start + extra_len];
            let mut e = 0usize;
            while e + 4 <= extra.len() {
                let tag = read_u16(extra, e);
                let size = read_u16(extra, e + 2) as usize;
                if tag == ZIP64_EXTRA_TAG {
                    let mut f = e + 4;
                    if uncompressed_size == 0xFFFF_FFFF && f + 8 <= extra.len() {
                        uncompressed_size = read_u64(extra, f);
                        f += 8;
                    }
                    if compressed_size == 0xFFFF_FFFF && f + 8 <= extra.len() {
                        compressed_size = read_u64(extra, f);
                        f += 8;
                    }
                    if local_header_offset == 0xFFFF_FFFF && f + 8 <= extra.len() {
                        local_header_offset = read_u64(extra, f);
                    }
                }
                e += 4 + size;
            }

            let physical_offset = (local_header_offset as i64 + correction).max(0) as u64;
            members.insert(
                name.clone(),
                CdFileHeader {
                    member_name: name,
                    local_header_offset: physical_offset,
                    compressed_size,
                    uncompressed_size,
                    crc32,
                    compression_method,
                },
            );
            pos = name_start + name_len + extra_len + comment_len;
        }

        debug!(
            "opened zip volume {} with {} members (offset correction {})",
            path,
            members.len(),
            correction
        );

        Ok(ZipVolumeState {
            path: path.to_string(),
            file,
            members,
            open_buffers: HashMap::new(),
            next_write_offset: cd_physical_start,
            description: String::new(),
            dirty: false,
        })
    }

    fn read_member(&mut self, name: &str) -> Aff4Result<Vec<u8>> {
        let entry = self
            .members
            .get(name)
            .cloned()
            .ok_or_else(|| Aff4Status::NotFound(format!("no such member: {}", name)))?;
        self.file
            .seek(SeekFrom::Start(entry.local_header_offset))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        let mut local = [0u8; 30];
        self.file
            .read_exact(&mut local)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        if read_u32(&local, 0) != LOCAL_HEADER_SIG {
            return Err(Aff4Status::InvalidInput(format!(
                "local header signature mismatch for member {}",
                name
            )));
        }
        let name_len = read_u16(&local, 26) as u64;
        let extra_len = read_u16(&local, 28) as u64;
        let data_start = entry.local_header_offset + 30 + name_len + extra_len;
        self.file
            .seek(SeekFrom::Start(data_start))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.file
            .read_exact(&mut compressed)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        decompress(&compressed, entry.compression_method, entry.uncompressed_size)
    }

    /// Writes one member's local header + compressed data at
    /// `next_write_offset`, registers its (still-pending) central
    /// directory entry, and advances the write cursor.
    fn write_member(&mut self, name: &str, data: &[u8], method: u16) -> Aff4Result<()> {
        let compressed = compress(data, method)?;
        let crc = crc32_of(data);
        let offset = self.next_write_offset;

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        let name_bytes = name.as_bytes();
        let mut header = Vec::with_capacity(30 + name_bytes.len());
        header.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        header.extend_from_slice(&20u16.to_le_bytes()); // version needed
        header.extend_from_slice(&0u16.to_le_bytes()); // flags
        header.extend_from_slice(&method.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // mod time
        header.extend_from_slice(&0u16.to_le_bytes()); // mod date
        header.extend_from_slice(&crc.to_le_bytes());
        header.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        header.extend_from_slice(&(data.len() as u32).to_le_bytes());
        header.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // extra field length
        header.extend_from_slice(name_bytes);

        self.file
            .write_all(&header)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.file
            .write_all(&compressed)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        self.next_write_offset = offset + header.len() as u64 + compressed.len() as u64;
        self.dirty = true;
        self.members.insert(
            name.to_string(),
            CdFileHeader {
                member_name: name.to_string(),
                local_header_offset: offset,
                compressed_size: compressed.len() as u64,
                uncompressed_size: data.len() as u64,
                crc32: crc,
                compression_method: method,
            },
        );
        Ok(())
    }

    /// Writes the central directory and EOCD (zip64 variants when any
    /// field would overflow a 32-bit zip structure), finalizing the
    /// archive. Called when the owning `ZipFile` flushes.
    fn write_central_directory(&mut self) -> Aff4Result<()> {
        let cd_start = self.next_write_offset;
        self.file
            .seek(SeekFrom::Start(cd_start))
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        let mut cd_buf = Vec::new();
        let mut names: Vec<&String> = self.members.keys().collect();
        names.sort();
        for name in &names {
            let entry = &self.members[*name];
            let name_bytes = entry.member_name.as_bytes();
            cd_buf.extend_from_slice(&CD_HEADER_SIG.to_le_bytes());
            cd_buf.extend_from_slice(&20u16.to_le_bytes()); // version made by
            cd_buf.extend_from_slice(&20u16.to_le_bytes()); // version needed
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // flags
            cd_buf.extend_from_slice(&entry.compression_method.to_le_bytes());
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // mod time
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // mod date
            cd_buf.extend_from_slice(&entry.crc32.to_le_bytes());
            cd_buf.extend_from_slice(&(entry.compressed_size as u32).to_le_bytes());
            cd_buf.extend_from_slice(&(entry.uncompressed_size as u32).to_le_bytes());
            cd_buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // extra length
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // comment length
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // disk number start
            cd_buf.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            cd_buf.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            cd_buf.extend_from_slice(&(entry.local_header_offset as u32).to_le_bytes());
            cd_buf.extend_from_slice(name_bytes);
        }
        self.file
            .write_all(&cd_buf)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        let cd_size = cd_buf.len() as u64;
        let entry_count = names.len() as u64;
        let eocd_offset = cd_start + cd_size;

        if entry_count >= 0xFFFF || cd_size >= 0xFFFF_FFFF || cd_start >= 0xFFFF_FFFF {
            let mut z = Vec::new();
            z.extend_from_slice(&ZIP64_EOCD_SIG.to_le_bytes());
            z.extend_from_slice(&44u64.to_le_bytes()); // record size after this field
            z.extend_from_slice(&20u16.to_le_bytes()); // version made by
            z.extend_from_slice(&20u16.to_le_bytes()); // version needed
            z.extend_from_slice(&0u32.to_le_bytes()); // disk number
            z.extend_from_slice(&0u32.to_le_bytes()); // disk with CD
            z.extend_from_slice(&entry_count.to_le_bytes());
            z.extend_from_slice(&entry_count.to_le_bytes());
            z.extend_from_slice(&cd_size.to_le_bytes());
            z.extend_from_slice(&cd_start.to_le_bytes());
            self.file
                .write_all(&z)
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;

            let mut locator = Vec::new();
            locator.extend_from_slice(&ZIP64_LOCATOR_SIG.to_le_bytes());
            locator.extend_from_slice(&0u32.to_le_bytes()); // disk with zip64 eocd
            locator.extend_from_slice(&eocd_offset.to_le_bytes());
            locator.extend_from_slice(&1u32.to_le_bytes()); // total disks
            self.file
                .write_all(&locator)
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        }

        let mut eocd = Vec::new();
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&(entry_count.min(0xFFFF) as u16).to_le_bytes());
        eocd.extend_from_slice(&(entry_count.min(0xFFFF) as u16).to_le_bytes());
        eocd.extend_from_slice(&(cd_size.min(0xFFFF_FFFF) as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_start.min(0xFFFF_FFFF) as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // comment length
        self.file
            .write_all(&eocd)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.file
            .flush()
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        self.dirty = false;

        Ok(())
    }
}

/// `ZipFile`: the volume object (spec §3 "Volume"). Holds the
/// metadata (member table) and hands out [`ZipFileSegment`] writers.
/// Cheap to clone — an `AFF4Image`/`AFF4Map` holds its own `ZipFile`
/// handle to reach into its volume's member storage (spec §9 "Map
/// target ownership"), sharing the same underlying state and dirty bit
/// as the handle the resolver's cache flushes at close.
#[derive(Clone)]
pub struct ZipFile {
    urn: Urn,
    state: Rc<RefCell<ZipVolumeState>>,
}

impl ZipFile {
    pub fn create(urn: Urn, path: &str, description: &str) -> Aff4Result<Self> {
        let state = ZipVolumeState::create(path, description)?;
        Ok(ZipFile {
            urn,
            state: Rc::new(RefCell::new(state)),
        })
    }

    pub fn open(urn: Urn, path: &str) -> Aff4Result<Self> {
        let state = ZipVolumeState::open(path)?;
        Ok(ZipFile {
            urn,
            state: Rc::new(RefCell::new(state)),
        })
    }

    pub fn member_names(&self) -> Vec<String> {
        self.state.borrow().members.keys().cloned().collect()
    }

    pub fn contains_member(&self, name: &str) -> bool {
        self.state.borrow().members.contains_key(name)
    }

    pub fn read_member_bytes(&self, name: &str) -> Aff4Result<Vec<u8>> {
        self.state.borrow_mut().read_member(name)
    }

    pub fn read_member_urn(&self, member_urn: &Urn) -> Aff4Result<Vec<u8>> {
        let name = member_name_for_urn(member_urn, &self.urn);
        self.read_member_bytes(&name)
    }

    pub fn description(&self) -> String {
        self.state.borrow().description.clone()
    }

    /// `CreateMember(urn)` (spec §4.E): a second call for the same URN
    /// returns a segment sharing the existing accumulation buffer, so
    /// writes append rather than overwrite.
    pub fn create_member(&self, member_urn: &Urn) -> ZipFileSegment {
        let name = member_name_for_urn(member_urn, &self.urn);
        let mut state = self.state.borrow_mut();
        let buf = state
            .open_buffers
            .entry(name.clone())
            .or_insert_with(|| Rc::new(RefCell::new(Vec::new())))
            .clone();
        let pos = buf.borrow().len() as u64;
        drop(state);
        ZipFileSegment {
            urn: member_urn.clone(),
            member_name: name,
            state: self.state.clone(),
            buf,
            pos,
            dirty: false,
            zip_compression: COMPRESSION_DEFLATE,
        }
    }

    /// Drops the accumulation buffer for an already-committed member.
    /// `create_member` keeps a member's buffer alive so a later call for
    /// the same URN appends rather than overwrites (spec §4.E) — fine
    /// for a handful of named members, but an image/map write path
    /// creates one bevy/index/map member per flush and never revisits
    /// it, so holding every one of those buffers for the volume's whole
    /// lifetime grows memory with the total image size. Callers that
    /// know a member is one-shot should release it right after
    /// `commit`.
    pub fn release_member(&self, member_urn: &Urn) {
        let name = member_name_for_urn(member_urn, &self.urn);
        self.state.borrow_mut().open_buffers.remove(&name);
    }

    pub fn open_member_for_read(&self, member_urn: &Urn) -> Aff4Result<ZipFileSegment> {
        let name = member_name_for_urn(member_urn, &self.urn);
        if !self.contains_member(&name) {
            return Err(Aff4Status::NotFound(format!("no member for {}", member_urn)));
        }
        let data = self.read_member_bytes(&name)?;
        Ok(ZipFileSegment {
            urn: member_urn.clone(),
            member_name: name,
            state: self.state.clone(),
            buf: Rc::new(RefCell::new(data)),
            pos: 0,
            dirty: false,
            zip_compression: COMPRESSION_DEFLATE,
        })
    }

    /// Writes `container.description` and `information.turtle`
    /// (spec §6's reserved member names), then flushes the central
    /// directory — the full close sequence implied by spec §3's
    /// "Turtle metadata written at volume close reflects the final
    /// state of every flushed object."
    pub fn close(&mut self, store: &DataStore) -> Aff4Result<()> {
        let description_urn = self.urn.append("container.description");
        let mut desc_seg = self.create_member(&description_urn);
        desc_seg.set_stored();
        desc_seg.write(self.description().as_bytes())?;
        desc_seg.commit()?;
        self.release_member(&description_urn);

        let turtle_urn = self.urn.append("information.turtle");
        let mut turtle = Vec::new();
        store.dump_to_turtle(&mut turtle, &self.urn.serialize())?;
        let mut turtle_seg = self.create_member(&turtle_urn);
        turtle_seg.set_stored();
        turtle_seg.write(&turtle)?;
        turtle_seg.commit()?;
        self.release_member(&turtle_urn);

        self.flush(store)
    }
}

impl AFF4Object for ZipFile {
    fn urn(&self) -> &Urn {
        &self.urn
    }
    fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }
    fn load_from_urn(&mut self, _store: &DataStore) -> Aff4Result<()> {
        Ok(())
    }
    fn flush(&mut self, _store: &DataStore) -> Aff4Result<()> {
        if !self.state.borrow().dirty {
            return Ok(());
        }
        self.state.borrow_mut().write_central_directory()?;
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

/// A writable handle into one ZIP member. Accumulates uncompressed
/// bytes in memory; compression and the physical write happen on
/// `flush` (spec §4.E).
pub struct ZipFileSegment {
    urn: Urn,
    member_name: String,
    state: Rc<RefCell<ZipVolumeState>>,
    buf: Rc<RefCell<Vec<u8>>>,
    pos: u64,
    dirty: bool,
    zip_compression: u16,
}

impl ZipFileSegment {
    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    /// Bevy/map binary members are already compressed (or are raw
    /// packed records); storing them again under zip-level DEFLATE
    /// wastes a pass for no benefit, so image.rs/map.rs opt into
    /// STORED for those members.
    pub fn set_stored(&mut self) {
        self.zip_compression = COMPRESSION_STORED;
    }

    /// Physically writes the accumulated buffer as this segment's
    /// member, the way `AFF4Object::flush` does, but without needing a
    /// resolver handle — image/map bevy writes happen outside any
    /// `DataStore` callback.
    pub fn commit(&mut self) -> Aff4Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let data = self.buf.borrow().clone();
        self.state
            .borrow_mut()
            .write_member(&self.member_name, &data, self.zip_compression)?;
        self.dirty = false;
        Ok(())
    }
}

impl AFF4Object for ZipFileSegment {
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
        self.commit()
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

impl Aff4Stream for ZipFileSegment {
    fn read(&mut self, out: &mut [u8]) -> Aff4Result<usize> {
        let buf = self.buf.borrow();
        let pos = self.pos as usize;
        if pos >= buf.len() {
            return Ok(0);
        }
        let n = out.len().min(buf.len() - pos);
        out[..n].copy_from_slice(&buf[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Aff4Result<usize> {
        let mut buf = self.buf.borrow_mut();
        let pos = self.pos as usize;
        if pos > buf.len() {
            buf.resize(pos, 0);
        }
        if pos + data.len() > buf.len() {
            buf.resize(pos + data.len(), 0);
        }
        buf[pos..pos + data.len()].copy_from_slice(data);
        self.pos += data.len() as u64;
        self.dirty = true;
        Ok(data.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Aff4Result<u64> {
        let len = self.buf.borrow().len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if new_pos < 0 {
            return Err(Aff4Status::InvalidInput("seek before start of segment".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn size(&self) -> u64 {
        self.buf.borrow().len() as u64
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        self.buf.borrow_mut().clear();
        self.pos = 0;
        self.dirty = true;
        Ok(())
    }
}

/// Factory entry point for `aff4:zip_volume`. The URN's path names the
/// backing file; the volume must already exist (creation goes through
/// [`ZipFile::create`] directly, not the registry, since a brand-new
/// volume has no metadata to load yet).
pub fn construct(_store: &DataStore, urn: &Urn) -> Aff4Result<Box<dyn AFF4Object>> {
    let path = urn.path();
    let zip = ZipFile::open(urn.clone(), path)?;
    Ok(Box::new(zip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_name_roundtrip_descendant() {
        let volume = Urn::new("aff4://e21659ea-c7d6-4f4d-8070-919178aa4c7b");
        let member = volume.append("bin/ls/00000000/index");
        let name = member_name_for_urn(&member, &volume);
        assert_eq!(name, "bin/ls/00000000/index");
        assert_eq!(urn_from_member_name(&name, &volume), member);
    }

    #[test]
    fn member_name_roundtrip_non_descendant() {
        let volume = Urn::new("aff4://aaaa");
        let other = Urn::new("aff4://bbbb/c");
        let name = member_name_for_urn(&other, &volume);
        assert!(name.contains("%3a"));
        assert_eq!(urn_from_member_name(&name, &volume), other);
    }

    #[test]
    fn create_write_reopen_append_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("aff4-zip-test-{}.zip", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();

        let volume_urn = Urn::new("aff4://test-volume");
        {
            let zip = ZipFile::create(volume_urn.clone(), &path_str, "test container").unwrap();
            let member_urn = volume_urn.append("Foobar.txt");
            let mut seg = zip.create_member(&member_urn);
            seg.write(b"I am a segment!").unwrap();
            seg.flush(&DataStore::new()).unwrap();

            let mut seg2 = zip.create_member(&member_urn);
            seg2.seek(SeekFrom::End(0)).unwrap();
            seg2.write(b"I am another segment!").unwrap();
            seg2.flush(&DataStore::new()).unwrap();

            let mut zip = zip;
            zip.flush(&DataStore::new()).unwrap();
        }

        let reopened = ZipFile::open(volume_urn.clone(), &path_str).unwrap();
        let member_urn = volume_urn.append("Foobar.txt");
        let name = member_name_for_urn(&member_urn, &volume_urn);
        let data = reopened.read_member_bytes(&name).unwrap();
        assert_eq!(
            String::from_utf8(data).unwrap(),
            "I am a segment!I am another segment!"
        );

        std::fs::remove_file(&path_str).ok();
    }

    #[test]
    fn opens_with_arbitrary_prefix_bytes() {
        let dir = std::env::temp_dir();
        let base = dir.join(format!("aff4-zip-base-{}.zip", std::process::id()));
        let base_str = base.to_str().unwrap().to_string();
        let prefixed = dir.join(format!("aff4-zip-prefixed-{}.zip", std::process::id()));
        let prefixed_str = prefixed.to_str().unwrap().to_string();

        let volume_urn = Urn::new("aff4://prefixed-volume");
        {
            let zip = ZipFile::create(volume_urn.clone(), &base_str, "").unwrap();
            let member_urn = volume_urn.append("data.bin");
            let mut seg = zip.create_member(&member_urn);
            seg.write(b"payload bytes").unwrap();
            seg.flush(&DataStore::new()).unwrap();
            let mut zip = zip;
            zip.flush(&DataStore::new()).unwrap();
        }

        let original = std::fs::read(&base_str).unwrap();
        let mut padded = vec![0u8; 27];
        padded.extend_from_slice(&original);
        std::fs::write(&prefixed_str, &padded).unwrap();

        let reopened = ZipFile::open(volume_urn.clone(), &prefixed_str).unwrap();
        let member_urn = volume_urn.append("data.bin");
        let name = member_name_for_urn(&member_urn, &volume_urn);
        let data = reopened.read_member_bytes(&name).unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "payload bytes");

        std::fs::remove_file(&base_str).ok();
        std::fs::remove_file(&prefixed_str).ok();
    }
}
