//! `AFF4Map`: the sparse interval-redirection stream (spec §4.G).

use std::io::SeekFrom;

use log::warn;

use crate::error::{Aff4Result, Aff4Status};
use crate::image::AFF4Image;
use crate::object::AFF4Object;
use crate::rdf;
use crate::store::DataStore;
use crate::stream::{Aff4Stream, FileBackedObject};
use crate::urn::Urn;
use crate::zip::ZipFile;

const RANGE_RECORD_LEN: usize = 28;

/// One interval redirecting `[map_offset, map_offset+length)` to
/// `targets[target_id]` at `target_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub map_offset: u64,
    pub target_offset: u64,
    pub length: u64,
    pub target_id: usize,
}

fn overlaps(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start < b_end && b_start < a_end
}

/// Dispatches a read to a target stream of whatever concrete type it
/// turns out to be. A Map's targets are borrowed handles (spec §9 "Map
/// target ownership"): checked out, read, and returned immediately,
/// never held across calls.
fn read_from_target(
    store: &DataStore,
    target_urn: &Urn,
    offset: u64,
    buf: &mut [u8],
) -> Aff4Result<usize> {
    let type_urn = Urn::new(rdf::AFF4_TYPE);
    let type_str = store.get_string(target_urn, &type_urn).unwrap_or_default();
    match type_str.as_str() {
        rdf::AFF4_IMAGE_TYPE | rdf::AFF4_LEGACY_IMAGE_TYPE => {
            let mut obj = store.aff4_factory_open::<AFF4Image>(target_urn)?;
            obj.seek(SeekFrom::Start(offset))?;
            let n = obj.read(buf)?;
            obj.close()?;
            Ok(n)
        }
        rdf::AFF4_MAP_TYPE => {
            let mut obj = store.aff4_factory_open::<AFF4Map>(target_urn)?;
            obj.seek(SeekFrom::Start(offset))?;
            let n = obj.read(buf)?;
            obj.close()?;
            Ok(n)
        }
        _ => {
            let mut obj = store.aff4_factory_open::<FileBackedObject>(target_urn)?;
            obj.seek(SeekFrom::Start(offset))?;
            let n = obj.read(buf)?;
            obj.close()?;
            Ok(n)
        }
    }
}

/// A stream whose bytes are redirected to other streams by interval
/// (spec §4.G). Ranges never overlap after `add_range`; overlapping
/// insertions resolve "last write wins" (spec §9 Open Questions).
pub struct AFF4Map {
    urn: Urn,
    volume: ZipFile,
    targets: Vec<Urn>,
    ranges: Vec<Range>,
    size: u64,
    pos: u64,
    dirty: bool,
}

impl AFF4Map {
    pub fn create(store: &DataStore, urn: Urn, volume: ZipFile) -> Aff4Result<Self> {
        store.set(&urn, &Urn::new(rdf::AFF4_TYPE), rdf::AFF4_MAP_TYPE.into(), true);
        store.set(&urn, &Urn::new(rdf::AFF4_VOLUME), volume.urn().clone().into(), true);
        // See the analogous comment in `AFF4Image::create`: a fresh
        // volume has no `aff4:type` triple yet for the factory registry
        // to resolve it by on reopen.
        store.set(
            volume.urn(),
            &Urn::new(rdf::AFF4_TYPE),
            rdf::AFF4_ZIP_TYPE.into(),
            false,
        );
        Ok(AFF4Map {
            urn,
            volume,
            targets: Vec::new(),
            ranges: Vec::new(),
            size: 0,
            pos: 0,
            dirty: true,
        })
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn targets(&self) -> &[Urn] {
        &self.targets
    }

    fn target_id_for(&mut self, target: &Urn) -> usize {
        if let Some(id) = self.targets.iter().position(|t| t == target) {
            return id;
        }
        self.targets.push(target.clone());
        self.targets.len() - 1
    }

    /// `AddRange(mo, to, len, target)` (spec §4.G): truncates/splits
    /// every existing range overlapping `[mo, mo+len)`, then inserts the
    /// new range and coalesces adjacent same-target runs.
    pub fn add_range(&mut self, map_offset: u64, target_offset: u64, length: u64, target: &Urn) {
        if length == 0 {
            return;
        }
        let target_id = self.target_id_for(target);
        let new_start = map_offset;
        let new_end = map_offset + length;

        let mut next_ranges = Vec::with_capacity(self.ranges.len() + 2);
        for r in self.ranges.drain(..) {
            let r_end = r.map_offset + r.length;
            if !overlaps(r.map_offset, r_end, new_start, new_end) {
                next_ranges.push(r);
                continue;
            }
            if r.map_offset < new_start {
                next_ranges.push(Range {
                    map_offset: r.map_offset,
                    target_offset: r.target_offset,
                    length: new_start - r.map_offset,
                    target_id: r.target_id,
                });
            }
            if r_end > new_end {
                let trimmed = new_end - r.map_offset;
                next_ranges.push(Range {
                    map_offset: new_end,
                    target_offset: r.target_offset + trimmed,
                    length: r_end - new_end,
                    target_id: r.target_id,
                });
            }
        }
        next_ranges.push(Range {
            map_offset: new_start,
            target_offset,
            length,
            target_id,
        });
        next_ranges.sort_by_key(|r| r.map_offset);

        let mut coalesced: Vec<Range> = Vec::with_capacity(next_ranges.len());
        for r in next_ranges {
            if let Some(last) = coalesced.last_mut() {
                if last.target_id == r.target_id
                    && last.map_offset + last.length == r.map_offset
                    && last.target_offset + last.length == r.target_offset
                {
                    last.length += r.length;
                    continue;
                }
            }
            coalesced.push(r);
        }

        self.ranges = coalesced;
        self.size = self.size.max(new_end);
        self.dirty = true;
    }

    fn find_range_containing(&self, offset: u64) -> Option<&Range> {
        self.ranges
            .iter()
            .find(|r| r.map_offset <= offset && offset < r.map_offset + r.length)
    }

    fn next_range_after(&self, offset: u64) -> Option<&Range> {
        self.ranges.iter().find(|r| r.map_offset > offset)
    }

    fn target_member_urns(&self) -> (Urn, Urn) {
        (self.urn.append("map"), self.urn.append("idx"))
    }
}

impl AFF4Object for AFF4Map {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn load_from_urn(&mut self, store: &DataStore) -> Aff4Result<()> {
        if let Ok(v) = store.get_integer(&self.urn, &Urn::new(rdf::AFF4_SIZE)) {
            self.size = v as u64;
        }
        Ok(())
    }

    fn flush(&mut self, store: &DataStore) -> Aff4Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut packed = Vec::with_capacity(self.ranges.len() * RANGE_RECORD_LEN);
        for r in &self.ranges {
            packed.extend_from_slice(&r.map_offset.to_le_bytes());
            packed.extend_from_slice(&r.target_offset.to_le_bytes());
            packed.extend_from_slice(&r.length.to_le_bytes());
            packed.extend_from_slice(&(r.target_id as u32).to_le_bytes());
        }
        let idx_text = self
            .targets
            .iter()
            .map(|t| t.serialize())
            .collect::<Vec<_>>()
            .join("\n");

        let (map_urn, idx_urn) = self.target_member_urns();

        let mut map_seg = self.volume.create_member(&map_urn);
        map_seg.set_stored();
        map_seg.write(&packed)?;
        map_seg.commit()?;
        self.volume.release_member(&map_urn);

        let mut idx_seg = self.volume.create_member(&idx_urn);
        idx_seg.set_stored();
        idx_seg.write(idx_text.as_bytes())?;
        idx_seg.commit()?;
        self.volume.release_member(&idx_urn);

        store.set(&self.urn, &Urn::new(rdf::AFF4_SIZE), (self.size as i64).into(), true);
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

impl Aff4Stream for AFF4Map {
    fn read(&mut self, out: &mut [u8]) -> Aff4Result<usize> {
        // Target reads dispatch through the resolver, which this
        // method does not have direct access to: `Aff4Stream::read`
        // carries no `&DataStore`. We keep a clone around `self.volume`
        // for zip members, but target streams can be anything in the
        // graph, so map reads go through a companion method that does
        // take a store. Plain `read` here only serves already-resolved
        // zero-fill holes (size known, no live target needed).
        let mut total = 0;
        while total < out.len() && self.pos < self.size {
            if self.find_range_containing(self.pos).is_some() {
                // A real target read needs a `DataStore`; callers should
                // use `read_with_store`. Treat unresolved ranges here as
                // a hole so this inherent trait impl never panics.
                break;
            }
            let hole_end = self
                .next_range_after(self.pos)
                .map(|r| r.map_offset)
                .unwrap_or(self.size);
            let want = (out.len() - total).min((hole_end - self.pos) as usize);
            if want == 0 {
                break;
            }
            for b in &mut out[total..total + want] {
                *b = 0;
            }
            total += want;
            self.pos += want as u64;
        }
        Ok(total)
    }

    fn write(&mut self, _data: &[u8]) -> Aff4Result<usize> {
        Err(Aff4Status::InvalidInput(
            "AFF4Map is written through add_range, not Write".into(),
        ))
    }

    fn seek(&mut self, pos: SeekFrom) -> Aff4Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if new_pos < 0 {
            return Err(Aff4Status::InvalidInput("seek before start of map".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        self.ranges.clear();
        self.size = 0;
        self.pos = 0;
        self.dirty = true;
        Ok(())
    }
}

impl AFF4Map {
    /// Reads through live targets, resolved via `store` (spec §4.G read
    /// algorithm). This is the entry point real callers should use;
    /// `Aff4Stream::read` above only covers holes, since the stream
    /// trait has no resolver parameter to reach a map's targets with.
    pub fn read_with_store(&mut self, store: &DataStore, out: &mut [u8]) -> Aff4Result<usize> {
        let mut total = 0;
        while total < out.len() && self.pos < self.size {
            match self.find_range_containing(self.pos) {
                Some(range) => {
                    let range = *range;
                    let within = self.pos - range.map_offset;
                    let avail = range.length - within;
                    let want = (out.len() - total).min(avail as usize);
                    let target_urn = self.targets[range.target_id].clone();
                    let target_offset = range.target_offset + within;
                    match read_from_target(store, &target_urn, target_offset, &mut out[total..total + want]) {
                        Ok(n) => {
                            if n < want {
                                for b in &mut out[total + n..total + want] {
                                    *b = 0;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "map {} target {} read failed at offset {}: {}",
                                self.urn, target_urn, target_offset, e
                            );
                            for b in &mut out[total..total + want] {
                                *b = 0;
                            }
                        }
                    }
                    total += want;
                    self.pos += want as u64;
                }
                None => {
                    let hole_end = self
                        .next_range_after(self.pos)
                        .map(|r| r.map_offset)
                        .unwrap_or(self.size);
                    let want = (out.len() - total).min((hole_end - self.pos) as usize);
                    if want == 0 {
                        break;
                    }
                    for b in &mut out[total..total + want] {
                        *b = 0;
                    }
                    total += want;
                    self.pos += want as u64;
                }
            }
        }
        Ok(total)
    }
}

/// Factory entry point for `aff4:map_type`: reloads the packed range
/// table and target index directly from the volume's ZIP members
/// (these live outside the RDF graph, so `load_from_urn` can't reach
/// them — this constructor does, since it already holds `&DataStore`).
pub fn construct(store: &DataStore, urn: &Urn) -> Aff4Result<Box<dyn AFF4Object>> {
    let volume_urn = store.get_urn(urn, &Urn::new(rdf::AFF4_VOLUME))?;
    let volume_checkout = store.aff4_factory_open::<ZipFile>(&volume_urn)?;
    let volume = (*volume_checkout).clone();
    volume_checkout.close()?;

    let map_member_urn = urn.append("map");
    let idx_member_urn = urn.append("idx");

    let mut ranges = Vec::new();
    if let Ok(packed) = volume.read_member_urn(&map_member_urn) {
        let mut pos = 0;
        while pos + RANGE_RECORD_LEN <= packed.len() {
            let map_offset = read_u64(&packed, pos);
            let target_offset = read_u64(&packed, pos + 8);
            let length = read_u64(&packed, pos + 16);
            let target_id = read_u32(&packed, pos + 24) as usize;
            ranges.push(Range {
                map_offset,
                target_offset,
                length,
                target_id,
            });
            pos += RANGE_RECORD_LEN;
        }
    }

    let mut targets = Vec::new();
    if let Ok(idx_bytes) = volume.read_member_urn(&idx_member_urn) {
        let text = String::from_utf8_lossy(&idx_bytes);
        for line in text.split('\n') {
            if !line.is_empty() {
                targets.push(Urn::new(line));
            }
        }
    }

    Ok(Box::new(AFF4Map {
        urn: urn.clone(),
        volume,
        targets,
        ranges,
        size: 0,
        pos: 0,
        dirty: false,
    }))
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("aff4-map-test-{}-{}", std::process::id(), name))
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Mirrors `aff4_map_tests.cc`'s overlap-resolution case (spec S5).
    #[test]
    fn overlap_resolution_matches_scenario_s5() {
        let path = temp_path("s5.zip");
        let store = DataStore::new();
        let volume_urn = Urn::new("aff4://s5-volume");
        let volume = ZipFile::create(volume_urn.clone(), &path, "s5 test").unwrap();
        let map_urn = volume_urn.append("map-object");
        let mut map = AFF4Map::create(&store, map_urn, volume).unwrap();

        let s1 = Urn::new("aff4://s1-target");
        let s2 = Urn::new("aff4://s2-target");

        map.add_range(0, 0, 100, &s1);
        map.add_range(50, 0, 20, &s2);

        let ranges = map.ranges();
        assert_eq!(ranges.len(), 3);

        assert_eq!(ranges[0].map_offset, 0);
        assert_eq!(ranges[0].length, 50);
        assert_eq!(ranges[0].target_offset, 0);

        assert_eq!(ranges[1].map_offset, 50);
        assert_eq!(ranges[1].length, 20);
        assert_eq!(ranges[1].target_offset, 0);
        assert_ne!(ranges[1].target_id, ranges[0].target_id);

        assert_eq!(ranges[2].map_offset, 70);
        assert_eq!(ranges[2].length, 30);
        assert_eq!(ranges[2].target_offset, 70);
        assert_eq!(ranges[2].target_id, ranges[0].target_id);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ranges_stay_sorted_and_non_overlapping() {
        let path = temp_path("invariant.zip");
        let store = DataStore::new();
        let volume_urn = Urn::new("aff4://invariant-volume");
        let volume = ZipFile::create(volume_urn.clone(), &path, "").unwrap();
        let map_urn = volume_urn.append("map-object");
        let mut map = AFF4Map::create(&store, map_urn, volume).unwrap();
        let target = Urn::new("aff4://target");

        map.add_range(100, 0, 50, &target);
        map.add_range(0, 0, 50, &target);
        map.add_range(40, 1000, 30, &target);

        let ranges = map.ranges();
        for w in ranges.windows(2) {
            assert!(w[0].map_offset + w[0].length <= w[1].map_offset);
            assert!(w[0].map_offset < w[1].map_offset);
        }
        for r in ranges {
            assert!(r.length > 0);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn read_zero_fills_holes() {
        let path = temp_path("holes.zip");
        let store = DataStore::new();
        let volume_urn = Urn::new("aff4://holes-volume");
        let volume = ZipFile::create(volume_urn.clone(), &path, "").unwrap();
        let map_urn = volume_urn.append("map-object");
        let mut map = AFF4Map::create(&store, map_urn, volume).unwrap();
        map.size = 20;
        map.dirty = true;

        map.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0xffu8; 20];
        let n = map.read(&mut buf).unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[..], &[0u8; 20][..]);

        std::fs::remove_file(&path).ok();
    }
}
