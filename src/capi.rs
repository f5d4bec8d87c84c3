//! C ABI façade over the resolver (spec §6 "C ABI", §9 "Global C-ABI
//! state"). One process-wide resolver, a handle→URN table, and a
//! monotonically increasing handle counter — matching `libaff4-c.cc`.
//! Not reentrant: a second [`AFF4_init`] call rebinds the resolver and
//! leaks every outstanding handle, which is documented rather than
//! guarded against.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::io::SeekFrom;
use std::slice;
use std::sync::{Mutex, OnceLock};

use crate::error::Aff4Status;
use crate::image::AFF4Image;
use crate::rdf::{self, RdfValue};
use crate::store::DataStore;
use crate::stream::Aff4Stream;
use crate::urn::Urn;
use crate::zip::ZipFile;

pub const AFF4_STATUS_OK: i32 = 0;
pub const AFF4_NOT_FOUND: i32 = -2;
pub const AFF4_INCOMPATIBLE_TYPES: i32 = -3;
pub const AFF4_INVALID_INPUT: i32 = -4;
pub const AFF4_IO_ERROR: i32 = -5;
pub const AFF4_NOT_IMPLEMENTED: i32 = -6;
pub const AFF4_GENERIC_ERROR: i32 = -7;

fn status_code(e: &Aff4Status) -> i32 {
    match e {
        Aff4Status::NotFound(_) => AFF4_NOT_FOUND,
        Aff4Status::IncompatibleTypes(_) => AFF4_INCOMPATIBLE_TYPES,
        Aff4Status::InvalidInput(_) => AFF4_INVALID_INPUT,
        Aff4Status::IoError(_) => AFF4_IO_ERROR,
        Aff4Status::NotImplemented(_) => AFF4_NOT_IMPLEMENTED,
        Aff4Status::GenericError(_) => AFF4_GENERIC_ERROR,
    }
}

struct GlobalState {
    store: DataStore,
    handles: HashMap<i32, Urn>,
    next_handle: i32,
}

impl GlobalState {
    fn fresh() -> Self {
        GlobalState {
            store: DataStore::new(),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }
}

static STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();

fn state() -> &'static Mutex<GlobalState> {
    STATE.get_or_init(|| Mutex::new(GlobalState::fresh()))
}

/// Idempotent explicit init. A second call discards the previous
/// resolver and handle table outright (spec §9: not supported to call
/// twice with outstanding handles).
#[no_mangle]
pub extern "C" fn AFF4_init() {
    let mut guard = state().lock().expect("AFF4 global state poisoned");
    *guard = GlobalState::fresh();
}

/// Opens the AFF4 container at `path`, loads its Turtle metadata,
/// resolves the image it holds, and returns a handle for
/// [`AFF4_read`]/[`AFF4_object_size`]/[`AFF4_close`].
///
/// An object is considered "the image" if it carries
/// `aff4:type = aff4:image_type`; containers produced by older tooling
/// that only set `aff4:legacy_image_type` are also accepted (spec §10).
/// Returns `-1` if the path is unreadable, has no Turtle metadata
/// member, or names no image.
///
/// # Safety
/// `path` must be a valid NUL-terminated C string for the duration of
/// the call.
#[no_mangle]
pub unsafe extern "C" fn AFF4_open(path: *const c_char) -> i32 {
    if path.is_null() {
        return -1;
    }
    let path_str = match CStr::from_ptr(path).to_str() {
        Ok(s) => s,
        Err(_) => return -1,
    };

    let mut guard = state().lock().expect("AFF4 global state poisoned");

    let volume_urn = Urn::from_filename(path_str);
    let volume = match ZipFile::open(volume_urn.clone(), path_str) {
        Ok(v) => v,
        Err(_) => return -1,
    };

    let turtle_urn = volume_urn.append("information.turtle");
    let turtle_bytes = match volume.read_member_urn(&turtle_urn) {
        Ok(b) => b,
        Err(_) => return -1,
    };
    if guard
        .store
        .load_from_turtle(&mut &turtle_bytes[..])
        .is_err()
    {
        return -1;
    }

    let type_predicate = Urn::new(rdf::AFF4_TYPE);
    let mut candidates = guard.store.query(
        &type_predicate,
        &RdfValue::XsdString(rdf::AFF4_IMAGE_TYPE.to_string()),
    );
    if candidates.is_empty() {
        candidates = guard.store.query(
            &type_predicate,
            &RdfValue::XsdString(rdf::AFF4_LEGACY_IMAGE_TYPE.to_string()),
        );
    }
    let image_urn = match candidates.into_iter().next() {
        Some(u) => u,
        None => return -1,
    };

    let handle = guard.next_handle;
    guard.next_handle += 1;
    guard.handles.insert(handle, image_urn);
    handle
}

/// Returns the image's logical size, or `0` if `handle` is unknown or
/// the object can't be opened (e.g. already checked out).
#[no_mangle]
pub extern "C" fn AFF4_object_size(handle: i32) -> u64 {
    let guard = state().lock().expect("AFF4 global state poisoned");
    let urn = match guard.handles.get(&handle) {
        Some(u) => u.clone(),
        None => return 0,
    };
    let store = guard.store.clone();
    drop(guard);

    match store.aff4_factory_open::<AFF4Image>(&urn) {
        Ok(obj) => {
            let size = obj.size();
            let _ = obj.close();
            size
        }
        Err(_) => 0,
    }
}

/// Reads up to `len` bytes at `offset` into `buf`. Returns the number
/// of bytes read (a short read past the image's size is not an error,
/// per spec §4.D), or `-1` on failure.
///
/// # Safety
/// `buf` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn AFF4_read(handle: i32, offset: u64, buf: *mut c_void, len: i32) -> i32 {
    if buf.is_null() || len < 0 {
        return -1;
    }

    let guard = state().lock().expect("AFF4 global state poisoned");
    let urn = match guard.handles.get(&handle) {
        Some(u) => u.clone(),
        None => return -1,
    };
    let store = guard.store.clone();
    drop(guard);

    let mut obj = match store.aff4_factory_open::<AFF4Image>(&urn) {
        Ok(obj) => obj,
        Err(_) => return -1,
    };
    if obj.seek(SeekFrom::Start(offset)).is_err() {
        let _ = obj.close();
        return -1;
    }

    let out = slice::from_raw_parts_mut(buf as *mut u8, len as usize);
    let n = match obj.read(out) {
        Ok(n) => n,
        Err(_) => {
            let _ = obj.close();
            return -1;
        }
    };
    let _ = obj.close();
    n as i32
}

/// Flushes and releases the image identified by `handle`.
///
/// Mirrors `libaff4-c.cc`'s `AFF4_close`: it re-resolves the handle's
/// object before releasing it, and if that resolution fails the handle
/// entry is left in the table rather than erased. A later `AFF4_read`
/// on the same handle fails again instead of reporting "unknown
/// handle" — a known quirk, preserved rather than fixed (spec §9 Open
/// Questions).
#[no_mangle]
pub extern "C" fn AFF4_close(handle: i32) -> i32 {
    let mut guard = state().lock().expect("AFF4 global state poisoned");
    let urn = match guard.handles.get(&handle) {
        Some(u) => u.clone(),
        None => return AFF4_NOT_FOUND,
    };
    let store = guard.store.clone();

    match store.aff4_factory_open::<AFF4Image>(&urn) {
        Ok(obj) => {
            let result = obj.close();
            guard.handles.remove(&handle);
            match result {
                Ok(()) => AFF4_STATUS_OK,
                Err(e) => status_code(&e),
            }
        }
        Err(e) => status_code(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdf::Compression;
    use crate::stream::Aff4StreamExt;
    use std::ffi::CString;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("aff4-capi-test-{}-{}", std::process::id(), name))
            .to_str()
            .unwrap()
            .to_string()
    }

    /// End-to-end handle lifecycle: build a one-image container on
    /// disk, then drive it purely through the C entry points, including
    /// the legacy-type fallback and the `AFF4_close` retention quirk.
    /// Written as a single test because the handle table is process-wide
    /// global state and would otherwise race against other `#[test]`s.
    #[test]
    fn open_size_read_close_round_trip() {
        let path = temp_path("container.aff4");

        let store = DataStore::new();
        let volume_urn = Urn::from_filename(&path);
        let mut volume = ZipFile::create(volume_urn.clone(), &path, "capi test container").unwrap();
        let image_urn = volume_urn.append("image");
        let mut image = AFF4Image::create(
            &store,
            image_urn.clone(),
            volume.clone(),
            8,
            4,
            Compression::Stored,
        )
        .unwrap();
        // Exercise the legacy-type fallback path: older containers only
        // set `aff4:legacy_image_type`.
        store.set(
            &image_urn,
            &Urn::new(rdf::AFF4_TYPE),
            RdfValue::XsdString(rdf::AFF4_LEGACY_IMAGE_TYPE.to_string()),
            true,
        );

        image.sprintf("hello capi", &[]).unwrap();
        image.flush(&store).unwrap();
        volume.close(&store).unwrap();

        AFF4_init();
        let c_path = CString::new(path.clone()).unwrap();
        let handle = unsafe { AFF4_open(c_path.as_ptr()) };
        assert!(handle >= 0);

        let size = AFF4_object_size(handle);
        assert_eq!(size, 10);

        let mut buf = [0u8; 10];
        let n = unsafe {
            AFF4_read(
                handle,
                0,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as i32,
            )
        };
        assert_eq!(n, 10);
        assert_eq!(&buf, b"hello capi");

        let closed = AFF4_close(handle);
        assert_eq!(closed, AFF4_STATUS_OK);

        // Handle retention quirk: after a successful close the entry is
        // gone, so a second close reports "not found" rather than
        // silently succeeding.
        assert_eq!(AFF4_close(handle), AFF4_NOT_FOUND);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn open_rejects_unreadable_path() {
        AFF4_init();
        let bogus = CString::new("/nonexistent/path/for/aff4-capi-test.aff4").unwrap();
        let handle = unsafe { AFF4_open(bogus.as_ptr()) };
        assert_eq!(handle, -1);
    }
}
