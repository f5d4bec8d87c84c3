//! The RDF value model and the vocabulary this library emits (spec §3, §6).

use crate::error::{Aff4Result, Aff4Status};
use crate::urn::Urn;

/// `xsd:string` datatype URI.
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
/// `xsd:integer` datatype URI.
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
/// Opaque-bytes datatype URI (AFF4-specific, no XSD equivalent).
pub const AFF4_BYTES: &str = "aff4:bytes";

// Predicates / vocabulary (spec §6 minimum).
pub const AFF4_TYPE: &str = "aff4:type";
pub const AFF4_STORED: &str = "aff4:stored";
pub const AFF4_CHUNK_SIZE: &str = "aff4:chunk_size";
pub const AFF4_CHUNKS_PER_SEGMENT: &str = "aff4:chunks_per_segment";
pub const AFF4_SIZE: &str = "aff4:size";
pub const AFF4_CATEGORY: &str = "aff4:category";
pub const AFF4_STREAM_WRITE_MODE: &str = "aff4:stream_write_mode";
/// Links a stream/image/map object to the volume URN that physically
/// holds its ZIP members. Not in spec.md's minimum vocabulary list but
/// required to resolve an object's backing volume on reopen.
pub const AFF4_VOLUME: &str = "aff4:volume";

// Type URNs.
pub const AFF4_ZIP_TYPE: &str = "aff4:zip_volume";
pub const AFF4_IMAGE_TYPE: &str = "aff4:image_type";
pub const AFF4_LEGACY_IMAGE_TYPE: &str = "aff4:legacy_image_type";
pub const AFF4_MAP_TYPE: &str = "aff4:map_type";
pub const AFF4_FILE_TYPE: &str = "aff4:file_type";

// Compression URIs.
pub const AFF4_IMAGE_COMPRESSION_STORED: &str = "aff4:stored";
pub const AFF4_IMAGE_COMPRESSION_DEFLATE: &str = "aff4:deflate";
pub const AFF4_IMAGE_COMPRESSION_SNAPPY: &str = "aff4:snappy";
pub const AFF4_IMAGE_COMPRESSION_LZ4: &str = "aff4:lz4";

// Category URIs.
pub const AFF4_CATEGORY_MEMORY: &str = "aff4:memory/physical";
pub const AFF4_CATEGORY_DISK: &str = "aff4:disk/physical";

/// A tagged RDF value, as described in spec §3.
#[derive(Clone, Debug, PartialEq)]
pub enum RdfValue {
    XsdString(String),
    XsdInteger(i64),
    RdfBytes(Vec<u8>),
    Urn(Urn),
}

impl RdfValue {
    /// The datatype URI this value would be serialized with.
    pub fn data_type_uri(&self) -> &'static str {
        match self {
            RdfValue::XsdString(_) => XSD_STRING,
            RdfValue::XsdInteger(_) => XSD_INTEGER,
            RdfValue::RdfBytes(_) => AFF4_BYTES,
            RdfValue::Urn(_) => "aff4:URN",
        }
    }

    pub fn as_string(&self) -> Aff4Result<&str> {
        match self {
            RdfValue::XsdString(s) => Ok(s),
            _ => Err(Aff4Status::IncompatibleTypes(
                "value is not an XSDString".into(),
            )),
        }
    }

    pub fn as_integer(&self) -> Aff4Result<i64> {
        match self {
            RdfValue::XsdInteger(v) => Ok(*v),
            _ => Err(Aff4Status::IncompatibleTypes(
                "value is not an XSDInteger".into(),
            )),
        }
    }

    pub fn as_bytes(&self) -> Aff4Result<&[u8]> {
        match self {
            RdfValue::RdfBytes(b) => Ok(b),
            _ => Err(Aff4Status::IncompatibleTypes(
                "value is not RDFBytes".into(),
            )),
        }
    }

    pub fn as_urn(&self) -> Aff4Result<&Urn> {
        match self {
            RdfValue::Urn(u) => Ok(u),
            _ => Err(Aff4Status::IncompatibleTypes("value is not a URN".into())),
        }
    }
}

impl From<&str> for RdfValue {
    fn from(s: &str) -> Self {
        RdfValue::XsdString(s.to_string())
    }
}

impl From<String> for RdfValue {
    fn from(s: String) -> Self {
        RdfValue::XsdString(s)
    }
}

impl From<i64> for RdfValue {
    fn from(v: i64) -> Self {
        RdfValue::XsdInteger(v)
    }
}

impl From<Urn> for RdfValue {
    fn from(u: Urn) -> Self {
        RdfValue::Urn(u)
    }
}

/// Chunk/bevy compression method (spec §3 Image attributes, §4.F).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Stored,
    Deflate,
    Snappy,
    Lz4,
}

impl Compression {
    pub fn to_urn(self) -> &'static str {
        match self {
            Compression::Stored => AFF4_IMAGE_COMPRESSION_STORED,
            Compression::Deflate => AFF4_IMAGE_COMPRESSION_DEFLATE,
            Compression::Snappy => AFF4_IMAGE_COMPRESSION_SNAPPY,
            Compression::Lz4 => AFF4_IMAGE_COMPRESSION_LZ4,
        }
    }

    pub fn from_urn(uri: &str) -> Aff4Result<Self> {
        match uri {
            AFF4_IMAGE_COMPRESSION_STORED => Ok(Compression::Stored),
            AFF4_IMAGE_COMPRESSION_DEFLATE => Ok(Compression::Deflate),
            AFF4_IMAGE_COMPRESSION_SNAPPY => Ok(Compression::Snappy),
            AFF4_IMAGE_COMPRESSION_LZ4 => Ok(Compression::Lz4),
            other => Err(Aff4Status::InvalidInput(format!(
                "unknown compression URI: {}",
                other
            ))),
        }
    }
}

/// `aff4:stream_write_mode` (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
    Read,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Truncate => "truncate",
            WriteMode::Append => "append",
            WriteMode::Read => "read",
        }
    }

    pub fn from_str(s: &str) -> Aff4Result<Self> {
        match s {
            "truncate" => Ok(WriteMode::Truncate),
            "append" => Ok(WriteMode::Append),
            "read" => Ok(WriteMode::Read),
            other => Err(Aff4Status::InvalidInput(format!(
                "unknown stream write mode: {}",
                other
            ))),
        }
    }
}

/// `aff4:category` (spec §6): what kind of acquisition this stream holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    MemoryPhysical,
    DiskPhysical,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::MemoryPhysical => AFF4_CATEGORY_MEMORY,
            Category::DiskPhysical => AFF4_CATEGORY_DISK,
        }
    }
}
