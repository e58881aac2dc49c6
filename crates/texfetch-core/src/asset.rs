//! Asset identifiers, image buffers, and pipeline constants.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::RngCore;

/// Coarsest discard level a request may ask for. 0 is the full asset.
pub const MAX_DISCARD: u8 = 5;

/// Payload size of every non-terminal UDP data packet.
pub const MAX_IMG_PACKET_SIZE: usize = 1000;
/// Payload size carried by the UDP header packet (packet 0).
pub const FIRST_PACKET_SIZE: usize = 600;

/// Upper bound on a single compressed asset.
pub const MAX_IMAGE_DATA_SIZE: usize = 4 * 1024 * 1024;
/// Fallback request size when dimensions are unknown.
pub const TEXTURE_CACHE_ENTRY_SIZE: usize = 1024;

/// 128-bit asset identifier, printed and parsed in UUID form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub u128);

impl AssetId {
    pub const NULL: AssetId = AssetId(0);

    pub fn random() -> AssetId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        AssetId(u128::from_be_bytes(bytes))
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> AssetId {
        AssetId(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self)
    }
}

impl FromStr for AssetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(format!("bad asset id length: {}", s));
        }
        u128::from_str_radix(&hex, 16)
            .map(AssetId)
            .map_err(|e| format!("bad asset id {}: {}", s, e))
    }
}

/// Compressed image codec, as carried on the wire and in the cache index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CodecTag {
    Invalid,
    Rgb,
    J2c,
    Tga,
    Jpeg,
    Png,
}

impl CodecTag {
    pub fn to_wire(self) -> u8 {
        match self {
            CodecTag::Invalid => 0,
            CodecTag::Rgb => 1,
            CodecTag::J2c => 2,
            CodecTag::Tga => 3,
            CodecTag::Jpeg => 4,
            CodecTag::Png => 5,
        }
    }

    pub fn from_wire(v: u8) -> Option<CodecTag> {
        match v {
            0 => Some(CodecTag::Invalid),
            1 => Some(CodecTag::Rgb),
            2 => Some(CodecTag::J2c),
            3 => Some(CodecTag::Tga),
            4 => Some(CodecTag::Jpeg),
            5 => Some(CodecTag::Png),
            _ => None,
        }
    }

    /// Codec implied by a URL's file extension; None when it doesn't look like
    /// an image path at all.
    pub fn from_url(url: &str) -> Option<CodecTag> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "j2c" | "j2k" | "jp2" => Some(CodecTag::J2c),
            "tga" => Some(CodecTag::Tga),
            "jpg" | "jpeg" => Some(CodecTag::Jpeg),
            "png" => Some(CodecTag::Png),
            _ => None,
        }
    }
}

/// Decoded pixel data handed to the caller. The buffer is shared, never
/// exclusive: the pipeline may still hold a reference for a cache write.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub data: Arc<Vec<u8>>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, components: u8, data: Vec<u8>) -> RawImage {
        RawImage {
            width,
            height,
            components,
            data: Arc::new(data),
        }
    }
}

/// Contiguous compressed prefix of an asset.
///
/// `total` is the full asset size when known. The legacy cache convention of
/// storing `total + 1` for partially loaded assets is produced only at the
/// cache-write boundary; in memory the state is explicit.
#[derive(Clone, Debug, Default)]
pub struct FormattedBytes {
    pub codec: Option<CodecTag>,
    pub data: Vec<u8>,
    pub total: Option<usize>,
}

impl FormattedBytes {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn have_all(&self) -> bool {
        match self.total {
            Some(t) => self.data.len() >= t,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.total = None;
        // codec tag stays: it is stable from the first successful decode
    }

    /// The file-size value emitted on cache writes: the real total when the
    /// asset is complete, length + 1 otherwise (legacy partial marker).
    pub fn file_size_for_cache(&self) -> usize {
        match self.total {
            Some(t) if self.data.len() >= t => t,
            Some(t) => t + 1,
            None => self.data.len() + 1,
        }
    }
}

/// Work priority packing: image priority in the low bits, one high bit for
/// requests that must jump the queue.
pub const WORK_PRIORITY_HIGH_BIT: u64 = 1 << 31;
pub const WORK_PRIORITY_LOW_MASK: u64 = WORK_PRIORITY_HIGH_BIT - 1;

pub fn work_priority(image_priority: f32, immediate: bool) -> u64 {
    let low = (image_priority.max(0.0) as u64).min(WORK_PRIORITY_LOW_MASK);
    if immediate {
        low | WORK_PRIORITY_HIGH_BIT
    } else {
        low
    }
}
