//! Codec seam. The pipeline never decodes anything itself; it sizes requests
//! with `size_for` and ships compressed prefixes to whatever implementation
//! the embedder registers.

use crate::asset::{CodecTag, RawImage, FIRST_PACKET_SIZE, MAX_DISCARD, MAX_IMAGE_DATA_SIZE};
use crate::error_handling::FetchError;

/// Result of decoding a compressed prefix. `discard` is the level the codec
/// actually reached, which may be coarser than asked for when the prefix was
/// short.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub raw: RawImage,
    pub aux: Option<RawImage>,
    pub discard: u8,
}

pub trait Codec: Send + Sync {
    fn decode(
        &self,
        codec: CodecTag,
        bytes: &[u8],
        target_discard: u8,
        need_aux: bool,
    ) -> Result<DecodedImage, FetchError>;

    /// Bytes of compressed prefix needed to recover the given discard level.
    fn size_for(&self, width: u32, height: u32, components: u8, discard: u8) -> usize {
        size_for_discard(width, height, components, discard)
    }
}

/// Hands the compressed bytes straight through as a 1-component "image".
/// For tooling that exercises the pipeline but only wants the bytes (the CLI
/// saving a .j2c to disk); rendering embedders register a real codec.
pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn decode(
        &self,
        _codec: CodecTag,
        bytes: &[u8],
        target_discard: u8,
        _need_aux: bool,
    ) -> Result<DecodedImage, FetchError> {
        Ok(DecodedImage {
            raw: RawImage::new(bytes.len() as u32, 1, 1, bytes.to_vec()),
            aux: None,
            discard: target_discard,
        })
    }
}

/// Nominal 1:8 compression: a discard level halves each dimension.
pub fn size_for_discard(width: u32, height: u32, components: u8, discard: u8) -> usize {
    let d = discard.min(MAX_DISCARD) as u32;
    let w = (width >> d).max(1) as usize;
    let h = (height >> d).max(1) as usize;
    let bytes = w * h * components.max(1) as usize / 8;
    bytes.clamp(FIRST_PACKET_SIZE, MAX_IMAGE_DATA_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_shrinks_with_discard() {
        let full = size_for_discard(1024, 1024, 3, 0);
        let half = size_for_discard(1024, 1024, 3, 1);
        let coarse = size_for_discard(1024, 1024, 3, MAX_DISCARD);
        assert!(full > half);
        assert!(half > coarse);
        assert!(coarse >= FIRST_PACKET_SIZE);
    }

    #[test]
    fn test_size_clamped() {
        assert_eq!(size_for_discard(8, 8, 1, MAX_DISCARD), FIRST_PACKET_SIZE);
        assert!(size_for_discard(u32::MAX / 2, 2, 4, 0) <= MAX_IMAGE_DATA_SIZE);
    }
}
