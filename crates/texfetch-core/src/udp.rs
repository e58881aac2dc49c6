//! Legacy UDP image protocol, at the framing level: batched requests and
//! cancels going out, header and data packets coming in. The socket itself is
//! a collaborator behind `SimTransport`.

use crate::asset::{AssetId, CodecTag};

/// Requests batched into one datagram per host.
pub const IMAGES_PER_REQUEST: usize = 50;

/// Discard value that encodes "stop sending this image".
pub const CANCEL_DISCARD: i8 = -1;

#[derive(Clone, Debug, PartialEq)]
pub struct ImageRequest {
    pub id: AssetId,
    pub discard: i8,
    pub priority: f32,
    /// First packet index still needed; lets a resumed fetch skip what the
    /// cache already provided.
    pub next_packet: u32,
    pub image_type: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestBatch {
    pub agent_id: AssetId,
    pub session_id: AssetId,
    pub entries: Vec<ImageRequest>,
}

impl RequestBatch {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33 + self.entries.len() * 26);
        out.extend_from_slice(&self.agent_id.to_bytes());
        out.extend_from_slice(&self.session_id.to_bytes());
        out.push(self.entries.len() as u8);
        for e in &self.entries {
            out.extend_from_slice(&e.id.to_bytes());
            out.push(e.discard as u8);
            out.extend_from_slice(&e.priority.to_le_bytes());
            out.extend_from_slice(&e.next_packet.to_le_bytes());
            out.push(e.image_type);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<RequestBatch> {
        if buf.len() < 33 {
            return None;
        }
        let agent_id = AssetId::from_bytes(buf[0..16].try_into().ok()?);
        let session_id = AssetId::from_bytes(buf[16..32].try_into().ok()?);
        let count = buf[32] as usize;
        let mut entries = Vec::with_capacity(count);
        let mut off = 33;
        for _ in 0..count {
            if buf.len() < off + 26 {
                return None;
            }
            entries.push(ImageRequest {
                id: AssetId::from_bytes(buf[off..off + 16].try_into().ok()?),
                discard: buf[off + 16] as i8,
                priority: f32::from_le_bytes(buf[off + 17..off + 21].try_into().ok()?),
                next_packet: u32::from_le_bytes(buf[off + 21..off + 25].try_into().ok()?),
                image_type: buf[off + 25],
            });
            off += 26;
        }
        Some(RequestBatch {
            agent_id,
            session_id,
            entries,
        })
    }
}

/// First inbound packet of an image: carries the codec, packet count, total
/// size, and the opening payload bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageHeader {
    pub id: AssetId,
    pub codec: CodecTag,
    pub total_packets: u16,
    pub total_bytes: u32,
    pub payload: Vec<u8>,
}

impl ImageHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25 + self.payload.len());
        out.extend_from_slice(&self.id.to_bytes());
        out.push(self.codec.to_wire());
        out.extend_from_slice(&self.total_packets.to_le_bytes());
        out.extend_from_slice(&self.total_bytes.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<ImageHeader> {
        if buf.len() < 25 {
            return None;
        }
        let id = AssetId::from_bytes(buf[0..16].try_into().ok()?);
        let codec = CodecTag::from_wire(buf[16])?;
        let total_packets = u16::from_le_bytes(buf[17..19].try_into().ok()?);
        let total_bytes = u32::from_le_bytes(buf[19..23].try_into().ok()?);
        let data_size = u16::from_le_bytes(buf[23..25].try_into().ok()?) as usize;
        if buf.len() < 25 + data_size {
            return None;
        }
        Some(ImageHeader {
            id,
            codec,
            total_packets,
            total_bytes,
            payload: buf[25..25 + data_size].to_vec(),
        })
    }
}

/// Inbound data packet `1..total_packets`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImagePacket {
    pub id: AssetId,
    pub packet_num: u16,
    pub payload: Vec<u8>,
}

impl ImagePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.payload.len());
        out.extend_from_slice(&self.id.to_bytes());
        out.extend_from_slice(&self.packet_num.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<ImagePacket> {
        if buf.len() < 20 {
            return None;
        }
        let id = AssetId::from_bytes(buf[0..16].try_into().ok()?);
        let packet_num = u16::from_le_bytes(buf[16..18].try_into().ok()?);
        let data_size = u16::from_le_bytes(buf[18..20].try_into().ok()?) as usize;
        if buf.len() < 20 + data_size {
            return None;
        }
        Some(ImagePacket {
            id,
            packet_num,
            payload: buf[20..20 + data_size].to_vec(),
        })
    }
}

/// Outbound side of the simulator link. Implementations serialize the batches
/// with the codecs above (or feed them straight back in, for tests).
pub trait SimTransport: Send + Sync {
    fn send_request_batch(&self, host: &str, batch: &RequestBatch) -> Result<(), String>;
    fn send_cancel_batch(&self, host: &str, ids: &[AssetId]) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_batch_roundtrip() {
        let batch = RequestBatch {
            agent_id: AssetId(1),
            session_id: AssetId(2),
            entries: vec![
                ImageRequest {
                    id: AssetId(3),
                    discard: 2,
                    priority: 1500.0,
                    next_packet: 7,
                    image_type: 0,
                },
                ImageRequest {
                    id: AssetId(4),
                    discard: CANCEL_DISCARD,
                    priority: 0.0,
                    next_packet: 0,
                    image_type: 0,
                },
            ],
        };
        let decoded = RequestBatch::decode(&batch.encode()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.entries[1].discard, CANCEL_DISCARD);
    }

    #[test]
    fn test_header_roundtrip() {
        let h = ImageHeader {
            id: AssetId(9),
            codec: CodecTag::J2c,
            total_packets: 12,
            total_bytes: 11_600,
            payload: vec![0xAB; 600],
        };
        assert_eq!(ImageHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn test_packet_roundtrip_and_truncation() {
        let p = ImagePacket {
            id: AssetId(9),
            packet_num: 3,
            payload: vec![1; 1000],
        };
        let buf = p.encode();
        assert_eq!(ImagePacket::decode(&buf).unwrap(), p);
        assert!(ImagePacket::decode(&buf[..19]).is_none());
        assert!(ImagePacket::decode(&buf[..buf.len() - 1]).is_none());
    }
}
