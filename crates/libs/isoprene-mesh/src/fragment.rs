//! MTU-bounded packet fragmentation with a typed 5-byte header.

use crate::error::MeshError;
use std::collections::{BTreeMap, HashMap};

/// Header: `type u8 || seq u16 || total u16`, big-endian.
pub const FRAGMENT_HEADER_LEN: usize = 5;
/// `total` is a u16; a packet can never span more fragments than this.
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;
/// Stale partial packets are dropped after this many milliseconds.
pub const REASSEMBLY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentType {
    Start = 0x01,
    Continue = 0x02,
    End = 0x03,
}

impl FragmentType {
    pub fn from_byte(byte: u8) -> Result<Self, MeshError> {
        match byte {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Continue),
            0x03 => Ok(Self::End),
            other => Err(MeshError::UnknownFragmentType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_type: FragmentType,
    pub seq: u16,
    pub total: u16,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let seq = self.seq.to_be_bytes();
        let total = self.total.to_be_bytes();
        [
            self.fragment_type as u8,
            seq[0],
            seq[1],
            total[0],
            total[1],
        ]
    }

    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), MeshError> {
        if frame.len() < FRAGMENT_HEADER_LEN {
            return Err(MeshError::FrameTooShort(frame.len()));
        }
        let fragment_type = FragmentType::from_byte(frame[0])?;
        let seq = u16::from_be_bytes([frame[1], frame[2]]);
        let total = u16::from_be_bytes([frame[3], frame[4]]);
        if seq >= total {
            return Err(MeshError::SequenceOutOfRange { seq, total });
        }
        Ok((
            Self {
                fragment_type,
                seq,
                total,
            },
            &frame[FRAGMENT_HEADER_LEN..],
        ))
    }
}

/// Splits packets into MTU-bounded fragments.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    mtu: usize,
}

impl Fragmenter {
    pub fn new(mtu: usize) -> Result<Self, MeshError> {
        if mtu <= FRAGMENT_HEADER_LEN {
            return Err(MeshError::MtuTooSmall(mtu));
        }
        Ok(Self { mtu })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Fragment payload capacity per frame.
    pub fn chunk_size(&self) -> usize {
        self.mtu - FRAGMENT_HEADER_LEN
    }

    /// Split `packet` into frames. A packet fitting one frame yields exactly
    /// one START fragment with `total = 1`.
    pub fn fragment(&self, packet: &[u8]) -> Result<Vec<Vec<u8>>, MeshError> {
        if packet.is_empty() {
            return Err(MeshError::EmptyPacket);
        }
        let chunk = self.chunk_size();
        let needed = packet.len().div_ceil(chunk);
        if needed > MAX_FRAGMENTS {
            return Err(MeshError::TooManyFragments {
                needed,
                limit: MAX_FRAGMENTS,
            });
        }

        let total = needed as u16;
        let mut frames = Vec::with_capacity(needed);
        for (index, piece) in packet.chunks(chunk).enumerate() {
            let seq = index as u16;
            let fragment_type = if seq == 0 {
                FragmentType::Start
            } else if seq == total - 1 {
                FragmentType::End
            } else {
                FragmentType::Continue
            };
            let header = FragmentHeader {
                fragment_type,
                seq,
                total,
            };
            let mut frame = Vec::with_capacity(FRAGMENT_HEADER_LEN + piece.len());
            frame.extend_from_slice(&header.encode());
            frame.extend_from_slice(piece);
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[derive(Debug)]
struct PendingPacket {
    total: u16,
    pieces: BTreeMap<u16, Vec<u8>>,
    last_fragment_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub packets_reassembled: u64,
    pub packets_timed_out: u64,
    pub fragments_received: u64,
    pub pending_packets: usize,
}

/// Per-sender reassembly of fragmented packets.
///
/// Out-of-order fragments are buffered; a packet is emitted once every
/// sequence in `[0, total)` is present. Corruption (conflicting bytes for a
/// sequence, or a changed total) drops the sender's buffer and errors.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<String, PendingPacket>,
    timeout_ms: u64,
    packets_reassembled: u64,
    packets_timed_out: u64,
    fragments_received: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_timeout(REASSEMBLY_TIMEOUT_MS)
    }

    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout_ms,
            packets_reassembled: 0,
            packets_timed_out: 0,
            fragments_received: 0,
        }
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            packets_reassembled: self.packets_reassembled,
            packets_timed_out: self.packets_timed_out,
            fragments_received: self.fragments_received,
            pending_packets: self.buffers.len(),
        }
    }

    /// Ingest one frame from `sender`. Returns the full packet when this
    /// frame completes it.
    pub fn ingest(
        &mut self,
        sender: &str,
        frame: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, MeshError> {
        let (header, payload) = FragmentHeader::decode(frame)?;
        self.fragments_received += 1;

        let buffer = self
            .buffers
            .entry(sender.to_string())
            .or_insert_with(|| PendingPacket {
                total: header.total,
                pieces: BTreeMap::new(),
                last_fragment_ms: now_ms,
            });

        if buffer.total != header.total {
            let expected = buffer.total;
            self.buffers.remove(sender);
            return Err(MeshError::TotalMismatch {
                expected,
                got: header.total,
            });
        }

        if let Some(existing) = buffer.pieces.get(&header.seq) {
            if existing == payload {
                // Benign duplicate, e.g. a retried notification.
                return Ok(None);
            }
            self.buffers.remove(sender);
            return Err(MeshError::FragmentConflict { seq: header.seq });
        }

        buffer.pieces.insert(header.seq, payload.to_vec());
        buffer.last_fragment_ms = now_ms;

        if buffer.pieces.len() < buffer.total as usize {
            return Ok(None);
        }

        let Some(complete) = self.buffers.remove(sender) else {
            return Ok(None);
        };
        let mut packet =
            Vec::with_capacity(complete.pieces.values().map(Vec::len).sum());
        for piece in complete.pieces.values() {
            packet.extend_from_slice(piece);
        }
        self.packets_reassembled += 1;
        Ok(Some(packet))
    }

    /// Drop partial packets with no fragment for the timeout window.
    /// Returns the number of dropped packets.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, pending| now_ms.saturating_sub(pending.last_fragment_ms) < timeout);
        let dropped = before - self.buffers.len();
        self.packets_timed_out += dropped as u64;
        dropped
    }

    /// Forget everything buffered for one sender.
    pub fn drop_sender(&mut self, sender: &str) {
        self.buffers.remove(sender);
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{FragmentHeader, FragmentType, Fragmenter, Reassembler};
    use crate::error::MeshError;

    #[test]
    fn single_fragment_packet_uses_start_with_total_one() {
        // Ten bytes of 0x01 at MTU 185: one 15-byte frame.
        let fragmenter = Fragmenter::new(185).expect("fragmenter");
        let packet = vec![0x01; 10];
        let frames = fragmenter.fragment(&packet).expect("fragment");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 15);
        assert_eq!(&frames[0][..5], &[0x01, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&frames[0][5..], packet.as_slice());

        let mut reassembler = Reassembler::new();
        let out = reassembler
            .ingest("peer", &frames[0], 0)
            .expect("ingest")
            .expect("complete");
        assert_eq!(out, packet);
    }

    #[test]
    fn split_at_mtu_boundary_produces_start_and_end() {
        // 256 bytes at MTU 185 (180-byte chunks): two frames.
        let fragmenter = Fragmenter::new(185).expect("fragmenter");
        let packet: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        let frames = fragmenter.fragment(&packet).expect("fragment");

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..5], &[0x01, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&frames[0][5..], &packet[..180]);
        assert_eq!(&frames[1][..5], &[0x03, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(&frames[1][5..], &packet[180..]);

        let mut reassembler = Reassembler::new();
        assert!(reassembler
            .ingest("peer", &frames[0], 0)
            .expect("ingest")
            .is_none());
        let out = reassembler
            .ingest("peer", &frames[1], 1)
            .expect("ingest")
            .expect("complete");
        assert_eq!(out, packet);
    }

    #[test]
    fn out_of_order_fragments_are_buffered() {
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        let packet: Vec<u8> = (0..20).collect();
        let frames = fragmenter.fragment(&packet).expect("fragment");
        assert_eq!(frames.len(), 4);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frame in [&frames[3], &frames[0], &frames[2], &frames[1]] {
            result = reassembler.ingest("peer", frame, 0).expect("ingest");
        }
        assert_eq!(result.expect("complete"), packet);
    }

    #[test]
    fn duplicate_identical_fragment_is_ignored() {
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        let packet: Vec<u8> = (0..20).collect();
        let frames = fragmenter.fragment(&packet).expect("fragment");

        let mut reassembler = Reassembler::new();
        assert!(reassembler.ingest("peer", &frames[0], 0).expect("ingest").is_none());
        assert!(reassembler.ingest("peer", &frames[0], 1).expect("ingest").is_none());
        assert_eq!(reassembler.stats().pending_packets, 1);
    }

    #[test]
    fn conflicting_fragment_bytes_drop_the_buffer() {
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        let packet: Vec<u8> = (0..20).collect();
        let frames = fragmenter.fragment(&packet).expect("fragment");

        let mut reassembler = Reassembler::new();
        reassembler.ingest("peer", &frames[0], 0).expect("ingest");

        let mut corrupted = frames[0].clone();
        corrupted[7] ^= 0xFF;
        let err = reassembler
            .ingest("peer", &corrupted, 1)
            .expect_err("conflict");
        assert!(matches!(err, MeshError::FragmentConflict { seq: 0 }));
        assert_eq!(reassembler.stats().pending_packets, 0);
    }

    #[test]
    fn changed_total_drops_the_buffer() {
        let mut reassembler = Reassembler::new();
        let frame_a = {
            let header = FragmentHeader {
                fragment_type: FragmentType::Start,
                seq: 0,
                total: 3,
            };
            let mut frame = header.encode().to_vec();
            frame.push(0xAA);
            frame
        };
        let frame_b = {
            let header = FragmentHeader {
                fragment_type: FragmentType::Continue,
                seq: 1,
                total: 4,
            };
            let mut frame = header.encode().to_vec();
            frame.push(0xBB);
            frame
        };

        reassembler.ingest("peer", &frame_a, 0).expect("ingest");
        let err = reassembler.ingest("peer", &frame_b, 1).expect_err("mismatch");
        assert!(matches!(
            err,
            MeshError::TotalMismatch {
                expected: 3,
                got: 4
            }
        ));
    }

    #[test]
    fn stale_buffers_are_swept() {
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        let packet: Vec<u8> = (0..20).collect();
        let frames = fragmenter.fragment(&packet).expect("fragment");

        let mut reassembler = Reassembler::with_timeout(30_000);
        reassembler.ingest("peer", &frames[0], 0).expect("ingest");
        assert_eq!(reassembler.sweep(29_999), 0);
        assert_eq!(reassembler.sweep(30_000), 1);
        assert_eq!(reassembler.stats().packets_timed_out, 1);
        assert_eq!(reassembler.stats().pending_packets, 0);
    }

    #[test]
    fn senders_reassemble_independently() {
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        let packet_a: Vec<u8> = (0..20).collect();
        let packet_b: Vec<u8> = (100..120).collect();
        let frames_a = fragmenter.fragment(&packet_a).expect("fragment");
        let frames_b = fragmenter.fragment(&packet_b).expect("fragment");

        let mut reassembler = Reassembler::new();
        for frame in &frames_a[..frames_a.len() - 1] {
            reassembler.ingest("a", frame, 0).expect("ingest");
        }
        for frame in &frames_b {
            reassembler.ingest("b", frame, 0).expect("ingest");
        }
        let out = reassembler
            .ingest("a", &frames_a[frames_a.len() - 1], 0)
            .expect("ingest")
            .expect("complete");
        assert_eq!(out, packet_a);
        assert_eq!(reassembler.stats().packets_reassembled, 2);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.ingest("peer", &[0x01, 0x00], 0),
            Err(MeshError::FrameTooShort(2))
        ));
        assert!(matches!(
            reassembler.ingest("peer", &[0x09, 0, 0, 0, 1, 0xAA], 0),
            Err(MeshError::UnknownFragmentType(0x09))
        ));
        // seq beyond total.
        assert!(matches!(
            reassembler.ingest("peer", &[0x02, 0, 5, 0, 2, 0xAA], 0),
            Err(MeshError::SequenceOutOfRange { seq: 5, total: 2 })
        ));
    }

    #[test]
    fn empty_packet_and_tiny_mtu_are_errors() {
        assert!(matches!(Fragmenter::new(5), Err(MeshError::MtuTooSmall(5))));
        let fragmenter = Fragmenter::new(10).expect("fragmenter");
        assert!(matches!(
            fragmenter.fragment(&[]),
            Err(MeshError::EmptyPacket)
        ));
    }
}
