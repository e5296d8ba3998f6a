//! Fixed-size packetiser standing in for the image codec

use crate::imaging::{CodecErrorCode, CodecParams, CodecStep, ImageCodec};

pub const CHUNK_SYNC: u8 = 0x55;
pub const CHUNK_HEADER_SIZE: usize = 7;

const FLAG_LAST: u8 = 0x01;
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Splits the image into packets of `sync, type, image id, packet id
/// (big endian), quality, flags` followed by raw image bytes, zero padded.
/// Encoding completes once the JPEG end marker has been fed and every byte
/// before it has been emitted.
#[derive(Debug, Default)]
pub struct ChunkCodec {
    params: Option<CodecParams>,
    pending: Vec<u8>,
    last_fed: Option<u8>,
    seen_end: bool,
    next_packet: u16,
    done: bool,
    fail_after: Option<u16>,
}

impl ChunkCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a codec error instead of the packet after `packets` packets.
    pub fn failing_after(packets: u16) -> Self {
        Self {
            fail_after: Some(packets),
            ..Self::default()
        }
    }

    pub const ERROR_CODE: CodecErrorCode = -3;

    fn payload_size(&self) -> usize {
        self.params
            .as_ref()
            .map_or(0, |params| params.packet_size.saturating_sub(CHUNK_HEADER_SIZE))
    }

    fn emit(&mut self, out: &mut [u8], last: bool) -> CodecStep {
        let Some(params) = self.params.as_ref() else {
            return CodecStep::Error(Self::ERROR_CODE);
        };
        let payload = self.payload_size().min(out.len().saturating_sub(CHUNK_HEADER_SIZE));
        let take = payload.min(self.pending.len());

        out.fill(0);
        out[0] = CHUNK_SYNC;
        out[1] = params.packet_type.code();
        out[2] = params.image_id;
        out[3..5].copy_from_slice(&self.next_packet.to_be_bytes());
        out[5] = params.quality;
        out[6] = if last { FLAG_LAST } else { 0 };
        out[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);

        self.next_packet = self.next_packet.wrapping_add(1);
        if last {
            self.done = true;
        }
        CodecStep::PacketReady
    }
}

impl ImageCodec for ChunkCodec {
    fn init(&mut self, params: &CodecParams) {
        self.params = Some(params.clone());
        self.pending.clear();
        self.last_fed = None;
        self.seen_end = false;
        self.next_packet = 0;
        self.done = false;
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.seen_end {
                break;
            }
            self.pending.push(byte);
            if self.last_fed == Some(JPEG_EOI[0]) && byte == JPEG_EOI[1] {
                self.seen_end = true;
            }
            self.last_fed = Some(byte);
        }
    }

    fn next(&mut self, out: &mut [u8]) -> CodecStep {
        if self.done {
            return CodecStep::Done;
        }
        if self.fail_after == Some(self.next_packet) {
            return CodecStep::Error(Self::ERROR_CODE);
        }
        if out.len() <= CHUNK_HEADER_SIZE || self.params.is_none() {
            return CodecStep::Error(Self::ERROR_CODE);
        }

        let payload = self.payload_size();
        if self.pending.len() > payload {
            self.emit(out, false)
        } else if self.seen_end {
            self.emit(out, true)
        } else {
            // Even a full payload may still be followed by the end marker.
            CodecStep::NeedMoreInput
        }
    }
}
