//! Packet framing boundary
//!
//! The manager never interprets payload bytes; it hands the input buffer to
//! a `Codec` and dispatches whatever complete packets come back. Outbound
//! packets are encoded into the connection's output buffer.
//!
//! Decoding walks the buffer with `decode_from` and a read offset; the
//! caller compacts the consumed prefix once per pass, so pipelined small
//! frames cost linear time.

use crate::error::CodecError;

/// One framed unit of application data.
pub type Packet = Vec<u8>;

pub trait Codec: Send + Sync {
    /// Append the wire form of `packet` to `out`.
    fn encode(&self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Parse one complete packet at the start of `input` without consuming
    /// it. Returns the packet and how many bytes it occupied, or `Ok(None)`
    /// when more bytes are needed.
    fn decode_from(&self, input: &[u8]) -> Result<Option<(Packet, usize)>, CodecError>;

    /// Remove one complete packet from the front of `input`.
    ///
    /// `Ok(None)` means more bytes are needed; `input` is left untouched.
    fn decode(&self, input: &mut Vec<u8>) -> Result<Option<Packet>, CodecError> {
        match self.decode_from(input)? {
            Some((packet, used)) => {
                input.drain(..used);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Decode every complete packet in `input`, then drop the consumed
    /// prefix in one move. A framing error leaves `input` untouched.
    fn decode_all(&self, input: &mut Vec<u8>) -> Result<Vec<Packet>, CodecError> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < input.len() {
            match self.decode_from(&input[offset..])? {
                Some((packet, used)) if used > 0 => {
                    packets.push(packet);
                    offset += used;
                }
                _ => break,
            }
        }
        input.drain(..offset);
        Ok(packets)
    }
}

/// Pass-through: every read chunk is one packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn encode(&self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(packet);
        Ok(())
    }

    fn decode_from(&self, input: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
        if input.is_empty() {
            return Ok(None);
        }
        Ok(Some((input.to_vec(), input.len())))
    }

    fn decode(&self, input: &mut Vec<u8>) -> Result<Option<Packet>, CodecError> {
        if input.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(input)))
    }

    fn decode_all(&self, input: &mut Vec<u8>) -> Result<Vec<Packet>, CodecError> {
        Ok(self.decode(input)?.into_iter().collect())
    }
}

/// Big-endian `u32` length prefix followed by the payload.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_frame: usize,
}

impl LengthPrefixedCodec {
    pub const HEADER_LEN: usize = 4;
    pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_FRAME)
    }
}

impl Codec for LengthPrefixedCodec {
    fn encode(&self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        if packet.len() > self.max_frame || packet.len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge { len: packet.len(), max: self.max_frame });
        }
        out.reserve(Self::HEADER_LEN + packet.len());
        out.extend_from_slice(&(packet.len() as u32).to_be_bytes());
        out.extend_from_slice(packet);
        Ok(())
    }

    fn decode_from(&self, input: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
        let Some(header) = input.get(..Self::HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge { len, max: self.max_frame });
        }
        let total = Self::HEADER_LEN + len;
        match input.get(Self::HEADER_LEN..total) {
            Some(payload) => Ok(Some((payload.to_vec(), total))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codec_takes_everything() {
        let c = RawCodec;
        let mut buf = b"hello".to_vec();
        assert_eq!(c.decode(&mut buf).unwrap(), Some(b"hello".to_vec()));
        assert!(buf.is_empty());
        assert_eq!(c.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_length_prefixed_partial_and_pipelined() {
        let c = LengthPrefixedCodec::new(64);
        let mut wire = Vec::new();
        c.encode(b"ab", &mut wire).unwrap();
        c.encode(b"xyz", &mut wire).unwrap();

        // Split mid-header of the second frame
        let mut input = wire[..7].to_vec();
        assert_eq!(c.decode(&mut input).unwrap(), Some(b"ab".to_vec()));
        assert_eq!(c.decode(&mut input).unwrap(), None);
        assert_eq!(input.len(), 1);

        input.extend_from_slice(&wire[7..]);
        assert_eq!(c.decode(&mut input).unwrap(), Some(b"xyz".to_vec()));
        assert!(input.is_empty());
    }

    #[test]
    fn test_decode_all_compacts_once() {
        let c = LengthPrefixedCodec::new(64);
        let mut input = Vec::new();
        for i in 0..1000u32 {
            c.encode(&i.to_be_bytes()[3..], &mut input).unwrap();
        }
        // Trailing partial header stays for the next pass
        input.extend_from_slice(&[0, 0]);

        let packets = c.decode_all(&mut input).unwrap();
        assert_eq!(packets.len(), 1000);
        assert_eq!(packets[999], vec![(999u32 & 0xff) as u8]);
        assert_eq!(input, vec![0, 0]);

        let mut bad = vec![0, 0, 0, 1, 7, 0, 0, 1, 0];
        let big = LengthPrefixedCodec::new(8);
        assert!(matches!(big.decode_all(&mut bad), Err(CodecError::FrameTooLarge { .. })));
        assert_eq!(bad.len(), 9);
    }

    #[test]
    fn test_decode_all_pipelined_is_linear() {
        // 256 KiB of 5-byte frames: quadratic compaction would move ~6 GiB
        let c = LengthPrefixedCodec::default();
        let mut input = Vec::with_capacity(256 * 1024);
        while input.len() + 5 <= 256 * 1024 {
            c.encode(b"x", &mut input).unwrap();
        }
        let frames = input.len() / 5;
        let started = std::time::Instant::now();
        let packets = c.decode_all(&mut input).unwrap();
        assert_eq!(packets.len(), frames);
        assert!(input.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_raw_decode_all() {
        let mut buf = b"chunk".to_vec();
        assert_eq!(RawCodec.decode_all(&mut buf).unwrap(), vec![b"chunk".to_vec()]);
        assert!(buf.is_empty());
        assert!(RawCodec.decode_all(&mut buf).unwrap().is_empty());
    }

    #[test]
    fn test_length_prefixed_rejects_oversize() {
        let c = LengthPrefixedCodec::new(4);
        let mut input = vec![0, 0, 0, 10, 1, 2];
        assert_eq!(
            c.decode(&mut input),
            Err(CodecError::FrameTooLarge { len: 10, max: 4 })
        );
        let mut out = Vec::new();
        assert!(c.encode(b"too long", &mut out).is_err());
        assert!(out.is_empty());
    }
}
