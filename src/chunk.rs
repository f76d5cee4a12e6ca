use crate::{
    types::DecodeError,
    wire::{decode_int_be, decode_int_le, encode_int_be, encode_int_le},
};
use bytes::{Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::collections::HashMap;

pub const DEFAULT_CHUNK_SIZE: u32 = 128;
pub const DEFAULT_SERVER_BANDWIDTH: u32 = 2_500_000;

/// Logical channels multiplexed inside one connection. Control and media
/// traffic are interleaved on separate channels.
pub mod channel {
    pub const NETWORK: u32 = 2;
    pub const SYSTEM: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const VIDEO: u32 = 5;
    pub const SOURCE: u32 = 6;
}

/// Timestamp slot value signalling that a 4-byte extended timestamp follows.
const EXTENDED_TIMESTAMP: u32 = 0x00ff_ffff;

/// The two high bits of a chunk's first byte select one of four header
/// forms, each encoding a diminishing subset of the full header relative to
/// the previous header on the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
enum HeaderForm {
    TwelveByte = 0,
    EightByte = 1,
    FourByte = 2,
    OneByte = 3,
}

/// A fully populated chunk header; compressed forms are expanded against the
/// per-channel cache before one of these is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub channel: u32,
    pub timestamp: u32,
    pub length: u32,
    pub message_type: u8,
    /// The only little-endian field in the protocol.
    pub message_stream_id: u32,
}

/// A fully assembled message, ephemeral between decode and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: u32,
    pub message_stream_id: u32,
    pub timestamp: u32,
    pub message_type: u8,
    pub data: Bytes,
}

impl Packet {
    pub fn new(channel: u32, message_type: crate::types::MessageType) -> Self {
        Self {
            channel,
            message_stream_id: 0,
            timestamp: 0,
            message_type: message_type as u8,
            data: Bytes::new(),
        }
    }
}

/// Reads the 1–3 byte basic header: form bits plus the channel, whose
/// values 0 and 1 extend the 6-bit field by one or two bytes.
fn decode_basic_header(buffer: &[u8], offset: usize) -> Result<(HeaderForm, u32, usize), DecodeError> {
    let first = *buffer.get(offset).ok_or(DecodeError::ShortRead)?;
    let form = HeaderForm::from_u8(first >> 6).expect("two bits cover all forms");
    let mut read = 1;

    let channel = match u32::from(first & 0x3f) {
        0 => {
            let byte = decode_int_be(buffer, offset + read, 1)?;
            read += 1;
            byte as u32 + 64
        }
        1 => {
            let bytes = decode_int_le(buffer, offset + read, 2)?;
            read += 2;
            bytes as u32 + 64
        }
        value => value,
    };

    Ok((form, channel, read))
}

/// Reads one chunk header at `offset`, merging with the previous header on
/// the same channel. Returns the expanded header and bytes consumed.
fn decode_header(
    buffer: &[u8],
    offset: usize,
    previous: &HashMap<u32, Header>,
) -> Result<(Header, HeaderForm, usize), DecodeError> {
    let (form, channel, mut read) = decode_basic_header(buffer, offset)?;

    let mut header = match previous.get(&channel) {
        Some(header) => *header,
        None if form == HeaderForm::TwelveByte => Header::default(),
        None => return Err(DecodeError::MissingChannelState(channel)),
    };
    header.channel = channel;

    if form != HeaderForm::OneByte {
        let mut timestamp = decode_int_be(buffer, offset + read, 3)? as u32;
        read += 3;

        if form != HeaderForm::FourByte {
            header.length = decode_int_be(buffer, offset + read, 3)? as u32;
            read += 3;
            header.message_type = decode_int_be(buffer, offset + read, 1)? as u8;
            read += 1;

            if form != HeaderForm::EightByte {
                header.message_stream_id = decode_int_le(buffer, offset + read, 4)? as u32;
                read += 4;
            }
        }

        if timestamp == EXTENDED_TIMESTAMP {
            timestamp = decode_int_be(buffer, offset + read, 4)? as u32;
            read += 4;
        }
        header.timestamp = timestamp;
    }

    Ok((header, form, read))
}

fn encode_header(buffer: &mut Vec<u8>, form: HeaderForm, header: &Header) {
    let (channel_bits, extension) = match header.channel {
        channel if channel < 64 => (channel as u8, None),
        channel if channel < 64 + 256 => (0, Some((channel - 64, 1usize))),
        channel => (1, Some((channel - 64, 2usize))),
    };

    buffer.push(((form as u8) << 6) | channel_bits);
    if let Some((value, size)) = extension {
        if size == 1 {
            encode_int_be(buffer, 1, u64::from(value));
        } else {
            encode_int_le(buffer, 2, u64::from(value));
        }
    }

    if form != HeaderForm::OneByte {
        let extended = header.timestamp >= EXTENDED_TIMESTAMP;
        let slot = if extended { EXTENDED_TIMESTAMP } else { header.timestamp };
        encode_int_be(buffer, 3, u64::from(slot));

        if form != HeaderForm::FourByte {
            encode_int_be(buffer, 3, u64::from(header.length));
            encode_int_be(buffer, 1, u64::from(header.message_type));

            if form != HeaderForm::EightByte {
                encode_int_le(buffer, 4, u64::from(header.message_stream_id));
            }
        }

        if extended {
            encode_int_be(buffer, 4, u64::from(header.timestamp));
        }
    }
}

/// Decodes one whole message starting at `offset`, following 1-byte
/// continuation headers across chunk boundaries. Returns the packet and the
/// total bytes consumed; a `ShortRead` leaves the caller's offset unchanged
/// so the connection retries once more bytes arrive.
pub fn decode_packet(
    buffer: &[u8],
    offset: usize,
    chunk_size: u32,
    received: &mut HashMap<u32, Header>,
) -> Result<(Packet, usize), DecodeError> {
    let (header, _, mut read) = decode_header(buffer, offset, received)?;
    let mut data = BytesMut::with_capacity(header.length as usize);
    let mut remaining = header.length as usize;

    loop {
        let take = remaining.min(chunk_size as usize);
        let chunk = buffer
            .get(offset + read..offset + read + take)
            .ok_or(DecodeError::ShortRead)?;
        data.extend_from_slice(chunk);
        read += take;
        remaining -= take;

        if remaining == 0 {
            break;
        }

        // A message spanning multiple chunks continues with a 1-byte header
        // on the same channel before each new chunk.
        let (form, continuation_channel, continuation_read) =
            decode_basic_header(buffer, offset + read)?;
        if form != HeaderForm::OneByte || continuation_channel != header.channel {
            return Err(DecodeError::Malformed("interleaved chunk inside a message"));
        }
        read += continuation_read;
    }

    received.insert(header.channel, header);

    Ok((
        Packet {
            channel: header.channel,
            message_stream_id: header.message_stream_id,
            timestamp: header.timestamp,
            message_type: header.message_type,
            data: data.freeze(),
        },
        read,
    ))
}

/// Encodes a packet as a full 12-byte header followed by 1-byte continuation
/// headers every `chunk_size` payload bytes. Returns bytes appended.
pub fn encode_packet(
    buffer: &mut Vec<u8>,
    chunk_size: u32,
    packet: &Packet,
    sent: &mut HashMap<u32, Header>,
) -> usize {
    let start = buffer.len();
    let header = Header {
        channel: packet.channel,
        timestamp: packet.timestamp,
        length: packet.data.len() as u32,
        message_type: packet.message_type,
        message_stream_id: packet.message_stream_id,
    };

    let chunk_size = chunk_size as usize;
    let chunks = (packet.data.len() + chunk_size - 1) / chunk_size;

    for i in 0..chunks.max(1) {
        if i == 0 {
            encode_header(buffer, HeaderForm::TwelveByte, &header);
        } else {
            encode_header(buffer, HeaderForm::OneByte, &header);
        }

        let chunk_start = i * chunk_size;
        let chunk_end = (chunk_start + chunk_size).min(packet.data.len());
        buffer.extend_from_slice(&packet.data[chunk_start..chunk_end]);
    }

    sent.insert(header.channel, header);

    buffer.len() - start
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(channel: u32, length: usize) -> Packet {
        Packet {
            channel,
            message_stream_id: 1,
            timestamp: 40,
            message_type: 8,
            data: (0..length).map(|i| i as u8).collect::<Vec<_>>().into(),
        }
    }

    #[test]
    fn round_trip_across_chunk_sizes() {
        for chunk_size in [128u32, 256, 4096, 65536] {
            for length in [0usize, 1, 127, 128, 129, 5000] {
                let original = packet(channel::AUDIO, length);
                let mut wire = Vec::new();
                let mut sent = HashMap::new();
                encode_packet(&mut wire, chunk_size, &original, &mut sent);

                let mut received = HashMap::new();
                let (decoded, read) =
                    decode_packet(&wire, 0, chunk_size, &mut received).unwrap();
                assert_eq!(read, wire.len());
                assert_eq!(decoded, original, "chunk size {} length {}", chunk_size, length);
            }
        }
    }

    #[test]
    fn five_thousand_bytes_at_chunk_size_4096() {
        // One full chunk, a 1-byte continuation header, then 904 bytes.
        let original = packet(channel::AUDIO, 5000);
        let mut wire = Vec::new();
        encode_packet(&mut wire, 4096, &original, &mut HashMap::new());
        assert_eq!(wire.len(), 12 + 4096 + 1 + 904);
        assert_eq!(wire[12 + 4096], 0xc0 | channel::AUDIO as u8);

        let (decoded, _) = decode_packet(&wire, 0, 4096, &mut HashMap::new()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn short_read_reports_suspension() {
        let original = packet(channel::VIDEO, 300);
        let mut wire = Vec::new();
        encode_packet(&mut wire, 128, &original, &mut HashMap::new());

        let mut received = HashMap::new();
        for len in 0..wire.len() {
            assert_eq!(
                decode_packet(&wire[..len], 0, 128, &mut received),
                Err(DecodeError::ShortRead),
                "prefix of {} bytes",
                len
            );
            assert!(received.is_empty(), "cache must not commit on failure");
        }
    }

    #[test]
    fn compressed_header_without_state_is_an_error() {
        // An 8-byte form on a channel never seen before.
        let wire = [0x43, 0, 0, 1, 0, 0, 2, 17, 0, 0];
        assert_eq!(
            decode_packet(&wire, 0, 128, &mut HashMap::new()),
            Err(DecodeError::MissingChannelState(3))
        );

        let one_byte = [0xc3];
        assert_eq!(
            decode_packet(&one_byte, 0, 128, &mut HashMap::new()),
            Err(DecodeError::MissingChannelState(3))
        );
    }

    #[test]
    fn compressed_headers_inherit_from_cache() {
        let mut received = HashMap::new();
        received.insert(
            3,
            Header {
                channel: 3,
                timestamp: 100,
                length: 2,
                message_type: 17,
                message_stream_id: 7,
            },
        );

        // 4-byte form: new timestamp, everything else inherited.
        let wire = [0x83, 0, 0, 200, 0xaa, 0xbb];
        let (decoded, read) = decode_packet(&wire, 0, 128, &mut received).unwrap();
        assert_eq!(read, wire.len());
        assert_eq!(decoded.timestamp, 200);
        assert_eq!(decoded.message_type, 17);
        assert_eq!(decoded.message_stream_id, 7);
        assert_eq!(&decoded.data[..], &[0xaa, 0xbb]);
    }

    #[test]
    fn extended_channel_round_trip() {
        for channel in [64u32, 319, 320, 1000] {
            let original = packet(channel, 10);
            let mut wire = Vec::new();
            encode_packet(&mut wire, 128, &original, &mut HashMap::new());
            let (decoded, _) = decode_packet(&wire, 0, 128, &mut HashMap::new()).unwrap();
            assert_eq!(decoded, original, "channel {}", channel);
        }
    }

    #[test]
    fn extended_timestamp_round_trip() {
        let mut original = packet(channel::VIDEO, 8);
        original.timestamp = 0x0100_0000;
        let mut wire = Vec::new();
        encode_packet(&mut wire, 128, &original, &mut HashMap::new());
        // The 3-byte slot holds the sentinel.
        assert_eq!(&wire[1..4], &[0xff, 0xff, 0xff]);
        let (decoded, _) = decode_packet(&wire, 0, 128, &mut HashMap::new()).unwrap();
        assert_eq!(decoded, original);
    }
}
