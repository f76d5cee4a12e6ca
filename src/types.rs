use num_derive::{FromPrimitive, ToPrimitive};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Not an error, a suspension: the caller retries once more bytes arrive.
    #[error("need more bytes")]
    ShortRead,
    #[error("unknown type marker: {0:#04x}")]
    UnknownMarker(u8),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("malformed data: {0}")]
    Malformed(&'static str),
    #[error("no previous header on channel {0}")]
    MissingChannelState(u32),
}

/// Message type ids carried in chunk headers. The numeric assignments are
/// fixed for interoperability; the Flex variants carry a one-byte encoding
/// tag before their typed-value body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum MessageType {
    SetChunkSize = 1,
    Abort = 2,
    BytesRead = 3,
    UserControl = 4,
    ServerBandwidth = 5,
    ClientBandwidth = 6,
    AudioPacket = 8,
    VideoPacket = 9,
    FlexData = 15,
    FlexSharedObject = 16,
    Invoke = 17,
    Data = 18,
    SharedObject = 19,
    FlexInvoke = 20,
    Aggregate = 22,
}

/// Sub-types of the UserControl message (2-byte id, 4-byte parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u16)]
#[non_exhaustive]
pub enum UserControlType {
    ClearStream = 0,
    ClearBuffer = 1,
    ClientBufferTime = 3,
    ResetStream = 4,
    Ping = 6,
    Pong = 7,
}

/// Frame type in the upper nibble of a video payload's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum VideoFrameType {
    None = 0,
    Key = 1,
    Inter = 2,
    Disposable = 3,
    GeneratedKey = 4,
    VideoInfo = 5,
}

impl VideoFrameType {
    pub fn of(data: &[u8]) -> Self {
        use num_traits::FromPrimitive;
        data.first()
            .and_then(|byte| Self::from_u8((byte & 0xf0) >> 4))
            .unwrap_or(VideoFrameType::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum AudioCodec {
    Adpcm = 1,
    Mp3 = 2,
    LinearLe = 3,
    Nelly16 = 4,
    Nelly8 = 5,
    Nelly = 6,
    G711A = 7,
    G711U = 8,
    Aac = 10,
    Speex = 11,
    Mp38 = 14,
    DeviceSpecific = 15,
    Uncompressed = 16,
}

impl AudioCodec {
    pub fn name(self) -> &'static str {
        match self {
            AudioCodec::Adpcm => "ADPCM",
            AudioCodec::Mp3 => "MP3",
            AudioCodec::LinearLe => "LinearLE",
            AudioCodec::Nelly16 => "Nellymoser16",
            AudioCodec::Nelly8 => "Nellymoser8",
            AudioCodec::Nelly => "Nellymoser",
            AudioCodec::G711A => "G711A",
            AudioCodec::G711U => "G711U",
            AudioCodec::Aac => "AAC",
            AudioCodec::Speex => "Speex",
            AudioCodec::Mp38 => "MP3-8kHz",
            AudioCodec::DeviceSpecific => "DeviceSpecific",
            AudioCodec::Uncompressed => "Uncompressed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum VideoCodec {
    Jpeg = 1,
    SorensonH263 = 2,
    Screen = 3,
    On2Vp6 = 4,
    On2Vp6Alpha = 5,
    Screen2 = 6,
    H264 = 7,
}

impl VideoCodec {
    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::Jpeg => "JPEG",
            VideoCodec::SorensonH263 => "Sorenson H.263",
            VideoCodec::Screen => "Screen",
            VideoCodec::On2Vp6 => "On2 VP6",
            VideoCodec::On2Vp6Alpha => "On2 VP6 with alpha",
            VideoCodec::Screen2 => "Screen V2",
            VideoCodec::H264 => "H.264",
        }
    }
}

/// A codec header is a media payload whose second byte is zero; it carries
/// decoder configuration and must precede any payload frame.
pub fn is_codec_header(data: &[u8]) -> bool {
    data.len() >= 2 && data[1] == 0
}
