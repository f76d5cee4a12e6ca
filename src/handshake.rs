use rand::Rng;

/// Protocol version byte opening every connection.
pub const PROTOCOL_VERSION: u8 = 0x03;

/// Fixed vendor identifier carried in the challenge's version field.
pub const SERVER_VERSION: [u8; 4] = [9, 0, 124, 2];

pub const RANDOM_BYTES: usize = 1528;
/// Size of a challenge or ack exchange: time, version, random bytes.
pub const EXCHANGE_SIZE: usize = 4 + 4 + RANDOM_BYTES;

/// One 1536-byte handshake exchange. A challenge carries our version and
/// fresh random bytes; an ack echoes the peer's challenge.
pub struct Exchange {
    pub time: u32,
    pub version: [u8; 4],
    pub random_bytes: [u8; RANDOM_BYTES],
}

impl Exchange {
    /// Builds a challenge with zero time, the fixed vendor version, and
    /// uniform random filler from the process-wide generator.
    pub fn challenge() -> Self {
        let mut random_bytes = [0u8; RANDOM_BYTES];
        rand::thread_rng().fill(&mut random_bytes[..]);
        Self {
            time: 0,
            version: SERVER_VERSION,
            random_bytes,
        }
    }

    /// Builds the ack for a received challenge: every field echoed.
    pub fn ack(challenge: &Exchange) -> Self {
        Self {
            time: challenge.time,
            version: challenge.version,
            random_bytes: challenge.random_bytes,
        }
    }

    pub fn decode(buffer: &[u8]) -> Option<Self> {
        let bytes = buffer.get(..EXCHANGE_SIZE)?;
        let mut random_bytes = [0u8; RANDOM_BYTES];
        random_bytes.copy_from_slice(&bytes[8..]);
        Some(Self {
            time: u32::from_be_bytes(bytes[0..4].try_into().expect("length checked")),
            version: bytes[4..8].try_into().expect("length checked"),
            random_bytes,
        })
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.extend(self.time.to_be_bytes());
        buffer.extend(self.version);
        buffer.extend(self.random_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_is_1536_bytes() {
        let mut buffer = Vec::new();
        Exchange::challenge().encode(&mut buffer);
        assert_eq!(buffer.len(), EXCHANGE_SIZE);
        assert_eq!(EXCHANGE_SIZE, 1536);
    }

    #[test]
    fn ack_echoes_challenge() {
        let mut challenge = Exchange::challenge();
        challenge.time = 0x01020304;
        let ack = Exchange::ack(&challenge);

        let mut wire = Vec::new();
        ack.encode(&mut wire);
        assert_eq!(&wire[0..4], &[1, 2, 3, 4]);
        assert_eq!(&wire[4..8], &challenge.version);
        assert_eq!(&wire[8..], &challenge.random_bytes[..]);
    }

    #[test]
    fn decode_requires_full_exchange() {
        assert!(Exchange::decode(&[0u8; EXCHANGE_SIZE - 1]).is_none());
        assert!(Exchange::decode(&[0u8; EXCHANGE_SIZE]).is_some());
    }
}
