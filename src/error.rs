use std::fmt;

/// Top-level error type for the synthesizer.
#[derive(Debug)]
pub enum EgsError {
    Decode(DecodeError),
    BusLimit { limit: usize },
    UnknownBus { id: u64 },
}

/// Errors raised while decoding EGS binary data (channel headers,
/// envelopes, waves, pipe ops, or the song container).
///
/// Decode errors always fail the enclosing `configure`/`decode` call;
/// nothing reachable from the render path produces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEnd { at: usize },
    BadMagic,
    BadChannelCount { count: u8 },
    BadChannelId { chid: u8 },
    DuplicateChannel { chid: u8 },
    BadEnvelopeFlags { flags: u8 },
    BadPointCount { count: u8 },
    BadSustainIndex { index: u8, count: u8 },
    BadWaveShape { shape: u8 },
    UnknownCriticalTag { tag: u8 },
    DuplicateTag { tag: u8 },
    MissingLevelEnvelope { chid: u8 },
    UnknownPipeOp { opcode: u8 },
    BadTransferCurve { count: u8 },
}

impl fmt::Display for EgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgsError::Decode(e) => write!(f, "Decode error: {e}"),
            EgsError::BusLimit { limit } => write!(f, "Bus limit reached ({limit} live buses)"),
            EgsError::UnknownBus { id } => write!(f, "Unknown bus id {id}"),
        }
    }
}

impl std::error::Error for EgsError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd { at } => write!(f, "Unexpected end of data at byte {at}"),
            DecodeError::BadMagic => write!(f, "Missing EGS magic"),
            DecodeError::BadChannelCount { count } => write!(f, "Bad channel count {count}"),
            DecodeError::BadChannelId { chid } => write!(f, "Channel id {chid} out of range"),
            DecodeError::DuplicateChannel { chid } => write!(f, "Duplicate channel id {chid}"),
            DecodeError::BadEnvelopeFlags { flags } => {
                write!(f, "Unknown envelope flag bits in {flags:#04x}")
            }
            DecodeError::BadPointCount { count } => write!(f, "Bad envelope point count {count}"),
            DecodeError::BadSustainIndex { index, count } => {
                write!(f, "Sustain index {index} outside {count} points")
            }
            DecodeError::BadWaveShape { shape } => write!(f, "Unknown wave shape {shape}"),
            DecodeError::UnknownCriticalTag { tag } => {
                write!(f, "Unknown critical field tag {tag:#04x}")
            }
            DecodeError::DuplicateTag { tag } => write!(f, "Duplicate field tag {tag:#04x}"),
            DecodeError::MissingLevelEnvelope { chid } => {
                write!(f, "Channel {chid} requires a level envelope")
            }
            DecodeError::UnknownPipeOp { opcode } => write!(f, "Unknown pipe opcode {opcode:#04x}"),
            DecodeError::BadTransferCurve { count } => {
                write!(f, "Waveshaper curve needs at least 2 points, got {count}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for EgsError {
    fn from(e: DecodeError) -> Self {
        EgsError::Decode(e)
    }
}
