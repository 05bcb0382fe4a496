//! Streaming compression codec selected by an object's flags.
//!
//! The codec is deliberately opaque at the level the rest of the crate
//! interacts with it: callers pick a [`Codec`] variant, encode, and record
//! the resulting stored size alongside the payload size. Which concrete
//! compression algorithm backs `General` is not part of the on-disk
//! contract beyond "zstd, default level".

use std::io::Read;
use std::io::Write as _;

use crate::error::OriError;
use crate::error::OriResult;

/// Bit within `ObjectInfo.flags` selecting the compression mode.
pub const FLAG_COMPRESSED: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    General,
}

impl Codec {
    pub fn from_flags(flags: u32) -> Self {
        if flags & FLAG_COMPRESSED != 0 {
            Self::General
        } else {
            Self::None
        }
    }

    pub fn flag_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::General => FLAG_COMPRESSED,
        }
    }

    /// Encodes `payload`, returning the stored bytes.
    pub fn encode(self, payload: &[u8]) -> OriResult<Vec<u8>> {
        match self {
            Self::None => Ok(payload.to_vec()),
            Self::General => {
                let mut encoder = zstd::Encoder::new(Vec::new(), 0)
                    .map_err(|e| OriError::corruption(format!("zstd encoder init: {e}")))?;
                encoder
                    .write_all(payload)
                    .map_err(|e| OriError::corruption(format!("zstd encode: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| OriError::corruption(format!("zstd finish: {e}")))
            }
        }
    }

    /// Decodes `stored` back into the original payload bytes.
    pub fn decode(self, stored: &[u8]) -> OriResult<Vec<u8>> {
        match self {
            Self::None => Ok(stored.to_vec()),
            Self::General => {
                let mut decoder = zstd::Decoder::new(stored)
                    .map_err(|e| OriError::corruption(format!("zstd decoder init: {e}")))?;
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| OriError::corruption(format!("zstd decode: {e}")))?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips_verbatim() {
        let data = b"hello world";
        let stored = Codec::None.encode(data).unwrap();
        assert_eq!(stored, data);
        assert_eq!(Codec::None.decode(&stored).unwrap(), data);
    }

    #[test]
    fn general_round_trips() {
        let data = b"hello world hello world hello world".repeat(64);
        let stored = Codec::General.encode(&data).unwrap();
        assert_eq!(Codec::General.decode(&stored).unwrap(), data);
    }

    #[test]
    fn flags_round_trip() {
        assert_eq!(Codec::from_flags(Codec::None.flag_bits()), Codec::None);
        assert_eq!(Codec::from_flags(Codec::General.flag_bits()), Codec::General);
    }
}
