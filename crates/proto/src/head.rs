use crate::error::{Error, Result};
use crate::MAX_BODY;

/// The 8-byte frame header preceding every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub code: u32,
    pub length: u32,
}

impl Head {
    pub const ENCODED_LEN: usize = 8;

    pub fn new(code: u32, length: u32) -> Self {
        Self { code, length }
    }

    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::Truncated {
                expected: Self::ENCODED_LEN,
                found: buf.len(),
            });
        }
        let code = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if length > MAX_BODY {
            return Err(Error::TooLarge(length));
        }
        Ok(Self { code, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = Head::new(7, 128);
        assert_eq!(Head::from_bytes(&h.to_bytes()).unwrap(), h);
    }

    #[test]
    fn rejects_oversize_length() {
        let h = Head::new(1, MAX_BODY + 1);
        assert!(matches!(Head::from_bytes(&h.to_bytes()), Err(Error::TooLarge(_))));
    }
}
