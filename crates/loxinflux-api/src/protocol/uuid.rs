// ── Miniserver 128-bit identifiers ──
//
// On the wire a UUID is four little-endian fields (u32, u16, u16, [u8; 8]).
// The textual form used in the structure file is
// `xxxxxxxx-xxxx-xxxx-xxxxxxxxxxxxxxxx`; the last group is 16 hex digits,
// not the RFC 4122 4-12 split.

use std::fmt;
use std::str::FromStr;

pub const UUID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoxUuid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl LoxUuid {
    /// Decode from the 16-byte wire representation.
    pub fn from_wire(bytes: &[u8; UUID_LEN]) -> Self {
        let [a0, a1, a2, a3, b0, b1, c0, c1, d @ ..] = *bytes;
        Self {
            data1: u32::from_le_bytes([a0, a1, a2, a3]),
            data2: u16::from_le_bytes([b0, b1]),
            data3: u16::from_le_bytes([c0, c1]),
            data4: d,
        }
    }

    /// Encode to the 16-byte wire representation.
    pub fn to_wire(&self) -> [u8; UUID_LEN] {
        let mut out = [0u8; UUID_LEN];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl fmt::Display for LoxUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{:04x}-{:04x}-", self.data1, self.data2, self.data3)?;
        for b in self.data4 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Miniserver uuid: {0}")]
pub struct ParseUuidError(String);

impl FromStr for LoxUuid {
    type Err = ParseUuidError;

    /// Accepts the native 8-4-4-16 form and the RFC 8-4-4-4-12 form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseUuidError(s.to_owned());
        let parts: Vec<&str> = s.split('-').collect();
        let (p1, p2, p3, tail) = match parts.as_slice() {
            [a, b, c, d] => (*a, *b, *c, (*d).to_owned()),
            [a, b, c, d, e] => (*a, *b, *c, format!("{d}{e}")),
            _ => return Err(err()),
        };
        if p1.len() != 8 || p2.len() != 4 || p3.len() != 4 || tail.len() != 16 {
            return Err(err());
        }
        let data1 = u32::from_str_radix(p1, 16).map_err(|_| err())?;
        let data2 = u16::from_str_radix(p2, 16).map_err(|_| err())?;
        let data3 = u16::from_str_radix(p3, 16).map_err(|_| err())?;
        let mut data4 = [0u8; 8];
        hex::decode_to_slice(&tail, &mut data4).map_err(|_| err())?;
        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}
