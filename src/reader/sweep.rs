use bincode::{Decode, Encode};

use super::{DecodeError, wire_config};

/// One archive member (typically one moment, e.g. `Z`) of a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SweepMember {
    pub symbol: String,
    pub name: String,
    pub data: Vec<u8>,
}

/// Payload produced by [`FileDecoder`](super::FileDecoder).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Sweep {
    pub path: String,
    pub members: Vec<SweepMember>,
}

impl Sweep {
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (sweep, _) = bincode::decode_from_slice(bytes, wire_config())?;
        Ok(sweep)
    }

    /// Total size of all member data.
    pub fn data_len(&self) -> usize {
        self.members.iter().map(|m| m.data.len()).sum()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.symbol.as_str()).collect()
    }
}
