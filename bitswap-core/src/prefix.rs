//! CID prefix encoding used by the 1.1.0+ wire payload: a varint-encoded
//! (version, codec, hash-code, hash-length) tuple that lets a decoder
//! reconstruct a CID from raw block bytes without shipping the full CID.

use cid::Cid;
use multihash::{Code, MultihashDigest};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub version: cid::Version,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: usize,
}

#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("invalid cid version: {0}")]
    InvalidVersion(u64),
    #[error("unsupported multihash code: {0}")]
    UnsupportedHash(u64),
    #[error("truncated prefix")]
    Truncated,
    #[error("failed to assemble cid: {0}")]
    Cid(#[from] cid::Error),
}

impl Prefix {
    pub fn new(version: cid::Version, codec: u64, mh_type: u64, mh_len: usize) -> Self {
        Prefix {
            version,
            codec,
            mh_type,
            mh_len,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 * 10);
        let mut tmp = [0u8; 10];
        buf.extend_from_slice(unsigned_varint::encode::u64(self.version as u64, &mut tmp));
        buf.extend_from_slice(unsigned_varint::encode::u64(self.codec, &mut tmp));
        buf.extend_from_slice(unsigned_varint::encode::u64(self.mh_type, &mut tmp));
        buf.extend_from_slice(unsigned_varint::encode::u64(self.mh_len as u64, &mut tmp));
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PrefixError> {
        let (version, rest) = unsigned_varint::decode::u64(data).map_err(|_| PrefixError::Truncated)?;
        let version = cid::Version::try_from(version).map_err(|_| PrefixError::InvalidVersion(version))?;
        let (codec, rest) = unsigned_varint::decode::u64(rest).map_err(|_| PrefixError::Truncated)?;
        let (mh_type, rest) = unsigned_varint::decode::u64(rest).map_err(|_| PrefixError::Truncated)?;
        let (mh_len, _rest) = unsigned_varint::decode::u64(rest).map_err(|_| PrefixError::Truncated)?;

        Ok(Prefix {
            version,
            codec,
            mh_type,
            mh_len: mh_len as usize,
        })
    }

    /// Hashes `data` under this prefix's declared hash function and assembles the CID.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, PrefixError> {
        let code = Code::try_from(self.mh_type).map_err(|_| PrefixError::UnsupportedHash(self.mh_type))?;
        let hash = code.digest(data);
        Ok(Cid::new(self.version, self.codec, hash)?)
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Prefix {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().size() as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash::MultihashDigest;

    #[test]
    fn roundtrip_v1_raw_sha256() {
        let data = b"hello world";
        let hash = Code::Sha2_256.digest(data);
        let cid = Cid::new_v1(0x55, hash);
        let prefix = Prefix::from(&cid);
        let bytes = prefix.to_bytes();
        let decoded = Prefix::from_bytes(&bytes).unwrap();
        assert_eq!(prefix, decoded);
        let rebuilt = decoded.to_cid(data).unwrap();
        assert_eq!(cid, rebuilt);
    }
}
