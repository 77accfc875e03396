use std::borrow::Cow;

/// The bitswap sub-protocols this implementation understands, newest
/// first. A peer and we agree on the highest mutually supported one during
/// multistream-select; everything below the wire-codec layer (the actual
/// negotiation) belongs to the transport, not this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    Legacy,
    Bitswap100,
    Bitswap110,
}

impl ProtocolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::Legacy => "/ipfs/bitswap",
            ProtocolId::Bitswap100 => "/ipfs/bitswap/1.0.0",
            ProtocolId::Bitswap110 => "/ipfs/bitswap/1.1.0",
        }
    }

    /// Whether this sub-protocol carries `payload` entries (CID prefix +
    /// raw bytes) rather than the legacy raw `blocks` list.
    pub fn supports_payload(&self) -> bool {
        !matches!(self, ProtocolId::Legacy | ProtocolId::Bitswap100)
    }

    /// Whether this sub-protocol carries block-presence hints (HAVE/DONT_HAVE).
    pub fn supports_presence(&self) -> bool {
        matches!(self, ProtocolId::Bitswap110)
    }
}

impl TryFrom<&str> for ProtocolId {
    type Error = UnknownProtocol;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "/ipfs/bitswap" => Ok(ProtocolId::Legacy),
            "/ipfs/bitswap/1.0.0" => Ok(ProtocolId::Bitswap100),
            "/ipfs/bitswap/1.1.0" => Ok(ProtocolId::Bitswap110),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown bitswap protocol id: {0}")]
pub struct UnknownProtocol(pub String);

/// The ordered list of protocol ids we advertise, best first.
pub const DEFAULT_PROTOCOLS: &[ProtocolId] = &[ProtocolId::Bitswap110, ProtocolId::Bitswap100];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub protocol_ids: Vec<ProtocolId>,
    pub max_transmit_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            protocol_ids: DEFAULT_PROTOCOLS.to_vec(),
            max_transmit_size: 4 * 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn protocol_names(&self) -> Vec<Cow<'static, str>> {
        self.protocol_ids
            .iter()
            .map(|p| Cow::Borrowed(p.as_str()))
            .collect()
    }
}
