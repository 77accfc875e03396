mod message;

pub use message::{BitswapMessage, DecodeError, MessageEntry, PresenceType, Priority};
