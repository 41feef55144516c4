use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ROOM_CODE_LEN;

/// Alphabet room codes are sampled from. Uppercase only; lookups case-fold.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// An 8-character uppercase alphanumeric room handle, e.g. `K7QZ9M2A`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Sample a fresh code. Collision checking is the registry's job.
    pub fn mint() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Case-fold a client-supplied code into canonical uppercase form.
    /// The result may still name a room that does not exist.
    pub fn folded(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.len() == ROOM_CODE_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for one live duplex connection. Stable for the life of
/// the connection; clients see it as the `socketId` wire field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one chunked upload session, unique within the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_code_shape() {
        let code = RoomCode::mint();
        assert!(code.is_well_formed(), "bad code: {code}");
    }

    #[test]
    fn test_folding_is_case_insensitive() {
        assert_eq!(RoomCode::folded("k7qz9m2a"), RoomCode::folded("K7QZ9M2A"));
        assert_eq!(RoomCode::folded(" k7qz9m2a "), RoomCode::folded("K7QZ9M2A"));
    }

    #[test]
    fn test_minted_codes_differ() {
        // Collisions in a 36^8 space across two draws would point at a
        // broken RNG, not bad luck.
        assert_ne!(RoomCode::mint(), RoomCode::mint());
    }

    #[test]
    fn test_connection_id_roundtrips_as_string() {
        let id = ConnectionId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
