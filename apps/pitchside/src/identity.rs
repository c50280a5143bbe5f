use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One side of a pairing. Fresh for every rendezvous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl FromStr for ParticipantId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Name of the replicated topic both peers meet on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// XOR of both participants' raw bytes, re-typed as a v4 UUID.
    ///
    /// Order independent: `derive(a, b) == derive(b, a)`. Inputs are already
    /// validated `ParticipantId`s so there is no failure path here.
    pub fn derive(a: &ParticipantId, b: &ParticipantId) -> Self {
        let mut bytes = [0u8; 16];
        for (slot, (left, right)) in bytes
            .iter_mut()
            .zip(a.as_bytes().iter().zip(b.as_bytes().iter()))
        {
            *slot = left ^ right;
        }
        let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

pub const PAIRING_CODE_MIN: u16 = 1000;
pub const PAIRING_CODE_MAX: u16 = 9999;

/// Short code shown to the host and typed in by the joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(u16);

impl PairingCode {
    /// Rejects zero and anything outside the four digit display range.
    pub fn new(raw: u32) -> Option<Self> {
        let code = u16::try_from(raw).ok()?;
        (PAIRING_CODE_MIN..=PAIRING_CODE_MAX)
            .contains(&code)
            .then_some(Self(code))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Both identifiers as seen from one side once the server confirms a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pairing {
    pub self_id: ParticipantId,
    pub other_id: ParticipantId,
}

impl Pairing {
    pub fn session_id(&self) -> SessionId {
        SessionId::derive(&self.self_id, &self.other_id)
    }
}

/// Local-only bookkeeping for the current or most recent network session.
/// Stored under [`NetworkLocalState::DOCUMENT_ID`]; never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLocalState {
    pub uid: ParticipantId,
    pub oid: ParticipantId,
    pub gid: SessionId,
}

impl NetworkLocalState {
    pub const DOCUMENT_ID: &'static str = "network";

    pub fn from_pairing(pairing: &Pairing) -> Self {
        Self {
            uid: pairing.self_id,
            oid: pairing.other_id,
            gid: pairing.session_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn network_state_uses_short_field_names() {
        let pairing = Pairing {
            self_id: ParticipantId::new_random(),
            other_id: ParticipantId::new_random(),
        };
        let state = NetworkLocalState::from_pairing(&pairing);
        let value = serde_json::to_value(state).unwrap();
        assert_eq!(value["uid"], pairing.self_id.to_string());
        assert_eq!(value["oid"], pairing.other_id.to_string());
        assert_eq!(value["gid"], pairing.session_id().to_string());
    }

    fn participant(bytes: [u8; 16]) -> ParticipantId {
        ParticipantId::from_uuid(Uuid::from_bytes(bytes))
    }

    #[test]
    fn derive_xors_bytes_and_marks_v4() {
        let a = participant([0xff; 16]);
        let b = participant([0x0f; 16]);
        let session = SessionId::derive(&a, &b);
        let bytes = session.as_uuid().as_bytes();
        assert_eq!(bytes[0], 0xf0);
        assert_eq!(session.as_uuid().get_version_num(), 4);
        assert_eq!(session.as_uuid().get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn derive_of_identical_ids_is_still_a_valid_uuid() {
        let a = ParticipantId::new_random();
        let session = SessionId::derive(&a, &a);
        assert_eq!(session.as_uuid().get_version_num(), 4);
        assert!(session.to_string().parse::<SessionId>().is_ok());
    }

    #[test]
    fn pairing_code_bounds() {
        assert!(PairingCode::new(0).is_none());
        assert!(PairingCode::new(999).is_none());
        assert!(PairingCode::new(10_000).is_none());
        assert!(PairingCode::new(70_000).is_none());
        assert_eq!(PairingCode::new(4821).map(|c| c.value()), Some(4821));
        assert_eq!(PairingCode::new(1000).map(|c| c.to_string()).as_deref(), Some("1000"));
    }

    #[test]
    fn participant_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<ParticipantId>().is_err());
    }

    proptest! {
        #[test]
        fn derive_is_commutative(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
            let (a, b) = (participant(a), participant(b));
            prop_assert_eq!(SessionId::derive(&a, &b), SessionId::derive(&b, &a));
        }

        #[test]
        fn derive_is_deterministic(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
            let (a, b) = (participant(a), participant(b));
            prop_assert_eq!(SessionId::derive(&a, &b), SessionId::derive(&a, &b));
        }
    }
}
