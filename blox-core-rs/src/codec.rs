//! Radio envelope and role-protocol message codec
//!
//! Every role message occupies the full 75-byte envelope payload: one opcode
//! byte followed by a fixed-size body. There is no length prefix, so the
//! decoder relies on the opcode alone and rejects anything it does not know.
//!
//! ```text
//! byte 0      opcode (1..=5)
//! byte 1..33  program name, NUL padded     (ProgQuery, ProgStart, ParentQuery)
//! byte 1      role id                      (ParentAck)
//! remainder   zero
//! ```

use crate::error::DecodeError;
use crate::types::{program_name, NodeId, ProgramName, RoleId, BROADCAST_ID, FRAME_DATA_LEN, NAME_FIELD_LEN};

/// Bytes of hosted framing ahead of the payload: src, dst, len, kind
pub const ENVELOPE_HEADER_LEN: usize = 10;

/// Total size of an encoded envelope on the hosted link
pub const ENVELOPE_LEN: usize = ENVELOPE_HEADER_LEN + FRAME_DATA_LEN;

// ============================================================================
// Envelope
// ============================================================================

/// Which layer an envelope belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Base program traffic
    Base = 0,
    /// Role negotiation
    Role = 1,
    /// Application payloads
    User = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Base),
            1 => Ok(FrameKind::Role),
            2 => Ok(FrameKind::User),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// Application-level radio frame, already validated by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Sending node
    pub src: NodeId,
    /// Receiving node or [`BROADCAST_ID`]
    pub dst: NodeId,
    /// Layer the payload belongs to
    pub kind: FrameKind,
    /// Raw payload
    pub payload: [u8; FRAME_DATA_LEN],
}

impl Envelope {
    /// Create an envelope around a full payload
    pub fn new(src: NodeId, dst: NodeId, kind: FrameKind, payload: [u8; FRAME_DATA_LEN]) -> Self {
        Self { src, dst, kind, payload }
    }

    /// Is this frame meant for `node`?
    pub fn is_for(&self, node: NodeId) -> bool {
        self.dst == BROADCAST_ID || self.dst == node
    }

    /// Encode for the hosted link: little-endian header then the payload
    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut out = [0u8; ENVELOPE_LEN];
        out[0..4].copy_from_slice(&self.src.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst.to_le_bytes());
        out[8] = FRAME_DATA_LEN as u8;
        out[9] = self.kind as u8;
        out[ENVELOPE_HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// Decode a frame produced by [`Envelope::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(DecodeError::Truncated(bytes.len()));
        }
        let src = NodeId::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let dst = NodeId::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = FrameKind::try_from(bytes[9])?;

        let mut payload = [0u8; FRAME_DATA_LEN];
        payload.copy_from_slice(&bytes[ENVELOPE_HEADER_LEN..ENVELOPE_LEN]);

        Ok(Self { src, dst, kind, payload })
    }
}

// ============================================================================
// Role Messages
// ============================================================================

/// On-air role opcodes. Zero is the reserved "empty" opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    ProgQuery = 1,
    ProgAck = 2,
    ProgStart = 3,
    ParentQuery = 4,
    ParentAck = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::ProgQuery),
            2 => Ok(Opcode::ProgAck),
            3 => Ok(Opcode::ProgStart),
            4 => Ok(Opcode::ParentQuery),
            5 => Ok(Opcode::ParentAck),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

/// Role negotiation message carried in a [`FrameKind::Role`] envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMessage {
    /// Who has a stored image of this program?
    ProgQuery { name: ProgramName },
    /// I have it
    ProgAck,
    /// Load and run this program
    ProgStart { name: ProgramName },
    /// Is anyone already parent for this program?
    ParentQuery { name: ProgramName },
    /// Yes: run as this role
    ParentAck { role_id: RoleId },
}

impl RoleMessage {
    /// Opcode this message travels under
    pub fn opcode(&self) -> Opcode {
        match self {
            RoleMessage::ProgQuery { .. } => Opcode::ProgQuery,
            RoleMessage::ProgAck => Opcode::ProgAck,
            RoleMessage::ProgStart { .. } => Opcode::ProgStart,
            RoleMessage::ParentQuery { .. } => Opcode::ParentQuery,
            RoleMessage::ParentAck { .. } => Opcode::ParentAck,
        }
    }

    /// Encode into a full envelope payload
    pub fn encode(&self) -> [u8; FRAME_DATA_LEN] {
        let mut payload = [0u8; FRAME_DATA_LEN];
        payload[0] = self.opcode() as u8;

        match self {
            RoleMessage::ProgQuery { name }
            | RoleMessage::ProgStart { name }
            | RoleMessage::ParentQuery { name } => {
                let bytes = name.as_bytes();
                payload[1..1 + bytes.len()].copy_from_slice(bytes);
            }
            RoleMessage::ParentAck { role_id } => payload[1] = *role_id,
            RoleMessage::ProgAck => {}
        }

        payload
    }

    /// Wrap in a role envelope from `src` to `dst`
    pub fn to_envelope(&self, src: NodeId, dst: NodeId) -> Envelope {
        Envelope::new(src, dst, FrameKind::Role, self.encode())
    }

    /// Decode a role envelope. Fails closed on anything unrecognized.
    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        if envelope.kind != FrameKind::Role {
            return Err(DecodeError::NotRole(envelope.kind));
        }

        let payload = &envelope.payload;
        let message = match Opcode::try_from(payload[0])? {
            Opcode::ProgQuery => RoleMessage::ProgQuery {
                name: decode_name(payload)?,
            },
            Opcode::ProgAck => RoleMessage::ProgAck,
            Opcode::ProgStart => RoleMessage::ProgStart {
                name: decode_name(payload)?,
            },
            Opcode::ParentQuery => RoleMessage::ParentQuery {
                name: decode_name(payload)?,
            },
            Opcode::ParentAck => RoleMessage::ParentAck { role_id: payload[1] },
        };

        Ok(message)
    }
}

/// Pull the NUL-terminated name out of a query body
fn decode_name(payload: &[u8; FRAME_DATA_LEN]) -> Result<ProgramName, DecodeError> {
    let field = &payload[1..1 + NAME_FIELD_LEN];
    let end = field
        .iter()
        .position(|b| *b == 0)
        .ok_or(DecodeError::MalformedName)?;
    let name = core::str::from_utf8(&field[..end]).map_err(|_| DecodeError::MalformedName)?;
    program_name(name).map_err(|_| DecodeError::MalformedName)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ProgramName {
        program_name(s).unwrap()
    }

    #[test]
    fn test_query_layout() {
        let msg = RoleMessage::ParentQuery { name: name("demo") };
        let payload = msg.encode();

        assert_eq!(payload[0], 4);
        assert_eq!(&payload[1..5], b"demo");
        assert!(payload[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parent_ack_layout() {
        let payload = RoleMessage::ParentAck { role_id: 7 }.encode();
        assert_eq!(payload[0], 5);
        assert_eq!(payload[1], 7);

        let env = Envelope::new(1, 2, FrameKind::Role, payload);
        assert_eq!(
            RoleMessage::decode(&env).unwrap(),
            RoleMessage::ParentAck { role_id: 7 }
        );
    }

    #[test]
    fn test_prog_ack_has_no_body() {
        let payload = RoleMessage::ProgAck.encode();
        assert_eq!(payload[0], 2);
        assert!(payload[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_longest_name_keeps_terminator() {
        let long = "n".repeat(crate::types::MAX_NAME_LEN);
        let msg = RoleMessage::ProgStart { name: name(&long) };
        let env = msg.to_envelope(9, BROADCAST_ID);

        assert_eq!(env.payload[NAME_FIELD_LEN], 0);
        assert_eq!(RoleMessage::decode(&env).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_non_role_frames() {
        let mut env = RoleMessage::ProgAck.to_envelope(1, 2);
        env.kind = FrameKind::User;
        assert_eq!(
            RoleMessage::decode(&env),
            Err(DecodeError::NotRole(FrameKind::User))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_opcodes() {
        let mut payload = [0u8; FRAME_DATA_LEN];
        let env = Envelope::new(1, 2, FrameKind::Role, payload);
        assert_eq!(RoleMessage::decode(&env), Err(DecodeError::UnknownOpcode(0)));

        payload[0] = 0x42;
        let env = Envelope::new(1, 2, FrameKind::Role, payload);
        assert_eq!(
            RoleMessage::decode(&env),
            Err(DecodeError::UnknownOpcode(0x42))
        );
    }

    #[test]
    fn test_decode_rejects_unterminated_name() {
        let mut payload = [b'x'; FRAME_DATA_LEN];
        payload[0] = Opcode::ProgQuery as u8;
        let env = Envelope::new(1, 2, FrameKind::Role, payload);
        assert_eq!(RoleMessage::decode(&env), Err(DecodeError::MalformedName));

        let mut payload = [0u8; FRAME_DATA_LEN];
        payload[0] = Opcode::ParentQuery as u8;
        let env = Envelope::new(1, 2, FrameKind::Role, payload);
        assert_eq!(RoleMessage::decode(&env), Err(DecodeError::MalformedName));
    }

    #[test]
    fn test_envelope_framing() {
        let env = RoleMessage::ProgQuery { name: name("pac") }.to_envelope(0x0102_0304, BROADCAST_ID);
        let bytes = env.to_bytes();

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0xFF; 4]);
        assert_eq!(bytes[8], FRAME_DATA_LEN as u8);
        assert_eq!(bytes[9], FrameKind::Role as u8);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);

        assert_eq!(
            Envelope::from_bytes(&bytes[..20]),
            Err(DecodeError::Truncated(20))
        );

        let mut bad = bytes;
        bad[9] = 9;
        assert_eq!(Envelope::from_bytes(&bad), Err(DecodeError::UnknownKind(9)));
    }

    #[test]
    fn test_addressing() {
        let env = RoleMessage::ProgAck.to_envelope(1, 5);
        assert!(env.is_for(5));
        assert!(!env.is_for(6));
        assert!(RoleMessage::ProgAck.to_envelope(1, BROADCAST_ID).is_for(6));
    }
}
