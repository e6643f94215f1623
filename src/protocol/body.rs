//! Fixed-size record bodies: `BeginRequest`, `EndRequest`, `UnknownType`.

/// The role a request asks the application to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    /// A role number this implementation does not know.
    Other(u16),
}

impl From<u16> for Role {
    fn from(value: u16) -> Self {
        match value {
            1 => Role::Responder,
            2 => Role::Authorizer,
            3 => Role::Filter,
            other => Role::Other(other),
        }
    }
}

impl From<Role> for u16 {
    fn from(role: Role) -> Self {
        match role {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
            Role::Other(other) => other,
        }
    }
}

/// `BeginRequest` flag: keep the connection open after this request.
pub const FLAG_KEEP_CONN: u8 = 0x01;

/// Body of a `BeginRequest` record.
///
/// ```text
/// ┌──────────┬───────┬──────────┐
/// │ Role     │ Flags │ Reserved │
/// │ u16 BE   │ u8    │ 5 bytes  │
/// └──────────┴───────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn new(role: Role, flags: u8) -> Self {
        Self { role, flags }
    }

    /// Decode a body; returns `None` unless it is exactly 8 bytes long.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != Self::LEN {
            return None;
        }
        Some(Self {
            role: Role::from(u16::from_be_bytes([body[0], body[1]])),
            flags: body[2],
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..2].copy_from_slice(&u16::from(self.role).to_be_bytes());
        buf[2] = self.flags;
        buf
    }

    pub fn keep_alive(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Protocol-level outcome reported in an `EndRequest` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplexConnections = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolStatus::RequestComplete),
            1 => Some(ProtocolStatus::CantMultiplexConnections),
            2 => Some(ProtocolStatus::Overloaded),
            3 => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// Body of an `EndRequest` record.
///
/// ```text
/// ┌────────────┬──────────┬──────────┐
/// │ App status │ Protocol │ Reserved │
/// │ i32 BE     │ u8       │ 3 bytes  │
/// └────────────┴──────────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: i32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    pub fn new(app_status: i32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        buf[4] = self.protocol_status as u8;
        buf
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != Self::LEN {
            return None;
        }
        Some(Self {
            app_status: i32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            protocol_status: ProtocolStatus::from_u8(body[4])?,
        })
    }
}

/// Body of an `UnknownType` record: the offending type byte and 7 reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTypeBody {
    pub record_type: u8,
}

impl UnknownTypeBody {
    pub const LEN: usize = 8;

    pub fn new(record_type: u8) -> Self {
        Self { record_type }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.record_type;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_request_rejects_wrong_size() {
        assert!(BeginRequestBody::decode(&[0, 1, 1]).is_none());
        assert!(BeginRequestBody::decode(&[0u8; 9]).is_none());
    }

    #[test]
    fn begin_request_reads_role_and_keep_alive() {
        let body = BeginRequestBody::decode(&[0, 1, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(body.role, Role::Responder);
        assert!(body.keep_alive());

        let body = BeginRequestBody::decode(&[0, 3, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(body.role, Role::Filter);
        assert!(!body.keep_alive());
    }

    #[test]
    fn end_request_encodes_negative_status() {
        let bytes = EndRequestBody::new(-1, ProtocolStatus::RequestComplete).encode();
        assert_eq!(bytes, [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_role_number_is_preserved() {
        assert_eq!(Role::from(42), Role::Other(42));
        assert_eq!(u16::from(Role::Other(42)), 42);
    }
}
