/// Outer NFC relay frame as carried on the TCP link.
///
/// Wire layout (big-endian length, see the frame codec):
/// `[magic 4][length 4][session_id 16][kind 1][payload][checksum 4]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    pub session_id: [u8; 16],
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Wrapper {
    pub fn new(session_id: [u8; 16], kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            session_id,
            kind,
            payload,
        }
    }

    /// Response frame sharing the session id of an inbound wrapper.
    pub fn reply(&self, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            session_id: self.session_id,
            kind,
            payload,
        }
    }

}

/// Message kinds understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Init,
    NfcData,
    Status,
    Config,
    Error,
    Heartbeat,
    Relay,
    Emulation,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Init => 0x01,
            MessageKind::NfcData => 0x02,
            MessageKind::Status => 0x03,
            MessageKind::Config => 0x04,
            MessageKind::Error => 0x05,
            MessageKind::Heartbeat => 0x06,
            MessageKind::Relay => 0x07,
            MessageKind::Emulation => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MessageKind::Init),
            0x02 => Some(MessageKind::NfcData),
            0x03 => Some(MessageKind::Status),
            0x04 => Some(MessageKind::Config),
            0x05 => Some(MessageKind::Error),
            0x06 => Some(MessageKind::Heartbeat),
            0x07 => Some(MessageKind::Relay),
            0x08 => Some(MessageKind::Emulation),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Init => "INIT",
            MessageKind::NfcData => "NFC_DATA",
            MessageKind::Status => "STATUS",
            MessageKind::Config => "CONFIG",
            MessageKind::Error => "ERROR",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Relay => "RELAY",
            MessageKind::Emulation => "EMULATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for code in 0x01..=0x08 {
            let kind = MessageKind::from_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
    }

    #[test]
    fn test_unknown_kind_code() {
        assert_eq!(MessageKind::from_code(0x00), None);
        assert_eq!(MessageKind::from_code(0x09), None);
        assert_eq!(MessageKind::from_code(0xFF), None);
    }

    #[test]
    fn test_reply_keeps_session_id() {
        let w = Wrapper::new([7u8; 16], MessageKind::NfcData, vec![1, 2, 3]);
        let r = w.reply(MessageKind::Error, vec![]);
        assert_eq!(r.session_id, w.session_id);
        assert_eq!(r.kind, MessageKind::Error);
    }
}
