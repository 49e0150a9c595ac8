use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::app::service::tlv_codec::{self, encode_length, TlvParseError};
use crate::models::relay::RelayRequest;
use crate::models::wrapper::{MessageKind, Wrapper};

/// Leading magic of every relay frame.
pub const MAGIC: [u8; 4] = *b"NFCG";

/// session_id(16) + kind(1) + checksum(4); the minimum declared length.
const FIXED_BODY_LEN: usize = 21;

/// Upper bound on the declared frame length.
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame magic {0:02X?}")]
    BadMagic([u8; 4]),
    #[error("declared frame length {0} is shorter than the fixed fields")]
    BadLength(u32),
    #[error("declared frame length {0} exceeds the frame ceiling")]
    OversizedFrame(u32),
    #[error("unknown message kind 0x{0:02X}")]
    UnknownKind(u8),
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// First four bytes of MD5 over the frame fields.
pub fn md5_trunc4(data: &[u8]) -> [u8; 4] {
    let mut hasher = Md5::new();
    hasher.update(data);
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Outer wrapper codec.
///
/// The checksum function is held as a value so an upstream with a
/// different integrity scheme can swap it without touching the framing.
#[derive(Clone)]
pub struct FrameCodec {
    checksum: fn(&[u8]) -> [u8; 4],
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            checksum: md5_trunc4,
            max_frame: MAX_FRAME_LEN,
        }
    }
}

impl FrameCodec {
    pub fn with_checksum(checksum: fn(&[u8]) -> [u8; 4]) -> Self {
        Self {
            checksum,
            max_frame: MAX_FRAME_LEN,
        }
    }

    /// Read one wrapper. `Ok(None)` signals a clean peer close at a
    /// frame boundary.
    pub async fn read_frame<S>(&self, stream: &mut S) -> Result<Option<Wrapper>, FrameError>
    where
        S: AsyncRead + Unpin,
    {
        let mut magic = [0u8; 4];
        match stream.read_exact(&mut magic).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(FrameError::Io(e)),
        }
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let length = u32::from_be_bytes(len_bytes);
        if (length as usize) < FIXED_BODY_LEN {
            return Err(FrameError::BadLength(length));
        }
        if length as usize > self.max_frame {
            return Err(FrameError::OversizedFrame(length));
        }

        let mut body = vec![0u8; length as usize];
        stream.read_exact(&mut body).await?;

        let (session_id, rest) = body.split_at(16);
        let (kind_byte, rest) = rest.split_at(1);
        let (payload, wire_checksum) = rest.split_at(rest.len() - 4);

        let mut checked = Vec::with_capacity(8 + 16 + 1 + payload.len());
        checked.extend_from_slice(&magic);
        checked.extend_from_slice(&len_bytes);
        checked.extend_from_slice(session_id);
        checked.extend_from_slice(kind_byte);
        checked.extend_from_slice(payload);
        if (self.checksum)(&checked) != wire_checksum {
            return Err(FrameError::ChecksumMismatch);
        }

        let kind =
            MessageKind::from_code(kind_byte[0]).ok_or(FrameError::UnknownKind(kind_byte[0]))?;

        let mut sid = [0u8; 16];
        sid.copy_from_slice(session_id);
        debug!("frame in: kind={} payload={}B", kind.name(), payload.len());

        Ok(Some(Wrapper::new(sid, kind, payload.to_vec())))
    }

    /// Serialize a wrapper, recomputing length and checksum.
    pub fn encode(&self, wrapper: &Wrapper) -> Vec<u8> {
        let length = (FIXED_BODY_LEN + wrapper.payload.len()) as u32;
        let mut out = Vec::with_capacity(8 + length as usize);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&wrapper.session_id);
        out.push(wrapper.kind.code());
        out.extend_from_slice(&wrapper.payload);
        let checksum = (self.checksum)(&out);
        out.extend_from_slice(&checksum);
        out
    }

    pub async fn write_frame<S>(&self, stream: &mut S, wrapper: &Wrapper) -> Result<(), FrameError>
    where
        S: AsyncWrite + Unpin,
    {
        let buf = self.encode(wrapper);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        debug!(
            "frame out: kind={} payload={}B",
            wrapper.kind.name(),
            wrapper.payload.len()
        );
        Ok(())
    }
}

/// Errors from the inner NFC_DATA envelope.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("envelope carries no TLV payload field")]
    NoTlvPayload,
    #[error("envelope hex field invalid: {0}")]
    BadHex(TlvParseError),
    #[error("envelope base64 field invalid")]
    BadBase64,
    #[error("tlv_data entry malformed: {0}")]
    BadTlvData(String),
}

/// Pull TLV bytes out of an inner envelope, first match wins:
/// raw_tlv_hex, raw_data, tlv_hex, tlv_bytes_b64, tlv_data.
pub fn extract_tlv(envelope: &RelayRequest) -> Result<Vec<u8>, ExtractError> {
    for hex_field in [&envelope.raw_tlv_hex, &envelope.raw_data, &envelope.tlv_hex] {
        if let Some(value) = hex_field {
            return tlv_codec::hex_to_bytes(value).map_err(ExtractError::BadHex);
        }
    }

    if let Some(b64) = &envelope.tlv_bytes_b64 {
        use base64::Engine;
        return base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|_| ExtractError::BadBase64);
    }

    if let Some(pairs) = &envelope.tlv_data {
        return tlv_from_pairs(pairs);
    }

    Err(ExtractError::NoTlvPayload)
}

/// Build TLV bytes from the `TAG:VALUE|TAG:VALUE` shorthand. VALUE is
/// hex when it is even-length hex, otherwise UTF-8 bytes.
fn tlv_from_pairs(pairs: &str) -> Result<Vec<u8>, ExtractError> {
    let mut out = Vec::new();
    for pair in pairs.split('|').filter(|p| !p.is_empty()) {
        let (tag, value) = pair
            .split_once(':')
            .ok_or_else(|| ExtractError::BadTlvData(pair.to_string()))?;
        let tag_bytes = tlv_codec::hex_to_bytes(tag)
            .map_err(|_| ExtractError::BadTlvData(pair.to_string()))?;
        if tag_bytes.is_empty() {
            return Err(ExtractError::BadTlvData(pair.to_string()));
        }

        let value_bytes = if value.len() % 2 == 0
            && !value.is_empty()
            && value.chars().all(|c| c.is_ascii_hexdigit())
        {
            tlv_codec::hex_to_bytes(value).expect("checked hex")
        } else {
            value.as_bytes().to_vec()
        };

        out.extend_from_slice(&tag_bytes);
        out.extend_from_slice(&encode_length(value_bytes.len()));
        out.extend_from_slice(&value_bytes);
    }
    if out.is_empty() {
        return Err(ExtractError::NoTlvPayload);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    fn sample() -> Wrapper {
        Wrapper::new([0xAB; 16], MessageKind::NfcData, b"{\"tlv_hex\":\"5A00\"}".to_vec())
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let codec = codec();
        let frame = sample();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, &frame).await.expect("write");

        let mut cursor = buf.as_slice();
        let back = codec
            .read_frame(&mut cursor)
            .await
            .expect("read")
            .expect("one frame");
        assert_eq!(back, frame);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let codec = codec();
        let frame = Wrapper::new([1u8; 16], MessageKind::Heartbeat, vec![]);
        let buf = codec.encode(&frame);
        assert_eq!(&buf[..4], b"NFCG");
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 21);
        assert_eq!(buf[24], 0x06);
        assert_eq!(buf.len(), 8 + 21);
        // Checksum covers everything before it.
        assert_eq!(&buf[25..29], &md5_trunc4(&buf[..25]));
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let codec = codec();
        let mut empty: &[u8] = &[];
        assert!(codec.read_frame(&mut empty).await.expect("eof ok").is_none());
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let codec = codec();
        let mut buf = codec.encode(&sample());
        buf[0] = b'X';
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(_)));
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let codec = codec();
        let mut buf = codec.encode(&sample());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_payload_tamper_fails_checksum() {
        let codec = codec();
        let mut buf = codec.encode(&sample());
        buf[30] ^= 0x01;
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_undersized_length_rejected() {
        let codec = codec();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NFCG");
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 10]);
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::BadLength(10)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let codec = codec();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NFCG");
        buf.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame(_)));
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let codec = codec();
        let mut buf = codec.encode(&sample());
        // Patch the kind byte and fix the checksum up.
        buf[24] = 0x7F;
        let checksum = md5_trunc4(&buf[..buf.len() - 4]);
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&checksum);
        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(0x7F)));
    }

    #[test]
    fn test_extract_precedence() {
        let envelope = RelayRequest {
            raw_tlv_hex: Some("5A021234".into()),
            tlv_hex: Some("9F3403000000".into()),
            ..Default::default()
        };
        assert_eq!(extract_tlv(&envelope).unwrap(), vec![0x5A, 0x02, 0x12, 0x34]);

        let envelope = RelayRequest {
            raw_data: Some("9F340100".into()),
            tlv_bytes_b64: Some("WgISNA==".into()),
            ..Default::default()
        };
        assert_eq!(extract_tlv(&envelope).unwrap(), vec![0x9F, 0x34, 0x01, 0x00]);
    }

    #[test]
    fn test_extract_base64() {
        use base64::Engine;
        let raw = vec![0x5A, 0x02, 0x12, 0x34];
        let envelope = RelayRequest {
            tlv_bytes_b64: Some(base64::engine::general_purpose::STANDARD.encode(&raw)),
            ..Default::default()
        };
        assert_eq!(extract_tlv(&envelope).unwrap(), raw);
    }

    #[test]
    fn test_extract_tlv_data_pairs() {
        let envelope = RelayRequest {
            tlv_data: Some("5A:1234|50:VISA".into()),
            ..Default::default()
        };
        let bytes = extract_tlv(&envelope).unwrap();
        // 5A len 2 hex value, 50 len 4 UTF-8 value.
        assert_eq!(
            bytes,
            vec![0x5A, 0x02, 0x12, 0x34, 0x50, 0x04, b'V', b'I', b'S', b'A']
        );
    }

    #[test]
    fn test_extract_empty_envelope() {
        let err = extract_tlv(&RelayRequest::default()).unwrap_err();
        assert!(matches!(err, ExtractError::NoTlvPayload));
    }

    #[test]
    fn test_extract_odd_hex_rejected() {
        let envelope = RelayRequest {
            raw_tlv_hex: Some("5A0".into()),
            ..Default::default()
        };
        assert!(matches!(
            extract_tlv(&envelope).unwrap_err(),
            ExtractError::BadHex(TlvParseError::InvalidHexLength)
        ));
    }

    #[test]
    fn test_swappable_checksum() {
        fn zeros(_: &[u8]) -> [u8; 4] {
            [0; 4]
        }
        let codec = FrameCodec::with_checksum(zeros);
        let buf = codec.encode(&sample());
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 0]);
    }
}
