// Minimal WebSocket framing (single frames, no fragmentation)
//
// Header: [FIN|opcode] [MASK|len7] [ext len: 2 or 8 bytes, big-endian] [mask key: 4 bytes]
// Client -> server frames are masked; server -> client frames are not.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::MAX_FRAME_PAYLOAD;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
    /// Continuation or reserved opcode; read and skipped
    Unsupported(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u64),
}

impl Frame {
    pub fn opcode(&self) -> u8 {
        match self {
            Frame::Text(_) => OP_TEXT,
            Frame::Binary(_) => OP_BINARY,
            Frame::Ping(_) => OP_PING,
            Frame::Pong(_) => OP_PONG,
            Frame::Close => OP_CLOSE,
            Frame::Unsupported(op) => *op,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data,
            Frame::Close | Frame::Unsupported(_) => &[],
        }
    }

    fn from_parts(opcode: u8, payload: Vec<u8>) -> Self {
        match opcode {
            // Invalid UTF-8 becomes replacement chars and then fails JSON parsing
            OP_TEXT => Frame::Text(String::from_utf8_lossy(&payload).into_owned()),
            OP_BINARY => Frame::Binary(payload),
            OP_PING => Frame::Ping(payload),
            OP_PONG => Frame::Pong(payload),
            OP_CLOSE => Frame::Close,
            other => Frame::Unsupported(other),
        }
    }
}

/// XOR `data` with the 4-byte key, byte i with key[i % 4]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Read exactly one frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let opcode = header[0] & 0x0F;
    let masked = header[1] & MASK_BIT != 0;
    let length = match header[1] & 0x7F {
        126 => u64::from(reader.read_u16().await?),
        127 => reader.read_u64().await?,
        short => u64::from(short),
    };
    if length > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(length));
    }

    let mut key = [0u8; 4];
    if masked {
        reader.read_exact(&mut key).await?;
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if masked {
        apply_mask(&mut payload, key);
    }

    Ok(Frame::from_parts(opcode, payload))
}

/// Encode a complete (FIN) frame, masked with `mask` if given
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let payload = frame.payload();
    let len = payload.len();
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };

    let mut out = Vec::with_capacity(14 + len);
    out.push(FIN | frame.opcode());
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Server -> client encoding (unmasked)
pub fn encode(frame: &Frame) -> Vec<u8> {
    encode_frame(frame, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_encode_short_text() {
        let bytes = encode(&Frame::Text("Hello".into()));
        assert_eq!(bytes, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_16_bit_length() {
        let bytes = encode(&Frame::Binary(vec![0; 300]));
        assert_eq!(&bytes[..4], &[0x82, 126, 0x01, 0x2c]);
        assert_eq!(bytes.len(), 4 + 300);
    }

    #[test]
    fn test_encode_64_bit_length() {
        let bytes = encode(&Frame::Binary(vec![1; 70_000]));
        assert_eq!(bytes[1], 127);
        assert_eq!(&bytes[2..10], &70_000u64.to_be_bytes());
        assert_eq!(bytes.len(), 10 + 70_000);
    }

    #[tokio::test]
    async fn test_decode_rfc_masked_hello() {
        // RFC 6455 section 5.7 example
        let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = read_frame(&mut &bytes[..]).await.unwrap();
        assert_eq!(frame, Frame::Text("Hello".into()));
        assert_eq!(encode_frame(&frame, Some(KEY)), bytes);
    }

    #[tokio::test]
    async fn test_decode_masked_extended_length() {
        let text = "x".repeat(200);
        let bytes = encode_frame(&Frame::Text(text.clone()), Some(KEY));
        assert_eq!(bytes[1], 0x80 | 126);
        assert_eq!(read_frame(&mut &bytes[..]).await.unwrap(), Frame::Text(text));
    }

    #[tokio::test]
    async fn test_decode_control_frames() {
        let ping = encode_frame(&Frame::Ping(b"hi".to_vec()), Some(KEY));
        assert_eq!(read_frame(&mut &ping[..]).await.unwrap(), Frame::Ping(b"hi".to_vec()));

        let close = [0x88, 0x80, 1, 2, 3, 4];
        assert_eq!(read_frame(&mut &close[..]).await.unwrap(), Frame::Close);

        let continuation = [0x00, 0x01, b'a'];
        assert_eq!(
            read_frame(&mut &continuation[..]).await.unwrap(),
            Frame::Unsupported(OP_CONTINUATION)
        );
    }

    #[tokio::test]
    async fn test_consecutive_frames() {
        let mut bytes = encode_frame(&Frame::Text("a".into()), Some(KEY));
        bytes.extend(encode_frame(&Frame::Close, Some(KEY)));
        let mut reader = &bytes[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Text("a".into()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Close);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes = vec![0x81, 127];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            read_frame(&mut &bytes[..]).await,
            Err(FrameError::PayloadTooLarge(u64::MAX))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let bytes = [0x81, 0x05, b'H'];
        assert!(matches!(read_frame(&mut &bytes[..]).await, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_mask_is_involution() {
        let mut data = b"stop_all".to_vec();
        apply_mask(&mut data, KEY);
        assert_ne!(data, b"stop_all");
        apply_mask(&mut data, KEY);
        assert_eq!(data, b"stop_all");
    }
}
