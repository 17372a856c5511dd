//! Length-prefixed framing shared by both ends of the producer link.
//!
//! Every frame is `<8 hex digits><payload>`, where the hex digits are the
//! payload length in bytes, upper-case and zero-padded (`0000001A`). There
//! is no other delimiter, so a frame is only ever handed to the caller once
//! all of its payload bytes have arrived.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use voltbridge_types::BridgeError;

/// Width of the length prefix in bytes.
pub const PREFIX_LEN: usize = 8;

/// Largest payload a prefix can describe.
pub const MAX_PAYLOAD_LEN: u64 = 0xFFFF_FFFF;

/// Prefix `payload` with its length as 8 upper-case hex digits.
///
/// # Errors
///
/// [`BridgeError::Framing`] when the payload is longer than
/// [`MAX_PAYLOAD_LEN`] bytes.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        BridgeError::Framing(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit",
            payload.len()
        ))
    })?;
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{len:08X}").as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse an 8-byte length prefix.
///
/// Either hex case is accepted. Signs, whitespace and any other non-hex
/// byte are rejected.
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<u32, BridgeError> {
    if !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(BridgeError::Framing(format!(
            "non-hex length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }
    // All bytes are ASCII hex digits, so this is valid UTF-8 and fits in u32.
    let digits = std::str::from_utf8(prefix)
        .map_err(|e| BridgeError::Framing(format!("length prefix is not UTF-8: {e}")))?;
    u32::from_str_radix(digits, 16)
        .map_err(|e| BridgeError::Framing(format!("bad length prefix {digits:?}: {e}")))
}

/// Decode one frame from the front of `buf`.
///
/// Returns the payload and whatever bytes follow the frame.
///
/// # Errors
///
/// [`BridgeError::Framing`] on a bad prefix or when `buf` ends before the
/// declared payload length.
pub fn decode(buf: &[u8]) -> Result<(Vec<u8>, &[u8]), BridgeError> {
    let Some((prefix, rest)) = buf.split_first_chunk::<PREFIX_LEN>() else {
        return Err(BridgeError::Framing(format!(
            "truncated prefix: {} of {PREFIX_LEN} bytes",
            buf.len()
        )));
    };
    let len = parse_prefix(prefix)? as usize;
    if rest.len() < len {
        return Err(BridgeError::Framing(format!(
            "truncated frame: declared {len} bytes, got {}",
            rest.len()
        )));
    }
    let (payload, tail) = rest.split_at(len);
    Ok((payload.to_vec(), tail))
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// The payload buffer grows as bytes arrive, so a hostile prefix cannot
/// force a huge allocation up front.
///
/// # Errors
///
/// * [`BridgeError::Framing`] – bad prefix, or EOF inside a frame.
/// * [`BridgeError::Transport`] – any other I/O failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];

    let first = reader
        .read(&mut prefix[..1])
        .await
        .map_err(|e| BridgeError::Transport(format!("read error: {e}")))?;
    if first == 0 {
        return Ok(None);
    }

    reader.read_exact(&mut prefix[1..]).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            BridgeError::Framing("connection closed inside length prefix".to_string())
        }
        _ => BridgeError::Transport(format!("read error: {e}")),
    })?;

    let len = parse_prefix(&prefix)?;

    let mut payload = Vec::new();
    let got = reader
        .take(u64::from(len))
        .read_to_end(&mut payload)
        .await
        .map_err(|e| BridgeError::Transport(format!("read error: {e}")))?;
    if got != len as usize {
        return Err(BridgeError::Framing(format!(
            "truncated frame: declared {len} bytes, got {got}"
        )));
    }
    Ok(Some(payload))
}

/// Encode `payload` and write the whole frame to `writer`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| BridgeError::Transport(format!("write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Transport(format!("flush error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_uppercase_zero_padded_prefix() {
        let frame = encode(&[0u8; 26]).unwrap();
        assert_eq!(&frame[..PREFIX_LEN], b"0000001A");
        assert_eq!(frame.len(), PREFIX_LEN + 26);

        assert_eq!(encode(b"").unwrap(), b"00000000");
        assert_eq!(encode(b"ChStatus_all").unwrap(), b"0000000CChStatus_all");
    }

    #[test]
    fn decode_returns_payload_and_tail() {
        let mut buf = encode(b"hello").unwrap();
        buf.extend_from_slice(b"0000");
        let (payload, tail) = decode(&buf).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(tail, b"0000");
    }

    #[test]
    fn decode_round_trips_across_sizes() {
        for len in [0usize, 1, 15, 16, 255, 256, 4096, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode(&payload).unwrap();
            let (back, tail) = decode(&frame).unwrap();
            assert_eq!(back, payload, "round trip failed for {len} bytes");
            assert!(tail.is_empty());
        }
    }

    #[test]
    fn prefix_accepts_lowercase_and_rejects_non_hex() {
        assert_eq!(parse_prefix(b"0000001a").unwrap(), 26);
        assert_eq!(parse_prefix(b"FFFFFFFF").unwrap(), u32::MAX);
        assert!(matches!(parse_prefix(b"0000001G"), Err(BridgeError::Framing(_))));
        assert!(matches!(parse_prefix(b"+000001A"), Err(BridgeError::Framing(_))));
        assert!(matches!(parse_prefix(b" 000001A"), Err(BridgeError::Framing(_))));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(decode(b"0000"), Err(BridgeError::Framing(_))));
        assert!(matches!(decode(b"00000005abc"), Err(BridgeError::Framing(_))));
        assert!(matches!(decode(b"zzzzzzzzabc"), Err(BridgeError::Framing(_))));
    }

    #[tokio::test]
    async fn read_frame_reads_consecutive_frames() {
        let mut wire = encode(br#"{"ch":1}"#).unwrap();
        wire.extend(encode(b"").unwrap());
        wire.extend(encode(b"second").unwrap());
        let mut reader = wire.as_slice();

        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), br#"{"ch":1}"#);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_fails_on_truncated_payload() {
        let mut reader: &[u8] = b"00000010only-six";
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(BridgeError::Framing(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn read_frame_fails_on_truncated_prefix() {
        let mut reader: &[u8] = b"0000";
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(BridgeError::Framing(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn read_frame_fails_on_non_hex_prefix() {
        let mut reader: &[u8] = b"ChStatus_all";
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(BridgeError::Framing(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn write_frame_then_read_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = vec![b'x'; 1000];
        let expected = payload.clone();

        let writer = tokio::spawn(async move { write_frame(&mut client, &payload).await });
        let got = read_frame(&mut server).await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, expected);
    }
}
