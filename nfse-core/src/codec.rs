//! Transport codec: gzip + base64 wrapping of XML documents.
use base64ct::{Base64, Encoding};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use thiserror::Error;

/// Decompressed payloads larger than this are refused.
pub const MAX_DECODED_LEN: u64 = 16 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors raised while decoding a transport envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is empty")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("payload is not gzip compressed")]
    NotGzip,
    #[error("gzip stream is corrupt or truncated: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed payload exceeds {MAX_DECODED_LEN} bytes")]
    TooLarge,
    #[error("decoded document is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("gzip compression failed: {0}")]
    Compress(#[source] std::io::Error),
}

/// Compress and base64-encode an XML document for the wire.
///
/// # Examples
/// ```rust
/// use nfse_core::codec::{decode, encode};
///
/// let wire = encode("<DPS/>")?;
/// assert_eq!(decode(&wire)?, "<DPS/>");
/// # Ok::<(), nfse_core::codec::CodecError>(())
/// ```
pub fn encode(xml: &str) -> Result<String, CodecError> {
    encode_bytes(xml.as_bytes())
}

pub fn encode_bytes(bytes: &[u8]) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes).map_err(CodecError::Compress)?;
    let compressed = encoder.finish().map_err(CodecError::Compress)?;
    Ok(Base64::encode_string(&compressed))
}

/// Invert [`encode`]. The result must be UTF-8.
pub fn decode(encoded: &str) -> Result<String, CodecError> {
    let bytes = decode_bytes(encoded)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, CodecError> {
    // Some gateways wrap base64 at 76 columns.
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(CodecError::Empty);
    }
    let compressed =
        Base64::decode_vec(&compact).map_err(|e| CodecError::Base64(e.to_string()))?;
    if !compressed.starts_with(&GZIP_MAGIC) {
        return Err(CodecError::NotGzip);
    }

    let mut out = Vec::with_capacity(compressed.len() * 4);
    GzDecoder::new(compressed.as_slice())
        .take(MAX_DECODED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    if out.len() as u64 > MAX_DECODED_LEN {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?><DPS versao="1.00"><infDPS Id="DPS1"/></DPS>"#;
        let wire = encode(xml).expect("encode");
        assert_eq!(decode(&wire).expect("decode"), xml);
    }

    #[test]
    fn round_trips_utf8_and_binary_payloads() {
        let text = "Serviço de manutenção – São Paulo";
        assert_eq!(decode(&encode(text).expect("encode")).expect("decode"), text);

        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let wire = encode_bytes(&binary).expect("encode");
        assert_eq!(decode_bytes(&wire).expect("decode"), binary);
    }

    #[test]
    fn tolerates_line_wrapped_base64() {
        let wire = encode("<NFSe/>").expect("encode");
        let wrapped: String = wire
            .as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).expect("ascii"))
            .collect::<Vec<_>>()
            .join("\r\n");
        assert_eq!(decode(&wrapped).expect("decode"), "<NFSe/>");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode(""), Err(CodecError::Empty)));
        assert!(matches!(decode("not base64!"), Err(CodecError::Base64(_))));
        let plain = Base64::encode_string(b"<xml/>");
        assert!(matches!(decode(&plain), Err(CodecError::NotGzip)));
    }

    #[test]
    fn rejects_truncated_stream() {
        let wire = encode(&"<a>payload</a>".repeat(64)).expect("encode");
        let mut compressed = Base64::decode_vec(&wire).expect("b64");
        compressed.truncate(compressed.len() / 2);
        let truncated = Base64::encode_string(&compressed);
        assert!(matches!(decode(&truncated), Err(CodecError::Decompress(_))));
    }

    #[test]
    fn rejects_non_utf8_text() {
        let wire = encode_bytes(&[0xff, 0xfe, 0x00]).expect("encode");
        assert!(matches!(decode(&wire), Err(CodecError::Utf8(_))));
    }
}
