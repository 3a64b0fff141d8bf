use base64::{engine::general_purpose, Engine as _};

use super::MimeError;

/// Decode a leaf payload according to its Content-Transfer-Encoding.
///
/// Supported: `base64` (non-empty result required), `7bit`, `8bit` and the
/// empty encoding. Anything else is rejected.
pub fn decode_transfer_encoding(body: &[u8], encoding: &str) -> Result<Vec<u8>, MimeError> {
    match encoding.trim().to_lowercase().as_str() {
        "base64" => {
            let decoded = decode_base64(body)?;
            if decoded.is_empty() {
                return Err(MimeError::EmptyPayload);
            }
            Ok(decoded)
        }
        "7bit" | "8bit" | "" => Ok(body.to_vec()),
        other => Err(MimeError::UnsupportedEncoding(other.to_string())),
    }
}

/// Decode a text body. Unknown encodings are read as-is.
pub fn decode_text(body: &[u8], encoding: &str) -> Result<Vec<u8>, MimeError> {
    match encoding.trim().to_lowercase().as_str() {
        "base64" => decode_base64(body),
        "quoted-printable" => Ok(decode_quoted_printable(body)),
        _ => Ok(body.to_vec()),
    }
}

pub fn decode_base64(content: &[u8]) -> Result<Vec<u8>, MimeError> {
    let cleaned: Vec<u8> = content
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .copied()
        .collect();

    Ok(general_purpose::STANDARD.decode(cleaned)?)
}

/// Decode quoted-printable content, keeping malformed escapes verbatim.
pub fn decode_quoted_printable(content: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(content.len());
    let mut i = 0;

    while i < content.len() {
        if content[i] != b'=' {
            result.push(content[i]);
            i += 1;
            continue;
        }

        // Soft line break
        match content.get(i + 1) {
            Some(b'\n') => {
                i += 2;
                continue;
            }
            Some(b'\r') => {
                i += if content.get(i + 2) == Some(&b'\n') { 3 } else { 2 };
                continue;
            }
            _ => {}
        }

        let byte = content
            .get(i + 1..i + 3)
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match byte {
            Some(b) => {
                result.push(b);
                i += 3;
            }
            None => {
                result.push(b'=');
                i += 1;
            }
        }
    }

    result
}
