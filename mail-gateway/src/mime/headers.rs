//! RFC 822 header block handling
//!
//! Splitting a raw message into header block and body, unfolding header
//! lines, RFC 2047 encoded-word decoding and `Content-Type` parameter parsing.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::MimeError;

/// Header fields keyed by canonical name (`Content-Type`, `Message-Id`, ...).
///
/// Repeated fields keep every value in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: String) {
        self.0.entry(canonical_key(name)).or_default().push(value);
    }

    /// First value of a field, empty string when absent.
    pub fn get(&self, name: &str) -> &str {
        self.0
            .get(&canonical_key(name))
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&canonical_key(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&canonical_key(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Copy of this map with every value passed through [`decode_mime_sentence`].
    pub fn decoded(&self) -> Headers {
        Headers(
            self.0
                .iter()
                .map(|(name, values)| {
                    (
                        name.clone(),
                        values.iter().map(|v| decode_mime_sentence(v)).collect(),
                    )
                })
                .collect(),
        )
    }
}

/// `content-TYPE` -> `Content-Type`
pub fn canonical_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.trim().chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        upper = ch == '-';
    }
    out
}

/// Split a raw message at the first empty line.
///
/// A message without an empty line is all header. Returns the header block
/// (without the separator) and the body.
pub fn split_head_body(raw: &[u8]) -> (&[u8], &[u8]) {
    // An empty first line means no headers at all.
    if raw.starts_with(b"\r\n") {
        return (&[], &raw[2..]);
    }
    if raw.starts_with(b"\n") {
        return (&[], &raw[1..]);
    }

    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            let rest = &raw[i + 1..];
            if rest.starts_with(b"\r\n") {
                return (&raw[..i + 1], &rest[2..]);
            }
            if rest.starts_with(b"\n") {
                return (&raw[..i + 1], &rest[1..]);
            }
        }
        i += 1;
    }

    (raw, &[])
}

/// Parse a header block into fields, unfolding continuation lines.
pub fn parse_header_block(block: &[u8]) -> Result<Headers, MimeError> {
    let text = String::from_utf8_lossy(block);
    let mut headers = Headers::new();
    let mut current: Option<(String, String)> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            match current {
                Some((_, ref mut value)) => {
                    let folded = line.trim();
                    if !folded.is_empty() {
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(folded);
                    }
                }
                None => return Err(MimeError::MalformedHeader(line.to_string())),
            }
            continue;
        }

        let colon = line
            .find(':')
            .ok_or_else(|| MimeError::MalformedHeader(line.to_string()))?;
        let name = line[..colon].trim_end();
        if name.is_empty() || name.contains(' ') {
            return Err(MimeError::MalformedHeader(line.to_string()));
        }

        if let Some((name, value)) = current.take() {
            headers.append(&name, value);
        }
        current = Some((name.to_string(), line[colon + 1..].trim().to_string()));
    }

    if let Some((name, value)) = current {
        headers.append(&name, value);
    }

    Ok(headers)
}

/// Decode a header value word by word.
///
/// Words that decode as RFC 2047 encoded-words are appended as-is; anything
/// else is passed through with its leading space preserved.
pub fn decode_mime_sentence(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, word) in s.split(' ').enumerate() {
        match decode_encoded_word(word) {
            Some(decoded) => out.push_str(&decoded),
            None => {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(word);
            }
        }
    }
    out
}

/// Decode a single `=?charset?encoding?text?=` word.
pub fn decode_encoded_word(word: &str) -> Option<String> {
    let inner = word.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut fields = inner.splitn(3, '?');
    let charset = fields.next()?;
    let encoding = fields.next()?;
    let text = fields.next()?;
    if charset.is_empty() || text.contains('?') {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => general_purpose::STANDARD.decode(text).ok()?,
        "Q" | "q" => decode_q(text)?,
        _ => return None,
    };

    // RFC 2231 language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset).to_lowercase();
    match charset.as_str() {
        "utf-8" | "utf8" | "us-ascii" => String::from_utf8(bytes).ok(),
        "iso-8859-1" | "latin1" | "latin-1" => Some(bytes.iter().map(|&b| b as char).collect()),
        _ => None,
    }
}

fn decode_q(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = text.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Some(out)
}

/// Parse a `Content-Type`/`Content-Disposition` value.
///
/// Returns the lower-cased media type and its parameters (lower-cased keys,
/// unquoted values, RFC 2231 extended values decoded).
pub fn parse_media_type(value: &str) -> Result<(String, HashMap<String, String>), MimeError> {
    let invalid = || MimeError::InvalidContentType(value.to_string());

    let (media, mut rest) = match value.find(';') {
        Some(pos) => (&value[..pos], &value[pos..]),
        None => (value, ""),
    };
    let media = media.trim().to_lowercase();
    if media.is_empty() {
        return Err(invalid());
    }
    let mut pieces = media.splitn(2, '/');
    let major = pieces.next().unwrap_or("");
    if !is_token(major) {
        return Err(invalid());
    }
    if let Some(minor) = pieces.next() {
        if !is_token(minor) {
            return Err(invalid());
        }
    }

    let mut params = HashMap::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest.strip_prefix(';').ok_or_else(invalid)?.trim_start();
        if rest.is_empty() {
            // trailing semicolon
            break;
        }

        let eq = rest.find('=').ok_or_else(invalid)?;
        let key = rest[..eq].trim().to_lowercase();
        if !is_token(&key) {
            return Err(invalid());
        }
        rest = rest[eq + 1..].trim_start();

        let val = if let Some(quoted) = rest.strip_prefix('"') {
            let mut val = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((idx, ch)) = chars.next() {
                match ch {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            val.push(escaped);
                        }
                    }
                    '"' => {
                        end = Some(idx);
                        break;
                    }
                    _ => val.push(ch),
                }
            }
            let end = end.ok_or_else(invalid)?;
            rest = &quoted[end + 1..];
            val
        } else {
            let end = rest.find(|c: char| c == ';' || c.is_whitespace()).unwrap_or(rest.len());
            let val = rest[..end].to_string();
            if val.is_empty() {
                return Err(invalid());
            }
            rest = &rest[end..];
            val
        };

        match key.strip_suffix('*') {
            Some(base) => {
                params.insert(base.to_string(), decode_rfc2231(&val));
            }
            None => {
                params.entry(key).or_insert(val);
            }
        }
    }

    Ok((media, params))
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?=".contains(c)
        })
}

/// `utf-8''na%C3%AFve.txt` -> `naïve.txt`
fn decode_rfc2231(value: &str) -> String {
    let mut parts = value.splitn(3, '\'');
    let (charset, encoded) = match (parts.next(), parts.next(), parts.next()) {
        (Some(charset), Some(_lang), Some(encoded)) => (charset.to_lowercase(), encoded),
        _ => return value.to_string(),
    };

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(b) = encoded
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    if charset == "iso-8859-1" {
        out.iter().map(|&b| b as char).collect()
    } else {
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_head_body_crlf() {
        let (head, body) = split_head_body(b"From: a@b.c\r\nSubject: x\r\n\r\nBody");
        assert_eq!(head, b"From: a@b.c\r\nSubject: x\r\n");
        assert_eq!(body, b"Body");
    }

    #[test]
    fn test_split_head_body_lf() {
        let (head, body) = split_head_body(b"From: a@b.c\n\nBody\n");
        assert_eq!(head, b"From: a@b.c\n");
        assert_eq!(body, b"Body\n");
    }

    #[test]
    fn test_split_head_body_without_body() {
        let (head, body) = split_head_body(b"Subject: only headers\r\n");
        assert_eq!(head, b"Subject: only headers\r\n");
        assert!(body.is_empty());
    }

    #[test]
    fn test_parse_header_block_folded() {
        let headers =
            parse_header_block(b"Subject: This is a long\r\n  subject line\r\nto: x@y.z\r\n").unwrap();
        assert_eq!(headers.get("subject"), "This is a long subject line");
        assert_eq!(headers.get("To"), "x@y.z");
    }

    #[test]
    fn test_parse_header_block_repeated() {
        let headers = parse_header_block(b"Received: one\nReceived: two\n").unwrap();
        assert_eq!(headers.get_all("received"), &["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_parse_header_block_malformed() {
        assert!(matches!(
            parse_header_block(b"this is not a header\r\n"),
            Err(MimeError::MalformedHeader(_))
        ));
        assert!(parse_header_block(b"  leading continuation\r\n").is_err());
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("content-TYPE"), "Content-Type");
        assert_eq!(canonical_key("MESSAGE-ID"), "Message-Id");
        assert_eq!(canonical_key("dkim-signature"), "Dkim-Signature");
    }

    #[test]
    fn test_decode_encoded_word_base64() {
        assert_eq!(
            decode_encoded_word("=?UTF-8?B?SGVsbG8gV29ybGQ=?="),
            Some("Hello World".to_string())
        );
    }

    #[test]
    fn test_decode_encoded_word_q() {
        assert_eq!(
            decode_encoded_word("=?iso-8859-1?q?caf=E9_cr=E8me?="),
            Some("café crème".to_string())
        );
    }

    #[test]
    fn test_decode_encoded_word_rejects_plain() {
        assert_eq!(decode_encoded_word("hello"), None);
        assert_eq!(decode_encoded_word("=?koi8-r?B?AAAA?="), None);
    }

    #[test]
    fn test_decode_mime_sentence_preserves_spaces() {
        assert_eq!(decode_mime_sentence("Plain subject line"), "Plain subject line");
        assert_eq!(
            decode_mime_sentence("Re: =?UTF-8?Q?caf=C3=A9?= time"),
            "Re:café time"
        );
    }

    #[test]
    fn test_decode_mime_sentence_broken_word_passthrough() {
        assert_eq!(decode_mime_sentence("a =?UTF-8?B?!!!?="), "a =?UTF-8?B?!!!?=");
    }

    #[test]
    fn test_parse_media_type_with_boundary() {
        let (media, params) =
            parse_media_type("Multipart/Mixed; boundary=\"----=_Part_123\"; charset=utf-8").unwrap();
        assert_eq!(media, "multipart/mixed");
        assert_eq!(params.get("boundary").map(String::as_str), Some("----=_Part_123"));
        assert_eq!(params.get("charset").map(String::as_str), Some("utf-8"));
    }

    #[test]
    fn test_parse_media_type_disposition() {
        let (media, params) =
            parse_media_type("attachment; filename*=UTF-8''na%C3%AFve.txt").unwrap();
        assert_eq!(media, "attachment");
        assert_eq!(params.get("filename").map(String::as_str), Some("naïve.txt"));
    }

    #[test]
    fn test_parse_media_type_errors() {
        assert!(parse_media_type("").is_err());
        assert!(parse_media_type("text/plain; charset").is_err());
        assert!(parse_media_type("text/plain; name=\"unterminated").is_err());
        assert!(parse_media_type("text/pl ain").is_err());
    }
}
