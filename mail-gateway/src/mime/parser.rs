use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use tracing::debug;

use super::address::{parse_address, parse_address_list};
use super::encoding::{decode_quoted_printable, decode_text, decode_transfer_encoding};
use super::headers::{decode_mime_sentence, parse_header_block, parse_media_type, split_head_body, Headers};
use super::types::{Address, Attachment, EmbeddedFile, ParsedMessage};
use super::MimeError;

const DEFAULT_ATTACHMENT_NAME: &str = "unnamed_attachment";
const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";

/// Deepest multipart nesting accepted before the message is rejected
pub const MAX_MULTIPART_DEPTH: usize = 32;

/// MIME message decoder
pub struct MimeParser;

impl MimeParser {
    /// Decode a raw RFC 5322 message.
    pub fn parse(raw: &[u8]) -> Result<ParsedMessage, MimeError> {
        let (head, body) = split_head_body(raw);
        if head.is_empty() {
            return Err(MimeError::MissingHeaders);
        }
        let raw_headers = parse_header_block(head)?;

        let mut msg = ParsedMessage::default();
        Self::project_headers(&raw_headers, &mut msg)?;
        msg.headers = raw_headers.decoded();

        let (media, params) = media_type_of(&raw_headers)?;
        let encoding = raw_headers.get("Content-Transfer-Encoding");
        let media = if media.is_empty() { "text/plain".to_string() } else { media };

        debug!(content_type = %media, "Decoding message body");

        match media.as_str() {
            "text/plain" => msg.text_body = text_of(body, encoding)?,
            "text/html" => msg.html_body = text_of(body, encoding)?,
            "multipart/mixed" => {
                Self::parse_mixed(body, boundary_of(&media, &params)?, &mut msg, 1)?
            }
            "multipart/alternative" | "multipart/related" => {
                Self::parse_alternative(body, boundary_of(&media, &params)?, &media, &mut msg, 1)?
            }
            _ => msg.content = decode_transfer_encoding(body, encoding)?,
        }
        msg.content_type = media;

        Ok(msg)
    }

    fn project_headers(headers: &Headers, msg: &mut ParsedMessage) -> Result<(), MimeError> {
        let mut p = HeaderProjector::new(headers);

        msg.subject = decode_mime_sentence(headers.get("Subject"));
        msg.from = p.address_list("From");
        msg.sender = p.address("Sender");
        msg.reply_to = p.address_list("Reply-To");
        msg.to = p.address_list("To");
        msg.cc = p.address_list("Cc");
        msg.bcc = p.address_list("Bcc");
        msg.date = p.date("Date");
        msg.message_id = message_id(headers.get("Message-Id"));
        msg.in_reply_to = id_list(headers.get("In-Reply-To"));
        msg.references = id_list(headers.get("References"));

        msg.resent_from = p.address_list("Resent-From");
        msg.resent_sender = p.address("Resent-Sender");
        msg.resent_to = p.address_list("Resent-To");
        msg.resent_cc = p.address_list("Resent-Cc");
        msg.resent_bcc = p.address_list("Resent-Bcc");
        msg.resent_date = p.date("Resent-Date");
        msg.resent_message_id = message_id(headers.get("Resent-Message-Id"));

        p.finish()
    }

    fn parse_mixed(
        body: &[u8],
        boundary: &str,
        msg: &mut ParsedMessage,
        depth: usize,
    ) -> Result<(), MimeError> {
        check_depth(depth)?;
        for part in split_multipart(body, boundary)? {
            let (media, params) = media_type_of(&part.headers)?;
            match media.as_str() {
                "text/plain" if !part.is_attachment() => {
                    msg.text_body.push_str(&text_of(&part.body, &part.encoding)?)
                }
                "text/html" if !part.is_attachment() => {
                    msg.html_body.push_str(&text_of(&part.body, &part.encoding)?)
                }
                "multipart/mixed" => {
                    Self::parse_mixed(&part.body, boundary_of(&media, &params)?, msg, depth + 1)?
                }
                "multipart/alternative" | "multipart/related" => Self::parse_alternative(
                    &part.body,
                    boundary_of(&media, &params)?,
                    &media,
                    msg,
                    depth + 1,
                )?,
                _ => {
                    if part.filename().is_none() && !part.is_attachment() {
                        return Err(MimeError::UnknownPart {
                            container: "multipart/mixed",
                            content_type: media,
                        });
                    }
                    msg.attachments.push(Self::decode_attachment(&part, media)?);
                }
            }
        }
        Ok(())
    }

    fn parse_alternative(
        body: &[u8],
        boundary: &str,
        container: &str,
        msg: &mut ParsedMessage,
        depth: usize,
    ) -> Result<(), MimeError> {
        check_depth(depth)?;
        for part in split_multipart(body, boundary)? {
            let (media, params) = media_type_of(&part.headers)?;
            match media.as_str() {
                "text/plain" => msg.text_body.push_str(&text_of(&part.body, &part.encoding)?),
                "text/html" => msg.html_body.push_str(&text_of(&part.body, &part.encoding)?),
                "multipart/alternative" | "multipart/related" => Self::parse_alternative(
                    &part.body,
                    boundary_of(&media, &params)?,
                    &media,
                    msg,
                    depth + 1,
                )?,
                _ => {
                    if part.encoding.is_empty() {
                        return Err(MimeError::UnknownPart {
                            container: if container == "multipart/related" {
                                "multipart/related"
                            } else {
                                "multipart/alternative"
                            },
                            content_type: media,
                        });
                    }
                    msg.embedded_files.push(Self::decode_embedded(&part)?);
                }
            }
        }
        Ok(())
    }

    fn decode_attachment(part: &RawPart, media: String) -> Result<Attachment, MimeError> {
        let data = decode_transfer_encoding(&part.body, &part.encoding)?;
        let filename = part
            .filename()
            .unwrap_or_else(|| DEFAULT_ATTACHMENT_NAME.to_string());
        let content_type = if media.is_empty() {
            DEFAULT_ATTACHMENT_TYPE.to_string()
        } else {
            media
        };

        debug!(%filename, %content_type, size = data.len(), "Decoded attachment");
        Ok(Attachment {
            filename,
            content_type,
            data,
        })
    }

    fn decode_embedded(part: &RawPart) -> Result<EmbeddedFile, MimeError> {
        let data = decode_transfer_encoding(&part.body, &part.encoding)?;
        let content_id = part
            .headers
            .get("Content-Id")
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();

        Ok(EmbeddedFile {
            content_id,
            content_type: part.headers.get("Content-Type").to_string(),
            data,
        })
    }
}

/// One body part of a multipart entity.
///
/// Quoted-printable bodies are decoded on construction and their encoding
/// cleared; every other encoding is left for the consumer.
#[derive(Debug)]
struct RawPart {
    headers: Headers,
    encoding: String,
    body: Vec<u8>,
}

impl RawPart {
    fn new(raw: &[u8]) -> Result<Self, MimeError> {
        let (head, body) = split_head_body(raw);
        let headers = parse_header_block(head)?;
        let encoding = headers.get("Content-Transfer-Encoding").trim().to_lowercase();

        if encoding == "quoted-printable" {
            return Ok(RawPart {
                headers,
                encoding: String::new(),
                body: decode_quoted_printable(body),
            });
        }

        Ok(RawPart {
            headers,
            encoding,
            body: body.to_vec(),
        })
    }

    fn disposition(&self) -> Option<(String, HashMap<String, String>)> {
        let value = self.headers.get("Content-Disposition");
        if value.is_empty() {
            return None;
        }
        parse_media_type(value).ok()
    }

    fn is_attachment(&self) -> bool {
        matches!(self.disposition(), Some((kind, _)) if kind == "attachment")
    }

    /// Filename from Content-Disposition, falling back to Content-Type `name`.
    fn filename(&self) -> Option<String> {
        let from_disposition = self
            .disposition()
            .and_then(|(_, mut params)| params.remove("filename"));
        let name = from_disposition.or_else(|| {
            parse_media_type(self.headers.get("Content-Type"))
                .ok()
                .and_then(|(_, mut params)| params.remove("name"))
        })?;

        let name = decode_mime_sentence(&name);
        let base = name
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        (!base.is_empty()).then_some(base)
    }
}

/// Split a multipart body at `--boundary` lines.
///
/// The preamble and epilogue are discarded; the line break before each
/// delimiter belongs to the delimiter. A missing close delimiter is an error.
fn check_depth(depth: usize) -> Result<(), MimeError> {
    if depth > MAX_MULTIPART_DEPTH {
        debug!(depth, "Multipart nesting too deep");
        return Err(MimeError::NestingTooDeep(MAX_MULTIPART_DEPTH));
    }
    Ok(())
}

fn split_multipart(body: &[u8], boundary: &str) -> Result<Vec<RawPart>, MimeError> {
    let delimiter = format!("--{}", boundary);
    let close = format!("--{}--", boundary);

    let mut parts = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut closed = false;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let trimmed = trim_line_end(line);
        if trimmed == close.as_bytes() {
            if let Some(content) = current.take() {
                parts.push(RawPart::new(strip_final_newline(&content))?);
            }
            closed = true;
            break;
        }
        if trimmed == delimiter.as_bytes() {
            if let Some(content) = current.take() {
                parts.push(RawPart::new(strip_final_newline(&content))?);
            }
            current = Some(Vec::new());
            continue;
        }
        if let Some(content) = current.as_mut() {
            content.extend_from_slice(line);
        }
    }

    if !closed {
        return Err(MimeError::Multipart(format!(
            "missing close delimiter {}",
            close
        )));
    }

    Ok(parts)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

fn strip_final_newline(content: &[u8]) -> &[u8] {
    content
        .strip_suffix(b"\r\n")
        .or_else(|| content.strip_suffix(b"\n"))
        .unwrap_or(content)
}

fn media_type_of(headers: &Headers) -> Result<(String, HashMap<String, String>), MimeError> {
    let value = headers.get("Content-Type");
    if value.trim().is_empty() {
        return Ok((String::new(), HashMap::new()));
    }
    parse_media_type(value)
}

fn boundary_of<'a>(media: &str, params: &'a HashMap<String, String>) -> Result<&'a str, MimeError> {
    params
        .get("boundary")
        .map(String::as_str)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| MimeError::MissingBoundary(media.to_string()))
}

fn text_of(body: &[u8], encoding: &str) -> Result<String, MimeError> {
    let decoded = decode_text(body, encoding)?;
    let text = String::from_utf8_lossy(&decoded);
    let text = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(&text);
    Ok(text.to_string())
}

fn message_id(value: &str) -> String {
    value
        .trim_matches(|c: char| c == '<' || c == '>' || c == ' ')
        .to_string()
}

fn id_list(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

/// Header projections that remember the first failure instead of aborting.
struct HeaderProjector<'a> {
    headers: &'a Headers,
    err: Option<MimeError>,
}

impl<'a> HeaderProjector<'a> {
    fn new(headers: &'a Headers) -> Self {
        HeaderProjector { headers, err: None }
    }

    fn fail(&mut self, err: MimeError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn address_list(&mut self, name: &str) -> Vec<Address> {
        let value = self.headers.get(name);
        if value.trim().is_empty() {
            return Vec::new();
        }
        match parse_address_list(value) {
            Ok(list) => list,
            Err(reason) => {
                self.fail(MimeError::InvalidAddress {
                    header: name.to_string(),
                    reason,
                });
                Vec::new()
            }
        }
    }

    fn address(&mut self, name: &str) -> Option<Address> {
        let value = self.headers.get(name);
        if value.trim().is_empty() {
            return None;
        }
        match parse_address(value) {
            Ok(addr) => Some(addr),
            Err(reason) => {
                self.fail(MimeError::InvalidAddress {
                    header: name.to_string(),
                    reason,
                });
                None
            }
        }
    }

    fn date(&mut self, name: &str) -> Option<DateTime<FixedOffset>> {
        let value = self.headers.get(name);
        if value.trim().is_empty() {
            return None;
        }
        let parsed = parse_date(value);
        if parsed.is_none() {
            self.fail(MimeError::InvalidDate {
                header: name.to_string(),
                value: value.to_string(),
            });
        }
        parsed
    }

    fn finish(self) -> Result<(), MimeError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// RFC 1123 dates with numeric zone, optionally followed by a `(MST)` comment.
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let mut value = value.trim();
    if value.ends_with(')') {
        if let Some(open) = value.rfind('(') {
            value = value[..open].trim_end();
        }
    }

    DateTime::parse_from_rfc2822(value)
        .ok()
        .or_else(|| DateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S %z").ok())
        .or_else(|| DateTime::parse_from_str(value, "%d %b %Y %H:%M:%S %z").ok())
}
