//! DKIM canonicalization (RFC 6376 section 3.4)

/// `simple` or `relaxed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Canonicalization {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Some(Canonicalization::Simple),
            "relaxed" => Some(Canonicalization::Relaxed),
            _ => None,
        }
    }

    /// Parse a `c=` tag into header and body modes. `relaxed` alone means
    /// `relaxed/simple`; an empty tag means `simple/simple`.
    pub fn parse_pair(tag: &str) -> Option<(Self, Self)> {
        if tag.trim().is_empty() {
            return Some((Canonicalization::Simple, Canonicalization::Simple));
        }
        match tag.split_once('/') {
            Some((header, body)) => Some((Self::parse(header)?, Self::parse(body)?)),
            None => Some((Self::parse(tag)?, Canonicalization::Simple)),
        }
    }
}

/// Header fields in message order (unfolded) and the body.
pub struct SplitMessage<'a> {
    pub headers: Vec<(String, String)>,
    pub body: &'a [u8],
}

impl SplitMessage<'_> {
    /// All values of a field, in order. Names compare case-insensitively.
    pub fn values<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s str> + 's {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Split on the first CRLFCRLF and unfold the header block.
///
/// Continuation lines are appended with a single space; lines without a
/// colon are ignored.
pub fn split_message(raw: &[u8]) -> SplitMessage<'_> {
    let (head, body) = match find(raw, b"\r\n\r\n") {
        Some(pos) => (&raw[..pos], &raw[pos + 4..]),
        None => (raw, &raw[raw.len()..]),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(head).split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    SplitMessage { headers, body }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Collapse whitespace runs to one space and trim.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical header block for the `h=` list, followed by the signature header.
///
/// Every occurrence of each listed field is emitted as `name:value`. The
/// `DKIM-Signature` value is emitted last with its `b=` tag removed.
pub fn canonicalize_headers(
    message: &SplitMessage<'_>,
    signed_headers: &[String],
    mode: Canonicalization,
) -> Vec<u8> {
    let mut lines = Vec::new();

    for name in signed_headers {
        for value in message.values(name) {
            lines.push(match mode {
                Canonicalization::Relaxed => {
                    format!("{}:{}", name.to_lowercase(), collapse_whitespace(value))
                }
                Canonicalization::Simple => format!("{}:{}", name, value),
            });
        }
    }

    for value in message.values("DKIM-Signature") {
        let value = match mode {
            Canonicalization::Relaxed => collapse_whitespace(value),
            Canonicalization::Simple => value.to_string(),
        };
        lines.push(format!("dkim-signature:{}", strip_signature_tag(&value)));
    }

    let mut out = lines.join("\r\n").into_bytes();
    out.extend_from_slice(b"\r\n");
    out
}

/// Drop the `b=` segment from a tag list, keeping every other byte.
pub fn strip_signature_tag(value: &str) -> String {
    value
        .split(';')
        .filter(|part| !part.trim_start().starts_with("b="))
        .collect::<Vec<_>>()
        .join(";")
}

pub fn canonicalize_body(body: &[u8], mode: Canonicalization) -> Vec<u8> {
    match mode {
        Canonicalization::Relaxed => {
            let text = String::from_utf8_lossy(body);
            let mut lines: Vec<&str> = text
                .split("\r\n")
                .map(|line| line.trim_end_matches(|c| c == ' ' || c == '\t'))
                .collect();
            while lines.last().map_or(false, |line| line.is_empty()) {
                lines.pop();
            }
            let mut out = lines.join("\r\n").into_bytes();
            out.extend_from_slice(b"\r\n");
            out
        }
        Canonicalization::Simple => {
            let mut out = body.to_vec();
            if !out.ends_with(b"\r\n") {
                out.extend_from_slice(b"\r\n");
            }
            out
        }
    }
}
