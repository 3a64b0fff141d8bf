//! RFC 5322 mailbox and address-list parsing

use super::headers::decode_mime_sentence;
use super::types::Address;

/// Parse a comma separated address list.
///
/// Group syntax (`team: a@x.org, b@x.org;`) is flattened into its members;
/// an empty group contributes nothing.
pub fn parse_address_list(value: &str) -> Result<Vec<Address>, String> {
    let mut addresses = Vec::new();
    for (entry, in_group) in split_list(value)? {
        let entry = entry.trim();
        if entry.is_empty() {
            if in_group {
                continue;
            }
            return Err("no address".to_string());
        }
        addresses.push(parse_mailbox(entry)?);
    }
    Ok(addresses)
}

/// Parse a single mailbox.
pub fn parse_address(value: &str) -> Result<Address, String> {
    let mut list = parse_address_list(value)?;
    match list.len() {
        1 => Ok(list.remove(0)),
        0 => Err("no address".to_string()),
        _ => Err("expected single address".to_string()),
    }
}

/// Split at top-level commas, tracking quotes, comments, angle brackets and groups.
fn split_list(value: &str) -> Result<Vec<(String, bool)>, String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut in_angle = false;
    let mut comment_depth = 0usize;
    let mut in_group = false;
    let mut group_closed = false;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quote || comment_depth > 0 => {
                current.push(ch);
                escaped = true;
            }
            '"' if comment_depth == 0 => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '(' if !in_quote => {
                comment_depth += 1;
                current.push(ch);
            }
            ')' if !in_quote && comment_depth > 0 => {
                comment_depth -= 1;
                current.push(ch);
            }
            '<' if !in_quote && comment_depth == 0 => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quote && comment_depth == 0 => {
                in_angle = false;
                current.push(ch);
            }
            ':' if !in_quote && !in_angle && comment_depth == 0 && !in_group => {
                // group display name is dropped
                current.clear();
                in_group = true;
            }
            ';' if !in_quote && !in_angle && comment_depth == 0 && in_group => {
                entries.push((std::mem::take(&mut current), true));
                in_group = false;
                group_closed = true;
            }
            ',' if !in_quote && !in_angle && comment_depth == 0 => {
                entries.push((std::mem::take(&mut current), in_group || group_closed));
                group_closed = false;
            }
            _ => current.push(ch),
        }
    }

    if in_quote {
        return Err("unclosed quoted-string".to_string());
    }
    if comment_depth > 0 {
        return Err("misformatted parenthetical comment".to_string());
    }
    if in_angle {
        return Err("unclosed angle-addr".to_string());
    }
    if in_group {
        return Err("unclosed group".to_string());
    }
    if !current.trim().is_empty() || entries.is_empty() {
        entries.push((current, false));
    }
    Ok(entries)
}

fn parse_mailbox(entry: &str) -> Result<Address, String> {
    let (stripped, comment) = strip_comments(entry);
    let stripped = stripped.trim();

    if let Some(open) = find_unquoted(stripped, '<') {
        let close = stripped[open..]
            .find('>')
            .map(|pos| open + pos)
            .ok_or_else(|| "unclosed angle-addr".to_string())?;
        if !stripped[close + 1..].trim().is_empty() {
            return Err(format!("expected single address, got {:?}", &stripped[close + 1..]));
        }
        let address = validate_addr_spec(stripped[open + 1..close].trim())?;
        let name = display_name(stripped[..open].trim());
        return Ok(Address {
            name: name.or(comment),
            address,
        });
    }

    let address = validate_addr_spec(stripped)?;
    Ok(Address {
        name: comment,
        address,
    })
}

fn display_name(phrase: &str) -> Option<String> {
    if phrase.is_empty() {
        return None;
    }
    let name = if phrase.starts_with('"') && phrase.ends_with('"') && phrase.len() >= 2 {
        unquote(&phrase[1..phrase.len() - 1])
    } else {
        decode_mime_sentence(phrase)
    };
    let name = name.trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn unquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Remove `(...)` comments outside quotes, returning the first non-empty one.
fn strip_comments(s: &str) -> (String, Option<String>) {
    let mut out = String::with_capacity(s.len());
    let mut comment = String::new();
    let mut first = None;
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if depth > 0 {
                comment.push(ch);
            } else {
                out.push(ch);
            }
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                if depth == 0 {
                    out.push(ch);
                }
            }
            '"' if depth == 0 => {
                in_quote = !in_quote;
                out.push(ch);
            }
            '(' if !in_quote => {
                if depth > 0 {
                    comment.push(ch);
                }
                depth += 1;
            }
            ')' if !in_quote && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let text = comment.trim();
                    if first.is_none() && !text.is_empty() {
                        first = Some(text.to_string());
                    }
                    comment.clear();
                } else {
                    comment.push(ch);
                }
            }
            _ if depth > 0 => comment.push(ch),
            _ => out.push(ch),
        }
    }

    (out, first)
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quote => escaped = true,
            '"' => in_quote = !in_quote,
            c if c == needle && !in_quote => return Some(idx),
            _ => {}
        }
    }
    None
}

fn validate_addr_spec(spec: &str) -> Result<String, String> {
    let at = spec
        .rfind('@')
        .ok_or_else(|| "missing @ in addr-spec".to_string())?;
    let local = &spec[..at];
    let domain = &spec[at + 1..];

    if local.is_empty() {
        return Err("no local part in addr-spec".to_string());
    }
    if domain.is_empty() {
        return Err("no domain in addr-spec".to_string());
    }

    let quoted_local = local.len() >= 2 && local.starts_with('"') && local.ends_with('"');
    if !quoted_local
        && local
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "()<>[]:;@\\,\"".contains(c))
    {
        return Err(format!("invalid local part {:?}", local));
    }

    let literal = domain.starts_with('[') && domain.ends_with(']');
    if !literal
        && domain
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "()<>[]:;@\\,\"".contains(c))
    {
        return Err(format!("invalid domain {:?}", domain));
    }

    Ok(spec.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_address() {
        let addr = parse_address("alice@example.com").unwrap();
        assert_eq!(addr.address, "alice@example.com");
        assert_eq!(addr.name, None);
    }

    #[test]
    fn test_parse_named_address() {
        let addr = parse_address("Alice Smith <alice@example.com>").unwrap();
        assert_eq!(addr.address, "alice@example.com");
        assert_eq!(addr.name.as_deref(), Some("Alice Smith"));
    }

    #[test]
    fn test_parse_quoted_name_with_comma() {
        let list = parse_address_list("\"Smith, Alice\" <alice@example.com>, bob@example.org").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name.as_deref(), Some("Smith, Alice"));
        assert_eq!(list[1].address, "bob@example.org");
    }

    #[test]
    fn test_parse_encoded_display_name() {
        let addr = parse_address("=?UTF-8?B?SsO2cmc=?= <jorg@example.de>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Jörg"));
    }

    #[test]
    fn test_comment_used_as_name() {
        let addr = parse_address("carol@example.net (Carol)").unwrap();
        assert_eq!(addr.address, "carol@example.net");
        assert_eq!(addr.name.as_deref(), Some("Carol"));
    }

    #[test]
    fn test_group_syntax() {
        let list = parse_address_list("team: a@x.org, b@x.org;, c@y.org").unwrap();
        let addrs: Vec<_> = list.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addrs, ["a@x.org", "b@x.org", "c@y.org"]);

        assert!(parse_address_list("undisclosed-recipients:;").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(parse_address("not an address").is_err());
        assert!(parse_address("@example.com").is_err());
        assert!(parse_address("user@").is_err());
        assert!(parse_address("Bob <bob@example.com").is_err());
        assert!(parse_address_list("a@b.c,,d@e.f").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_single_address_rejects_list() {
        assert!(parse_address("a@b.c, d@e.f").is_err());
    }
}
