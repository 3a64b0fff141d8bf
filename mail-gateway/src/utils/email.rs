use crate::error::{GatewayError, Result};

/// Basic email validation
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(GatewayError::InvalidEmail("Email is empty".to_string()));
    }

    if !email.contains('@') {
        return Err(GatewayError::InvalidEmail(
            "Email must contain @".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(GatewayError::InvalidEmail("Invalid email format".to_string()));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(GatewayError::InvalidEmail(
            "Email parts cannot be empty".to_string(),
        ));
    }

    if !domain.contains('.') {
        return Err(GatewayError::InvalidEmail(
            "Domain must contain a dot".to_string(),
        ));
    }

    Ok(())
}

/// Extract the lower-cased domain part of an address, tolerating `<...>` wrapping.
pub fn extract_domain(email: &str) -> Result<String> {
    let email = email.trim().trim_start_matches('<').trim_end_matches('>');
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[1].is_empty() {
        return Err(GatewayError::InvalidEmail(format!(
            "Invalid email address: {}",
            email
        )));
    }
    Ok(parts[1].to_lowercase())
}

/// Canonical key used to file mail per recipient.
pub fn normalize_address(address: &str) -> String {
    address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_email() {
        assert!(validate_email("test@example.com").is_ok());
        assert!(validate_email("user.name@example.co.uk").is_ok());
    }

    #[test]
    fn test_invalid_email() {
        assert!(validate_email("").is_err());
        assert!(validate_email("test").is_err());
        assert!(validate_email("test@").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("test@domain").is_err());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("user@Example.COM").unwrap(), "example.com");
        assert_eq!(extract_domain("<admin@mail.example.org>").unwrap(), "mail.example.org");
        assert!(extract_domain("invalid").is_err());
        assert!(extract_domain("a@b@c").is_err());
        assert!(extract_domain("user@").is_err());
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" <Bob@Example.com> "), "bob@example.com");
    }
}
