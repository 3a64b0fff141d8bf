use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(GatewayError::SmtpProtocol("Empty command".to_string()));
        }

        let (command, args) = match line.split_once(' ') {
            Some((command, args)) => (command.to_uppercase(), args.trim()),
            None => (line.to_uppercase(), ""),
        };

        match command.as_str() {
            "HELO" | "EHLO" => {
                if args.is_empty() {
                    return Err(GatewayError::SmtpProtocol(format!("{} requires domain", command)));
                }
                if command == "HELO" {
                    Ok(SmtpCommand::Helo(args.to_string()))
                } else {
                    Ok(SmtpCommand::Ehlo(args.to_string()))
                }
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_path(args, "TO:")?)),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// `FROM:<addr> [params]` or `TO:<addr> [params]`; ESMTP parameters
    /// such as `SIZE=` are ignored. An empty reverse path (`<>`) is allowed.
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        let rest = match args.get(..keyword.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(keyword) => {
                args[keyword.len()..].trim_start()
            }
            _ => {
                return Err(GatewayError::SmtpProtocol(format!(
                    "Invalid {} syntax",
                    keyword.trim_end_matches(':')
                )))
            }
        };
        let path = match rest.strip_prefix('<') {
            Some(inner) => match inner.split_once('>') {
                Some((address, _params)) => address,
                None => {
                    return Err(GatewayError::SmtpProtocol("Unterminated path".to_string()))
                }
            },
            None => rest.split_whitespace().next().unwrap_or(""),
        };

        Ok(path.trim().to_string())
    }
}
