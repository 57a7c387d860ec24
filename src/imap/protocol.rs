use crate::imap::{ImapCapability, ImapError, ImapResult};
use base64::prelude::*;

/// Command formatting and response parsing for the subset of IMAP4rev1 the
/// sync engine speaks.
pub struct ImapProtocol;

impl ImapProtocol {
    /// Parse the untagged `* CAPABILITY` line(s) of a response
    pub fn parse_capabilities(lines: &[String]) -> Vec<ImapCapability> {
        let mut capabilities = Vec::new();

        for line in lines {
            let upper = line.to_ascii_uppercase();
            let rest = if let Some(rest) = upper.strip_prefix("* CAPABILITY ") {
                rest
            } else if let Some(start) = upper.find("[CAPABILITY ") {
                // Capabilities advertised in the greeting's response code
                let rest = &upper[start + "[CAPABILITY ".len()..];
                rest.split(']').next().unwrap_or("")
            } else {
                continue;
            };

            for capability in rest.split_whitespace() {
                capabilities.push(ImapCapability::from_str(capability));
            }
        }

        capabilities
    }

    /// Parse the untagged `* SEARCH` response into UIDs (or sequence numbers)
    pub fn parse_search_response(lines: &[String]) -> ImapResult<Vec<u32>> {
        let mut ids = Vec::new();

        for line in lines {
            let Some(rest) = line.strip_prefix("* SEARCH") else {
                continue;
            };

            for id_str in rest.split_whitespace() {
                let id = id_str
                    .parse::<u32>()
                    .map_err(|_| ImapError::protocol(format!("Invalid SEARCH result: {}", id_str)))?;
                ids.push(id);
            }
        }

        Ok(ids)
    }

    /// Quote a string argument, escaping backslashes and double quotes
    pub fn quote(value: &str) -> String {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    }

    /// Format CAPABILITY command
    pub fn format_capability() -> String {
        "CAPABILITY".to_string()
    }

    /// Format LOGIN command
    pub fn format_login(username: &str, password: &str) -> String {
        format!("LOGIN {} {}", Self::quote(username), Self::quote(password))
    }

    /// Format AUTHENTICATE PLAIN with an initial response (RFC 4959)
    pub fn format_authenticate_plain(username: &str, password: &str) -> String {
        // PLAIN SASL mechanism: \0username\0password
        let auth_string = format!("\0{}\0{}", username, password);
        let encoded = BASE64_STANDARD.encode(auth_string);
        format!("AUTHENTICATE PLAIN {}", encoded)
    }

    /// Format SELECT command
    pub fn format_select(mailbox: &str) -> String {
        format!("SELECT {}", Self::quote(mailbox))
    }

    /// Search for UIDs of messages without the \Seen flag
    pub fn format_uid_search_unseen() -> String {
        "UID SEARCH UNSEEN".to_string()
    }

    /// Fetch the full raw message without setting \Seen
    pub fn format_uid_fetch_raw(uid: u32) -> String {
        format!("UID FETCH {} BODY.PEEK[]", uid)
    }

    /// Format LOGOUT command
    pub fn format_logout() -> String {
        "LOGOUT".to_string()
    }

    /// Extract literal size from a line ending in `{size}`
    pub fn extract_literal_size(line: &str) -> Option<usize> {
        let line = line.trim_end();
        if !line.ends_with('}') {
            return None;
        }
        let start = line.rfind('{')?;
        let size_str = &line[start + 1..line.len() - 1];
        // LITERAL+ servers may echo "{n+}"
        size_str.trim_end_matches('+').parse::<usize>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_search_response() {
        let response = lines(&["* SEARCH 4 9 12", "A0003 OK SEARCH completed"]);
        assert_eq!(ImapProtocol::parse_search_response(&response).unwrap(), vec![4, 9, 12]);

        let empty = lines(&["* SEARCH", "A0003 OK SEARCH completed"]);
        assert!(ImapProtocol::parse_search_response(&empty).unwrap().is_empty());

        let garbage = lines(&["* SEARCH 4 x"]);
        assert!(ImapProtocol::parse_search_response(&garbage).is_err());
    }

    #[test]
    fn test_parse_capabilities() {
        let response = lines(&["* CAPABILITY IMAP4rev1 SASL-IR AUTH=PLAIN LOGINDISABLED"]);
        let caps = ImapProtocol::parse_capabilities(&response);
        assert!(caps.contains(&ImapCapability::Imap4Rev1));
        assert!(caps.contains(&ImapCapability::AuthPlain));
        assert!(caps.contains(&ImapCapability::LoginDisabled));

        let greeting = lines(&["* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] Dovecot ready."]);
        let caps = ImapProtocol::parse_capabilities(&greeting);
        assert_eq!(caps, vec![ImapCapability::Imap4Rev1, ImapCapability::AuthPlain]);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(ImapProtocol::quote("INBOX"), "\"INBOX\"");
        assert_eq!(ImapProtocol::quote("pa\"ss\\word"), "\"pa\\\"ss\\\\word\"");
        assert_eq!(
            ImapProtocol::format_login("a@b.com", "p\"w"),
            "LOGIN \"a@b.com\" \"p\\\"w\""
        );
    }

    #[test]
    fn test_authenticate_plain() {
        // base64("\0user\0pass")
        assert_eq!(
            ImapProtocol::format_authenticate_plain("user", "pass"),
            "AUTHENTICATE PLAIN AHVzZXIAcGFzcw=="
        );
    }

    #[test]
    fn test_fetch_uses_peek() {
        assert_eq!(ImapProtocol::format_uid_fetch_raw(42), "UID FETCH 42 BODY.PEEK[]");
        assert_eq!(ImapProtocol::format_uid_search_unseen(), "UID SEARCH UNSEEN");
    }

    #[test]
    fn test_extract_literal_size() {
        assert_eq!(ImapProtocol::extract_literal_size("* 1 FETCH (UID 7 BODY[] {342}"), Some(342));
        assert_eq!(ImapProtocol::extract_literal_size("* 1 FETCH (BODY[] {12+}"), Some(12));
        assert_eq!(ImapProtocol::extract_literal_size("* OK {not a literal"), None);
        assert_eq!(ImapProtocol::extract_literal_size("A0001 OK done"), None);
    }
}
