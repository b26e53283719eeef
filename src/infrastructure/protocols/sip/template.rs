//! Message templates and placeholder substitution
//!
//! A template is an ordered list of header lines containing `#key#`
//! placeholders. Filling is a single left-to-right pass, so text that
//! came from a substituted value is never scanned again.

use super::message::SipError;
use std::collections::BTreeMap;

/// Substitution values keyed by placeholder name (without delimiters)
pub type Substitutions = BTreeMap<String, String>;

const DELIMITER: char = '#';

/// Line inserted into the authenticated form of a template
const AUTHORIZATION: &str = "#auth_header#: Digest username=\"#username#\",realm=\"#realm#\",nonce=\"#nonce#\",uri=\"#auth_uri#\",response=\"#response#\",algorithm=MD5";

/// Header lines of one request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    lines: &'static [&'static str],
}

impl Template {
    pub const fn new(name: &'static str, lines: &'static [&'static str]) -> Self {
        Self { name, lines }
    }

    pub fn lines(&self) -> &'static [&'static str] {
        self.lines
    }

    /// Lines of the unauthenticated form, or the authenticated form with the
    /// credentials line placed just before `Content-Length`
    pub fn variant(&self, authenticated: bool) -> Vec<&'static str> {
        let mut lines = self.lines.to_vec();
        if authenticated {
            let at = lines
                .iter()
                .position(|l| l.starts_with("Content-Length"))
                .unwrap_or(lines.len());
            lines.insert(at, AUTHORIZATION);
        }
        lines
    }
}

pub const REGISTER: Template = Template::new(
    "register",
    &[
        "REGISTER sip:#server_host#:#server_port# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#;transport=udp>",
        "To: <sip:#username#@#server_host#:#server_port#>",
        "From: <sip:#username#@#server_host#:#server_port#>;tag=#local_tag#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# REGISTER",
        "Expires: #expires#",
        "Allow: #allow#",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const UNREGISTER: Template = Template::new(
    "unregister",
    &[
        "REGISTER sip:#server_host#:#server_port# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#;transport=udp>;expires=0",
        "To: <sip:#username#@#server_host#:#server_port#>",
        "From: <sip:#username#@#server_host#:#server_port#>;tag=#local_tag#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# REGISTER",
        "Expires: 0",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const UNSUBSCRIBE: Template = Template::new(
    "unsubscribe",
    &[
        "SUBSCRIBE sip:Unknown@#server_host#:#server_port# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "To: <sip:Unknown@#server_host#:#server_port#>",
        "From: <sip:#username#@#server_host#:#server_port#>;tag=#local_tag#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# SUBSCRIBE",
        "Event: message-summary",
        "Accept: application/simple-message-summary",
        "Expires: 0",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const INVITE: Template = Template::new(
    "invite",
    &[
        "INVITE #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# INVITE",
        "Allow: #allow#",
        "Supported: replaces",
        "Content-Type: application/sdp",
        "User-Agent: #user_agent#",
        "Content-Length: #content_length#",
    ],
);

pub const ACK: Template = Template::new(
    "ack",
    &[
        "ACK #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# ACK",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const BYE: Template = Template::new(
    "bye",
    &[
        "BYE #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# BYE",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const CANCEL: Template = Template::new(
    "cancel",
    &[
        "CANCEL #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# CANCEL",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const REFER: Template = Template::new(
    "refer",
    &[
        "REFER #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# REFER",
        "Refer-To: <sip:#refer_to#@#server_host##replaces#>",
        "Referred-By: <sip:#username#@#server_host#>",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

pub const MESSAGE: Template = Template::new(
    "message",
    &[
        "MESSAGE #request_uri# SIP/2.0",
        "Via: SIP/2.0/UDP #local_host#:#local_port#;branch=#branch#;rport",
        "Max-Forwards: 70",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# MESSAGE",
        "Content-Type: text/plain",
        "User-Agent: #user_agent#",
        "Content-Length: #content_length#",
    ],
);

/// Generic response echoing the request's transaction headers
pub const RESPONSE: Template = Template::new(
    "response",
    &[
        "SIP/2.0 #status# #reason#",
        "Via: #via#",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# #reply_method#",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "Allow: #allow#",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

/// 302 pointing the caller at another number
pub const REDIRECT: Template = Template::new(
    "redirect",
    &[
        "SIP/2.0 302 Moved Temporarily",
        "Via: #via#",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# #reply_method#",
        "Contact: <sip:#target#@#server_host#>",
        "User-Agent: #user_agent#",
        "Content-Length: 0",
    ],
);

/// 200 OK carrying a session description
pub const ANSWER: Template = Template::new(
    "answer",
    &[
        "SIP/2.0 200 OK",
        "Via: #via#",
        "To: #to#",
        "From: #from#",
        "Call-ID: #call_id#",
        "CSeq: #cseq# INVITE",
        "Contact: <sip:#username#@#local_host#:#local_port#>",
        "Allow: #allow#",
        "Supported: replaces",
        "Content-Type: application/sdp",
        "User-Agent: #user_agent#",
        "Content-Length: #content_length#",
    ],
);

/// Fill every line, per-request `values` taking precedence over `globals`.
///
/// Unknown placeholders are left as they are. Values must fit on one header
/// line; a value containing CR or LF fails the whole fill.
pub fn fill(
    lines: &[&str],
    globals: &Substitutions,
    values: &Substitutions,
) -> Result<Vec<String>, SipError> {
    for (key, value) in values.iter().chain(globals.iter()) {
        if value.contains(['\r', '\n']) {
            return Err(SipError::Template(format!(
                "value for #{}# spans multiple lines",
                key
            )));
        }
    }

    Ok(lines
        .iter()
        .map(|line| fill_line(line, globals, values))
        .collect())
}

fn fill_line(line: &str, globals: &Substitutions, values: &Substitutions) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(open) = rest.find(DELIMITER) {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let substituted = after.find(DELIMITER).and_then(|close| {
            let key = &after[..close];
            values
                .get(key)
                .or_else(|| globals.get(key))
                .map(|value| (value, close))
        });

        match substituted {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                // Not a known token: keep the delimiter and rescan from the next char
                out.push(DELIMITER);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Placeholders in `lines` that neither `values` nor `globals` can fill.
///
/// Only the template itself is scanned; whatever the values contain is
/// copied verbatim by [`fill`].
pub fn missing(lines: &[&str], globals: &Substitutions, values: &Substitutions) -> Vec<String> {
    let mut found = Vec::new();
    for line in lines {
        let mut rest = *line;
        while let Some(open) = rest.find(DELIMITER) {
            let after = &rest[open + 1..];
            let Some(close) = after.find(DELIMITER) else {
                break;
            };
            let key = &after[..close];
            if !is_token(key) {
                rest = after;
                continue;
            }
            if !values.contains_key(key) && !globals.contains_key(key) {
                found.push(key.to_string());
            }
            rest = &after[close + 1..];
        }
    }
    found
}

fn is_token(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
