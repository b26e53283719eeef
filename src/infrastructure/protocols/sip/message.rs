//! SIP message types and parsing

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Challenge exhausted: {0}")]
    ChallengeExhausted(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Rejected with {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Dialog not found: {0}")]
    DialogNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl SipError {
    pub fn rejected(code: u16) -> Self {
        SipError::Rejected {
            code,
            reason: reason_phrase(code).to_string(),
        }
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => return Err(SipError::InvalidMessage(format!("unknown method {}", other))),
        };
        Ok(method)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason phrase for the status codes this agent sends or reports
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Request method or response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request(SipMethod),
    Response(u16),
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SipError::InvalidMessage(format!("bad CSeq: {}", s)))?;
        let method = parts
            .next()
            .ok_or_else(|| SipError::InvalidMessage(format!("bad CSeq: {}", s)))?
            .parse()?;
        Ok(Self { seq, method })
    }
}

/// From/To header value split into the parts dialogs care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    /// Header value with the tag parameter stripped
    pub raw: String,
    pub tag: Option<String>,
    /// User part of the URI
    pub number: String,
    pub host: String,
}

impl NameAddr {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        // Parameters after the closing bracket belong to the header, not the URI
        let params_start = value.rfind('>').map(|i| i + 1).unwrap_or(0);
        let (raw, tag) = match value[params_start..].find(";tag=") {
            Some(offset) => {
                let start = params_start + offset;
                let rest = &value[start + ";tag=".len()..];
                let tag = rest.split(';').next().unwrap_or_default().trim().to_string();
                let tail = rest.find(';').map(|i| &rest[i..]).unwrap_or("");
                (format!("{}{}", &value[..start], tail), Some(tag))
            }
            None => (value.to_string(), None),
        };

        let uri = match (raw.find('<'), raw.find('>')) {
            (Some(open), Some(close)) if close > open => &raw[open + 1..close],
            _ => raw.as_str(),
        };
        let uri = uri
            .trim()
            .trim_start_matches("sips:")
            .trim_start_matches("sip:");
        let (number, host) = match uri.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (String::new(), uri),
        };
        let host = host
            .split(|c| c == ':' || c == ';' || c == '>')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            raw,
            tag: tag.filter(|t| !t.is_empty()),
            number,
            host,
        }
    }

    /// Header value with the given tag appended
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{};tag={}", self.raw, tag)
    }

    /// Full header value including the parsed tag, if any
    pub fn value(&self) -> String {
        match &self.tag {
            Some(tag) => self.with_tag(tag),
            None => self.raw.clone(),
        }
    }
}

/// Which header carried the challenge, and so which header must answer it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 / WWW-Authenticate, answered with Authorization
    Www,
    /// 407 / Proxy-Authenticate, answered with Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    pub fn response_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Digest challenge from a 401/407 response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub kind: ChallengeKind,
    pub nonce: String,
    pub realm: Option<String>,
    pub stale: bool,
}

impl AuthChallenge {
    pub fn parse(kind: ChallengeKind, value: &str) -> Option<Self> {
        let value = value.trim();
        let params = value
            .strip_prefix("Digest")
            .or_else(|| value.strip_prefix("digest"))?;

        let mut nonce = None;
        let mut realm = None;
        let mut stale = false;
        for param in split_params(params) {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "nonce" => nonce = Some(val),
                "realm" => realm = Some(val),
                "stale" => stale = val.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Some(Self {
            kind,
            nonce: nonce.filter(|n| !n.is_empty())?,
            realm,
            stale,
        })
    }
}

/// Split auth parameters on commas that are not inside a quoted string
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

/// Parsed SIP message (request or response)
#[derive(Debug, Clone)]
pub struct SipMessage {
    kind: MessageKind,
    headers: Vec<(String, String)>,
    body: String,
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = rsip::Request::try_from(data) {
            let method: SipMethod = request.method.to_string().parse()?;
            return Ok(Self {
                kind: MessageKind::Request(method),
                headers: split_headers(&request.headers),
                body: String::from_utf8_lossy(&request.body).into_owned(),
            });
        }

        // Try parsing as response
        if let Ok(response) = rsip::Response::try_from(data) {
            let status: u16 = response.status_code.clone().into();
            return Ok(Self {
                kind: MessageKind::Response(status),
                headers: split_headers(&response.headers),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::Response(_))
    }

    pub fn method(&self) -> Option<SipMethod> {
        match self.kind {
            MessageKind::Request(method) => Some(method),
            MessageKind::Response(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            MessageKind::Response(code) => Some(code),
            MessageKind::Request(_) => None,
        }
    }

    /// First value of a header, matched case-insensitively and by compact form
    pub fn header(&self, name: &str) -> Option<&str> {
        let compact = compact_form(name);
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name) || compact.is_some_and(|c| n.as_str() == c))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in message order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let compact = compact_form(name);
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name) || compact.is_some_and(|c| n.as_str() == c))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.header("CSeq").and_then(|v| v.parse().ok())
    }

    /// Topmost Via header value
    pub fn via(&self) -> Option<&str> {
        self.header("Via")
    }

    pub fn via_branch(&self) -> Option<String> {
        self.via().and_then(|via| {
            via.split(';')
                .find_map(|p| p.trim().strip_prefix("branch="))
                .map(|b| b.trim().to_string())
        })
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.header("From").map(NameAddr::parse)
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.header("To").map(NameAddr::parse)
    }

    /// Contact URI without angle brackets or header parameters
    pub fn contact_uri(&self) -> Option<String> {
        let contact = self.header("Contact")?.trim();
        let uri = match (contact.find('<'), contact.find('>')) {
            (Some(open), Some(close)) if close > open => &contact[open + 1..close],
            _ => contact.split(';').next().unwrap_or(contact),
        };
        let uri = uri.trim();
        (!uri.is_empty() && uri != "*").then(|| uri.to_string())
    }

    pub fn challenge(&self) -> Option<AuthChallenge> {
        if let Some(value) = self.header("WWW-Authenticate") {
            return AuthChallenge::parse(ChallengeKind::Www, value);
        }
        self.header("Proxy-Authenticate")
            .and_then(|value| AuthChallenge::parse(ChallengeKind::Proxy, value))
    }

    /// Retry-After in seconds
    pub fn retry_after(&self) -> Option<u64> {
        self.header("Retry-After")
            .and_then(|v| v.split(|c: char| c == ';' || c == '(').next())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Status line carried in a message/sipfrag body (NOTIFY for REFER)
    pub fn sipfrag_status(&self) -> Option<u16> {
        let line = self.body.lines().next()?.trim();
        let rest = line.strip_prefix("SIP/2.0")?;
        rest.split_whitespace().next()?.parse().ok()
    }

    /// The key transactions subscribe with: Call-ID plus CSeq method
    pub fn transaction_key(&self) -> Option<super::dispatcher::TransactionKey> {
        Some(super::dispatcher::TransactionKey::new(
            self.call_id()?,
            self.cseq()?.method,
        ))
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Request(method) => write!(f, "{}", method)?,
            MessageKind::Response(code) => write!(f, "{} {}", code, reason_phrase(code))?,
        }
        if let Some(call_id) = self.call_id() {
            write!(f, " ({})", call_id)?;
        }
        Ok(())
    }
}

fn split_headers(headers: &rsip::Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|header| {
            let line = header.to_string();
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn compact_form(name: &str) -> Option<&'static str> {
    let compact = match name.to_ascii_lowercase().as_str() {
        "call-id" => "i",
        "via" => "v",
        "from" => "f",
        "to" => "t",
        "contact" => "m",
        "content-length" => "l",
        "content-type" => "c",
        "refer-to" => "r",
        "event" => "o",
        _ => return None,
    };
    Some(compact)
}
