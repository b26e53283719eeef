//! SIP Digest Authentication (client side)
//!
//! Responses are computed against a fixed realm taken from configuration
//! rather than the realm the server advertises, and both the nonce and
//! the final hash are URL-encoded. The registrar this agent talks to
//! verifies exactly this construction, so it is reproduced as-is instead
//! of following RFC 2617.

use super::message::{AuthChallenge, ChallengeKind, SipError};
use tracing::debug;

/// Request flavour whose canonical `A2` string the digest is computed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestMethod {
    Register,
    /// Always targets the `Unknown` user
    Subscribe,
    Invite { target: String },
    Message { target: String },
    /// In-dialog re-INVITE (hold) and the INVITE leg of a transfer
    ReferInvite { target: String },
    Refer { target: String },
    Bye { target: String },
}

impl DigestMethod {
    pub fn method_name(&self) -> &'static str {
        match self {
            DigestMethod::Register => "REGISTER",
            DigestMethod::Subscribe => "SUBSCRIBE",
            DigestMethod::Invite { .. } | DigestMethod::ReferInvite { .. } => "INVITE",
            DigestMethod::Message { .. } => "MESSAGE",
            DigestMethod::Refer { .. } => "REFER",
            DigestMethod::Bye { .. } => "BYE",
        }
    }

    /// Digest URI for the given server
    pub fn uri(&self, server_host: &str, server_port: u16) -> String {
        match self {
            DigestMethod::Register => format!("sip:{}", server_host),
            DigestMethod::Subscribe => format!("sip:Unknown@{}:{}", server_host, server_port),
            DigestMethod::Invite { target } | DigestMethod::Message { target } => {
                format!("sip:{}@{}", target, server_host)
            }
            DigestMethod::ReferInvite { target }
            | DigestMethod::Refer { target }
            | DigestMethod::Bye { target } => {
                format!("sip:{}@{}:{}", target, server_host, server_port)
            }
        }
    }

    fn target(&self) -> Option<&str> {
        match self {
            DigestMethod::Register | DigestMethod::Subscribe => None,
            DigestMethod::Invite { target }
            | DigestMethod::Message { target }
            | DigestMethod::ReferInvite { target }
            | DigestMethod::Refer { target }
            | DigestMethod::Bye { target } => Some(target),
        }
    }
}

/// Answer to a challenge, cached per Call-ID for later in-dialog requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub kind: ChallengeKind,
    /// Nonce as placed on the wire (URL-encoded)
    pub nonce: String,
    /// Raw nonce from the server
    pub raw_nonce: String,
    pub response: String,
    pub uri: String,
}

impl AuthInfo {
    /// Header name carrying these credentials
    pub fn header_name(&self) -> &'static str {
        self.kind.response_header()
    }
}

/// Computes digest responses for one account
#[derive(Debug, Clone)]
pub struct DigestCalculator {
    username: String,
    password: String,
    realm: String,
    server_host: String,
    server_port: u16,
}

impl DigestCalculator {
    pub fn new(
        username: &str,
        password: &str,
        realm: &str,
        server_host: &str,
        server_port: u16,
    ) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
            server_host: server_host.to_string(),
            server_port,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Canonical `METHOD:uri` string
    pub fn a2(&self, method: &DigestMethod) -> String {
        format!(
            "{}:{}",
            method.method_name(),
            method.uri(&self.server_host, self.server_port)
        )
    }

    /// Digest response for `nonce`; `Err` when any input needed for the hash is missing
    pub fn response(&self, nonce: &str, method: &DigestMethod) -> Result<String, SipError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(SipError::Authentication("missing credentials".to_string()));
        }
        if nonce.is_empty() {
            return Err(SipError::Authentication("empty nonce".to_string()));
        }
        if self.server_host.is_empty() {
            return Err(SipError::Authentication("missing server host".to_string()));
        }
        if method.target().is_some_and(|t| t.is_empty()) {
            return Err(SipError::Authentication(format!(
                "missing target for {}",
                method.method_name()
            )));
        }

        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
        let ha2 = md5_hex(&self.a2(method));
        let response = md5_hex(&format!("{}:{}:{}", ha1, quote(nonce), ha2));

        debug!("Computed digest for {}", method.method_name());
        Ok(quote(&response))
    }

    /// Answer a server challenge for `method`
    pub fn authorize(
        &self,
        challenge: &AuthChallenge,
        method: &DigestMethod,
    ) -> Result<AuthInfo, SipError> {
        self.authorize_nonce(challenge.kind, &challenge.nonce, method)
    }

    /// Recompute credentials for a nonce cached from an earlier exchange
    pub fn authorize_nonce(
        &self,
        kind: ChallengeKind,
        nonce: &str,
        method: &DigestMethod,
    ) -> Result<AuthInfo, SipError> {
        let response = self.response(nonce, method)?;
        Ok(AuthInfo {
            kind,
            nonce: quote(nonce),
            raw_nonce: nonce.to_string(),
            response,
            uri: method.uri(&self.server_host, self.server_port),
        })
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// URL-encode, leaving `/` literal
pub fn quote(input: &str) -> String {
    urlencoding::encode(input).replace("%2F", "/")
}
