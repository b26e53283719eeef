//! SIP message builder
//!
//! Turns templates plus per-request values into wire-ready messages. The
//! session-wide values (account, addresses, user agent) are fixed when the
//! builder is created.

use super::auth::AuthInfo;
use super::dialog::Dialog;
use super::message::{reason_phrase, SipError, SipMessage};
use super::template::{self, Substitutions, Template};
use crate::config::Config;
use bytes::Bytes;
use std::net::SocketAddr;

/// Rendered message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    lines: Vec<String>,
    body: String,
}

impl OutboundMessage {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Request or status line
    pub fn start_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut text = self.lines.join("\r\n");
        text.push_str("\r\n\r\n");
        text.push_str(&self.body);
        Bytes::from(text)
    }
}

/// Per-request substitution values
#[derive(Debug, Clone, Default)]
pub struct Values(Substitutions);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Values shared by every request inside `dialog`
    pub fn for_dialog(dialog: &Dialog, cseq: u32, branch: &str, request_uri: &str) -> Self {
        Self::new()
            .set("call_id", &dialog.call_id)
            .set("cseq", cseq)
            .set("branch", branch)
            .set("request_uri", request_uri)
            .set("from", dialog.local_header())
            .set("to", dialog.remote_header())
            .set("target", &dialog.target)
    }
}

/// Fills templates with the account's session values
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    globals: Substitutions,
    server_host: String,
    server_port: u16,
    local_host: String,
}

impl RequestBuilder {
    pub fn new(config: &Config, local_addr: SocketAddr) -> Self {
        let account = &config.account;
        let agent = &config.agent;
        let globals: Substitutions = [
            ("user_agent", agent.user_agent.clone()),
            ("expires", agent.expires.to_string()),
            ("username", account.username.clone()),
            ("realm", account.realm.clone()),
            ("server_host", account.server_host.clone()),
            ("server_port", account.server_port.to_string()),
            ("local_host", local_addr.ip().to_string()),
            ("local_port", local_addr.port().to_string()),
            ("allow", agent.allow.join(", ")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            globals,
            server_host: account.server_host.clone(),
            server_port: account.server_port,
            local_host: local_addr.ip().to_string(),
        }
    }

    pub fn globals(&self) -> &Substitutions {
        &self.globals
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// `sip:<number>@<server-host>`
    pub fn uri(&self, number: &str) -> String {
        format!("sip:{}@{}", number, self.server_host)
    }

    /// `sip:<number>@<server-host>:<server-port>`
    pub fn uri_with_port(&self, number: &str) -> String {
        format!("sip:{}@{}:{}", number, self.server_host, self.server_port)
    }

    /// `<sip:<number>@<server-host>>`
    pub fn party(&self, number: &str) -> String {
        format!("<{}>", self.uri(number))
    }

    /// Render `template`. With `auth` the credentials line is included; a
    /// non-empty `body` sets `Content-Length`.
    pub fn build(
        &self,
        template: Template,
        values: Values,
        auth: Option<&AuthInfo>,
        body: &str,
    ) -> Result<OutboundMessage, SipError> {
        let mut values = values.set("content_length", body.len());
        if let Some(auth) = auth {
            values = values
                .set("auth_header", auth.header_name())
                .set("nonce", &auth.nonce)
                .set("response", &auth.response)
                .set("auth_uri", &auth.uri);
        }

        let lines = template.variant(auth.is_some());
        let missing = template::missing(&lines, &self.globals, &values.0);
        if !missing.is_empty() {
            return Err(SipError::Template(format!(
                "{}: unresolved {}",
                template.name,
                missing.join(", ")
            )));
        }
        let lines = template::fill(&lines, &self.globals, &values.0)?;

        Ok(OutboundMessage {
            lines,
            body: body.to_string(),
        })
    }

    /// Response to `request` echoing its transaction headers. `to_tag` is
    /// appended to To when the request carried none.
    pub fn response(
        &self,
        request: &SipMessage,
        status: u16,
        to_tag: Option<&str>,
    ) -> Result<OutboundMessage, SipError> {
        let values = Self::echo(request, to_tag)?
            .set("status", status)
            .set("reason", reason_phrase(status));
        self.build(template::RESPONSE, values, None, "")
    }

    /// 302 sending the caller to `target`
    pub fn redirect(
        &self,
        request: &SipMessage,
        to_tag: Option<&str>,
        target: &str,
    ) -> Result<OutboundMessage, SipError> {
        let values = Self::echo(request, to_tag)?.set("target", target);
        self.build(template::REDIRECT, values, None, "")
    }

    /// 200 OK with a session description
    pub fn answer(
        &self,
        request: &SipMessage,
        to_tag: &str,
        body: &str,
    ) -> Result<OutboundMessage, SipError> {
        let values = Self::echo(request, Some(to_tag))?;
        self.build(template::ANSWER, values, None, body)
    }

    fn echo(request: &SipMessage, to_tag: Option<&str>) -> Result<Values, SipError> {
        let missing = |name: &str| SipError::InvalidMessage(format!("request without {}", name));

        let via = request.header_values("Via");
        if via.is_empty() {
            return Err(missing("Via"));
        }
        let from = request.header("From").ok_or_else(|| missing("From"))?;
        let to = request.to().ok_or_else(|| missing("To"))?;
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?;
        let cseq = request.cseq().ok_or_else(|| missing("CSeq"))?;

        let to = match (&to.tag, to_tag) {
            (None, Some(tag)) => to.with_tag(tag),
            _ => to.value(),
        };

        Ok(Values::new()
            .set("via", via.join(", "))
            .set("from", from)
            .set("to", to)
            .set("call_id", call_id)
            .set("cseq", cseq.seq)
            .set("reply_method", cseq.method))
    }
}
