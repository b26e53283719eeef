//! Shared fixtures: an agent wired to an in-memory server

#![allow(dead_code)]

use sipagent::config::Config;
use sipagent::domain::call::{CallStatus, CallUpdate, Codec, MediaDescription, TransmitMode};
use sipagent::infrastructure::protocols::sip::message::reason_phrase;
use sipagent::infrastructure::protocols::sip::{
    CallState, ChannelPeer, ChannelTransport, SipMessage, SipMethod, UserAgent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const LOCAL: &str = "10.0.0.9:5062";
pub const SERVER: &str = "10.0.0.5:5060";
pub const CALLEE: &str = "4155550100";
pub const SERVER_TAG: &str = "srv1";

const WAIT: Duration = Duration::from_secs(600);

pub fn config() -> Config {
    let mut config = Config::default();
    config.account.username = "alice".to_string();
    config.account.password = "s3cret".to_string();
    config.account.server_host = "10.0.0.5".to_string();
    config.account.server_port = 5060;
    config.agent.user_agent = "sipagent test".to_string();
    config
}

pub fn media() -> MediaDescription {
    MediaDescription::audio(40000, vec![Codec::pcmu(), Codec::telephone_event()])
}

/// Response to `request` the way the server would send it
pub fn reply(request: &SipMessage, code: u16, extra: &str, body: &str) -> String {
    let to = request.header("To").unwrap_or_default();
    let to = if code > 100 && !to.contains("tag=") {
        format!("{};tag={}", to, SERVER_TAG)
    } else {
        to.to_string()
    };
    let cseq = request.cseq().expect("request without CSeq");
    format!(
        "SIP/2.0 {} {}\r\n\
         Via: {}\r\n\
         From: {}\r\n\
         To: {}\r\n\
         Call-ID: {}\r\n\
         CSeq: {} {}\r\n\
         {}\
         Content-Length: {}\r\n\r\n{}",
        code,
        reason_phrase(code),
        request.header_values("Via").join(", "),
        request.header("From").unwrap_or_default(),
        to,
        request.call_id().unwrap_or_default(),
        cseq.seq,
        cseq.method,
        extra,
        body.len(),
        body
    )
}

pub fn challenge(request: &SipMessage, nonce: &str) -> String {
    reply(
        request,
        401,
        &format!(
            "WWW-Authenticate: Digest realm=\"asterisk\",nonce=\"{}\",algorithm=MD5\r\n",
            nonce
        ),
        "",
    )
}

/// 200 answering an INVITE, with the callee's contact
pub fn answer(invite: &SipMessage) -> String {
    reply(
        invite,
        200,
        "Contact: <sip:4155550100@10.0.0.5:5060>\r\nContent-Type: application/sdp\r\n",
        "v=0\r\no=- 1 1 IN IP4 10.0.0.5\r\ns=-\r\nc=IN IP4 10.0.0.5\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n",
    )
}

/// INVITE from the server for a call to us
pub fn inbound_invite(call_id: &str) -> String {
    let body = "v=0\r\no=- 7 7 IN IP4 10.0.0.5\r\ns=-\r\nc=IN IP4 10.0.0.5\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0 101\r\n";
    format!(
        "INVITE sip:alice@10.0.0.9:5062 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKin-{call_id}\r\n\
         From: \"Bob\" <sip:4155550100@10.0.0.5>;tag=bobtag\r\n\
         To: <sip:alice@10.0.0.5>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 102 INVITE\r\n\
         Contact: <sip:4155550100@10.0.0.5:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Request from the server inside an existing dialog
pub fn in_dialog(
    method: &str,
    call_id: &str,
    to_tag: Option<&str>,
    cseq: u32,
    extra: &str,
    body: &str,
) -> String {
    let to = match to_tag {
        Some(tag) => format!("<sip:alice@10.0.0.5>;tag={}", tag),
        None => "<sip:alice@10.0.0.5>".to_string(),
    };
    let branch = if method == "CANCEL" {
        format!("z9hG4bKin-{}", call_id)
    } else {
        format!("z9hG4bK{}{}", method.to_lowercase(), cseq)
    };
    format!(
        "{method} sip:alice@10.0.0.9:5062 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.5:5060;branch={branch}\r\n\
         From: \"Bob\" <sip:4155550100@10.0.0.5>;tag=bobtag\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         {extra}\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

pub fn options(seq: u32) -> String {
    format!(
        "OPTIONS sip:alice@10.0.0.9:5062 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKopt{seq}\r\n\
         From: <sip:asterisk@10.0.0.5>;tag=opt\r\n\
         To: <sip:alice@10.0.0.9>\r\n\
         Call-ID: options-{seq}\r\n\
         CSeq: {seq} OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

pub struct Harness {
    pub agent: Arc<UserAgent>,
    pub peer: ChannelPeer,
    pub calls: mpsc::UnboundedReceiver<CallUpdate>,
    pub status: mpsc::UnboundedReceiver<bool>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(config(), true).await
    }

    pub async fn with_config(config: Config, call_handler: bool) -> Self {
        let (transport, peer) =
            ChannelTransport::pair(LOCAL.parse().unwrap(), SERVER.parse().unwrap());
        let (call_tx, calls) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();

        let mut builder = UserAgent::builder(config)
            .transport(Arc::new(transport))
            .registration_handler(Arc::new(status_tx));
        if call_handler {
            builder = builder.call_handler(Arc::new(call_tx));
        }
        let agent = builder.build().await.unwrap();

        Self {
            agent: Arc::new(agent),
            peer,
            calls,
            status,
        }
    }

    /// Start the agent and accept its REGISTER straight away
    pub async fn start(&mut self) {
        let agent = self.agent.clone();
        let task = tokio::spawn(async move { agent.start().await });

        let register = self.expect(SipMethod::Register).await;
        self.send(&reply(&register, 200, "Expires: 3600\r\n", "")).await;
        tokio_test::assert_ok!(task.await.unwrap());
        assert_eq!(self.status.recv().await, Some(true));
    }

    pub async fn send(&self, text: &str) {
        self.peer.send(text).await.unwrap();
    }

    /// Next datagram the agent sent: its start line and the parsed message
    pub async fn next_raw(&mut self) -> (String, SipMessage) {
        let outgoing = tokio::time::timeout(WAIT, self.peer.recv_raw())
            .await
            .expect("agent sent nothing")
            .expect("transport closed");
        let text = String::from_utf8_lossy(&outgoing.data).to_string();
        let line = text.lines().next().unwrap_or_default().to_string();
        (line, SipMessage::parse(&outgoing.data).unwrap())
    }

    pub async fn next(&mut self) -> SipMessage {
        self.next_raw().await.1
    }

    pub async fn expect(&mut self, method: SipMethod) -> SipMessage {
        let message = self.next().await;
        assert_eq!(message.method(), Some(method), "got {}", message);
        message
    }

    pub async fn expect_status(&mut self, code: u16) -> SipMessage {
        let message = self.next().await;
        assert_eq!(message.status(), Some(code), "got {}", message);
        message
    }

    pub async fn call_update(&mut self) -> CallUpdate {
        tokio::time::timeout(WAIT, self.calls.recv())
            .await
            .expect("no call update")
            .expect("call handler dropped")
    }

    pub async fn expect_update(&mut self, status: CallStatus) -> CallUpdate {
        let update = self.call_update().await;
        assert_eq!(update.status, status);
        update
    }

    /// Place a call and have the server answer it. Returns the Call-ID.
    pub async fn established_call(&mut self) -> String {
        let agent = self.agent.clone();
        let call =
            tokio::spawn(async move { agent.invite(CALLEE, media(), TransmitMode::SendRecv).await });

        let invite = self.expect(SipMethod::Invite).await;
        self.send(&answer(&invite)).await;
        self.expect(SipMethod::Ack).await;

        let outcome = call.await.unwrap().unwrap();
        assert_eq!(outcome.state, CallState::Established);
        self.expect_update(CallStatus::Established).await;
        outcome.call_id
    }
}
