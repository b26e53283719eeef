//! Session description bodies for offers, answers and re-INVITEs

use crate::domain::call::{MediaDescription, TransmitMode};

/// Connection address advertised while a call is held
pub const HOLD_ADDRESS: &str = "0.0.0.0";

/// Everything needed to render one session body
#[derive(Debug, Clone)]
pub struct SessionDescription<'a> {
    pub user_agent: &'a str,
    pub session_id: u32,
    pub version: u32,
    pub address: &'a str,
    pub media: &'a MediaDescription,
    pub mode: TransmitMode,
    /// Set on answers; rendered as `a=x-rtp-session-id`
    pub rtp_session_id: Option<String>,
}

impl<'a> SessionDescription<'a> {
    /// Offer from `address`; origin version equals the session id
    pub fn offer(
        user_agent: &'a str,
        session_id: u32,
        address: &'a str,
        media: &'a MediaDescription,
        mode: TransmitMode,
    ) -> Self {
        Self {
            user_agent,
            session_id,
            version: session_id,
            address,
            media,
            mode,
            rtp_session_id: None,
        }
    }

    /// Answer to an inbound offer; origin version is the session id plus two
    pub fn answer(
        user_agent: &'a str,
        session_id: u32,
        address: &'a str,
        media: &'a MediaDescription,
        mode: TransmitMode,
        rtp_session_id: String,
    ) -> Self {
        Self {
            version: session_id.wrapping_add(2),
            rtp_session_id: Some(rtp_session_id),
            ..Self::offer(user_agent, session_id, address, media, mode)
        }
    }

    /// Same offer with the connection address zeroed
    pub fn on_hold(self) -> Self {
        Self {
            address: HOLD_ADDRESS,
            ..self
        }
    }

    /// Convert to SDP string
    pub fn render(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.user_agent.replace(' ', "-"),
            self.session_id,
            self.version,
            self.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.user_agent));
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.address));
        sdp.push_str("t=0 0\r\n");

        for stream in &self.media.streams {
            let formats: Vec<String> = stream
                .codecs
                .iter()
                .map(|c| c.payload_type.to_string())
                .collect();
            sdp.push_str(&format!(
                "m=audio {} RTP/AVP {}\r\n",
                stream.port,
                formats.join(" ")
            ));

            for codec in &stream.codecs {
                sdp.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    codec.payload_type, codec.name, codec.clock_rate
                ));
                if codec.is_telephone_event() {
                    sdp.push_str(&format!("a=fmtp:{} 0-15\r\n", codec.payload_type));
                }
            }
        }

        sdp.push_str("a=ptime:20\r\n");
        sdp.push_str("a=maxptime:50\r\n");
        sdp.push_str(&format!("a={}\r\n", self.mode));
        if let Some(id) = &self.rtp_session_id {
            sdp.push_str(&format!("a=x-rtp-session-id:{}\r\n", id));
        }

        sdp
    }
}

/// The few fields of a received body the agent looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSummary {
    pub address: Option<String>,
    pub ports: Vec<u16>,
    pub mode: TransmitMode,
}

impl SdpSummary {
    pub fn parse(body: &str) -> Option<Self> {
        let mut address = None;
        let mut ports = Vec::new();
        let mut mode = TransmitMode::SendRecv;
        let mut seen_version = false;

        for line in body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }
            let (field_type, value) = line.split_at(2);
            match field_type {
                "v=" => seen_version = true,
                "c=" => {
                    if address.is_none() {
                        address = value.split_whitespace().nth(2).map(str::to_string);
                    }
                }
                "m=" => {
                    if let Some(port) = value.split_whitespace().nth(1).and_then(|p| p.parse().ok()) {
                        ports.push(port);
                    }
                }
                "a=" => {
                    mode = match value {
                        "sendrecv" => TransmitMode::SendRecv,
                        "sendonly" => TransmitMode::SendOnly,
                        "recvonly" => TransmitMode::RecvOnly,
                        "inactive" => TransmitMode::Inactive,
                        _ => mode,
                    }
                }
                _ => {}
            }
        }

        seen_version.then_some(Self {
            address,
            ports,
            mode,
        })
    }

    pub fn is_hold(&self) -> bool {
        self.address.as_deref() == Some(HOLD_ADDRESS)
            || matches!(self.mode, TransmitMode::Inactive | TransmitMode::SendOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::Codec;

    fn media() -> MediaDescription {
        MediaDescription::audio(40000, vec![Codec::pcmu(), Codec::telephone_event()])
    }

    #[test]
    fn test_render_offer() {
        let media = media();
        let body = SessionDescription::offer("sipagent 0.1.0", 7, "10.0.0.9", &media, TransmitMode::SendRecv)
            .render();

        let expected = "v=0\r\n\
                        o=sipagent-0.1.0 7 7 IN IP4 10.0.0.9\r\n\
                        s=sipagent 0.1.0\r\n\
                        c=IN IP4 10.0.0.9\r\n\
                        t=0 0\r\n\
                        m=audio 40000 RTP/AVP 0 101\r\n\
                        a=rtpmap:0 PCMU/8000\r\n\
                        a=rtpmap:101 telephone-event/8000\r\n\
                        a=fmtp:101 0-15\r\n\
                        a=ptime:20\r\n\
                        a=maxptime:50\r\n\
                        a=sendrecv\r\n";
        assert_eq!(body, expected);
    }

    #[test]
    fn test_render_hold_zeroes_connection() {
        let media = media();
        let body = SessionDescription::offer("ua", 7, "10.0.0.9", &media, TransmitMode::SendOnly)
            .on_hold()
            .render();
        assert!(body.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(body.contains("a=sendonly\r\n"));

        let summary = SdpSummary::parse(&body).unwrap();
        assert!(summary.is_hold());
        assert_eq!(summary.ports, vec![40000]);
    }

    #[test]
    fn test_render_answer() {
        let media = media();
        let body = SessionDescription::answer(
            "ua",
            10,
            "10.0.0.9",
            &media,
            TransmitMode::SendRecv,
            "abcd".to_string(),
        )
        .render();
        assert!(body.contains("o=ua 10 12 IN IP4 10.0.0.9\r\n"));
        assert!(body.ends_with("a=x-rtp-session-id:abcd\r\n"));

        let summary = SdpSummary::parse(&body).unwrap();
        assert!(!summary.is_hold());
        assert_eq!(summary.address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_parse_rejects_non_sdp() {
        assert!(SdpSummary::parse("SIP/2.0 200 OK").is_none());
    }
}
