//! Registration and Liveness Tests

mod common;

use common::*;
use sipagent::infrastructure::protocols::sip::{SipError, SipMethod};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_register_answers_challenge() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let (line, first) = h.next_raw().await;
    assert_eq!(line, "REGISTER sip:10.0.0.5:5060 SIP/2.0");
    assert!(first.header("Authorization").is_none());
    h.send(&challenge(&first, "7a9c")).await;

    let second = h.expect(SipMethod::Register).await;
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq().unwrap().seq, first.cseq().unwrap().seq + 1);
    assert_eq!(second.from().unwrap().tag, first.from().unwrap().tag);
    let credentials = second.header("Authorization").unwrap();
    assert!(credentials.contains("username=\"alice\""));
    assert!(credentials.contains("realm=\"asterisk\""));
    assert!(credentials.contains("nonce=\"7a9c\""));
    assert!(credentials.contains("uri=\"sip:10.0.0.5\""));
    assert!(credentials.contains("response=\"a949fc795288209c65bdab86ff640270\""));

    h.send(&reply(&second, 200, "Expires: 3600\r\n", "")).await;
    let registration = start.await.unwrap().unwrap();
    assert_eq!(registration.expires, 3600);
    assert_eq!(h.status.recv().await, Some(true));
    assert!(h.agent.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_second_challenge_is_terminal() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let first = h.expect(SipMethod::Register).await;
    h.send(&challenge(&first, "7a9c")).await;
    let second = h.expect(SipMethod::Register).await;
    h.send(&challenge(&second, "7a9d")).await;

    let result = start.await.unwrap();
    assert!(matches!(result, Err(SipError::ChallengeExhausted(_))));
    assert_eq!(h.status.recv().await, Some(false));
    assert!(!h.agent.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_register_forbidden() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let register = h.expect(SipMethod::Register).await;
    h.send(&reply(&register, 403, "", "")).await;

    let result = start.await.unwrap();
    assert!(matches!(result, Err(SipError::Rejected { code: 403, .. })));
    assert_eq!(h.status.recv().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_register_without_answer_times_out() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    h.expect(SipMethod::Register).await;
    let result = start.await.unwrap();
    assert!(matches!(result, Err(SipError::Timeout(_))));
    assert!(!h.agent.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timer_expiry_reports_down() {
    let mut h = Harness::new().await;
    h.start().await;

    tokio::time::sleep(Duration::from_secs(126)).await;
    assert_eq!(h.status.recv().await, Some(false));
    assert!(!h.agent.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_healthy_options_keep_registration_alive() {
    let mut h = Harness::new().await;
    h.start().await;

    for seq in 1..=4 {
        tokio::time::sleep(Duration::from_secs(100)).await;
        h.send(&options(seq)).await;
        let ok = h.expect_status(200).await;
        assert_eq!(ok.cseq().unwrap().method, SipMethod::Options);
    }
    assert!(h.status.try_recv().is_err());
    assert!(h.agent.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_options_flood_reports_down() {
    let mut h = Harness::new().await;
    h.start().await;

    for seq in 1..=5 {
        tokio::time::advance(Duration::from_secs(5)).await;
        h.send(&options(seq)).await;
        h.expect_status(200).await;
    }
    assert_eq!(h.status.recv().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_registration_is_refreshed_before_expiry() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let first = h.expect(SipMethod::Register).await;
    h.send(&challenge(&first, "7a9c")).await;
    let second = h.expect(SipMethod::Register).await;
    h.send(&reply(&second, 200, "Expires: 60\r\n", "")).await;
    start.await.unwrap().unwrap();
    assert_eq!(h.status.recv().await, Some(true));

    // Due 5 seconds before the granted 60
    let refresh = h.expect(SipMethod::Register).await;
    assert_eq!(refresh.call_id(), first.call_id());
    assert!(refresh
        .header("Authorization")
        .unwrap()
        .contains("response=\"a949fc795288209c65bdab86ff640270\""));
    h.send(&reply(&refresh, 200, "Expires: 60\r\n", "")).await;
    assert_eq!(h.status.recv().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_stop_deregisters_and_unsubscribes() {
    let mut h = Harness::new().await;
    h.start().await;
    let registration = h.agent.registration().await.unwrap();

    let agent = h.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });

    let deregister = h.expect(SipMethod::Register).await;
    assert_eq!(deregister.call_id(), Some(registration.call_id.as_str()));
    assert_eq!(deregister.header("Expires"), Some("0"));
    h.send(&reply(&deregister, 200, "", "")).await;

    let (line, unsubscribe) = h.next_raw().await;
    assert_eq!(line, "SUBSCRIBE sip:Unknown@10.0.0.5:5060 SIP/2.0");
    assert_eq!(unsubscribe.header("Expires"), Some("0"));
    assert_eq!(unsubscribe.header("Event"), Some("message-summary"));
    h.send(&reply(&unsubscribe, 200, "", "")).await;

    stop.await.unwrap().unwrap();
    assert_eq!(h.status.recv().await, Some(false));
    assert!(h.agent.registration().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_reports_down() {
    let mut h = Harness::new().await;
    h.start().await;

    h.peer.close_incoming();
    assert_eq!(h.status.recv().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_crlf_keepalive() {
    let mut h = Harness::new().await;
    h.start().await;

    h.agent.keepalive().await.unwrap();
    let datagram = h.peer.recv_raw().await.unwrap();
    assert_eq!(&datagram.data[..], b"\r\n\r\n");
}

#[tokio::test(start_paused = true)]
async fn test_failed_deregistration_skips_unsubscribe() {
    let mut h = Harness::new().await;
    h.start().await;

    let agent = h.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });

    let deregister = h.expect(SipMethod::Register).await;
    assert_eq!(deregister.header("Expires"), Some("0"));
    h.send(&reply(&deregister, 403, "", "")).await;

    let result = stop.await.unwrap();
    assert!(matches!(result, Err(SipError::Rejected { code: 403, .. })));
    assert!(h.peer.try_recv().is_none());
    assert_eq!(h.status.recv().await, Some(false));
    assert!(h.agent.registration().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_refresh_still_deregisters() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let first = h.expect(SipMethod::Register).await;
    h.send(&reply(&first, 200, "Expires: 60\r\n", "")).await;
    start.await.unwrap().unwrap();
    assert_eq!(h.status.recv().await, Some(true));

    // Leave the refresh unanswered
    let refresh = h.expect(SipMethod::Register).await;
    assert_ne!(refresh.header("Expires"), Some("0"));

    let agent = h.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });

    let deregister = h.expect(SipMethod::Register).await;
    assert_eq!(deregister.call_id(), first.call_id());
    assert_eq!(deregister.header("Expires"), Some("0"));
    assert!(deregister.cseq().unwrap().seq > refresh.cseq().unwrap().seq);
    h.send(&reply(&deregister, 200, "", "")).await;

    let unsubscribe = h.expect(SipMethod::Subscribe).await;
    h.send(&reply(&unsubscribe, 200, "", "")).await;
    stop.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_register_server_error_honours_retry_after() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let first = h.expect(SipMethod::Register).await;
    let failed_at = tokio::time::Instant::now();
    h.send(&reply(&first, 503, "Retry-After: 2\r\n", "")).await;

    let second = h.expect(SipMethod::Register).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(2));
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq().unwrap().seq, first.cseq().unwrap().seq + 1);
    h.send(&reply(&second, 200, "Expires: 3600\r\n", "")).await;

    start.await.unwrap().unwrap();
    assert_eq!(h.status.recv().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_register_second_server_error_is_terminal() {
    let mut h = Harness::new().await;
    let agent = h.agent.clone();
    let start = tokio::spawn(async move { agent.start().await });

    let first = h.expect(SipMethod::Register).await;
    let failed_at = tokio::time::Instant::now();
    h.send(&reply(&first, 500, "", "")).await;

    // No Retry-After: the configured delay applies
    let second = h.expect(SipMethod::Register).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(5));
    h.send(&reply(&second, 500, "", "")).await;

    let result = start.await.unwrap();
    assert!(matches!(result, Err(SipError::Rejected { code: 500, .. })));
    assert_eq!(h.status.recv().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_deregistration_retried_after_server_error() {
    let mut h = Harness::new().await;
    h.start().await;

    let agent = h.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });

    let first = h.expect(SipMethod::Register).await;
    h.send(&reply(&first, 500, "Retry-After: 1\r\n", "")).await;
    let second = h.expect(SipMethod::Register).await;
    assert_eq!(second.header("Expires"), Some("0"));
    h.send(&reply(&second, 200, "", "")).await;

    let unsubscribe = h.expect(SipMethod::Subscribe).await;
    h.send(&reply(&unsubscribe, 200, "", "")).await;
    stop.await.unwrap().unwrap();
}
