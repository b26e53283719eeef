//! Outbound Call Tests

mod common;

use common::*;
use sipagent::domain::call::{CallStatus, TransmitMode};
use sipagent::infrastructure::protocols::sip::{CallState, SipError, SipMethod};

fn spawn_invite(h: &Harness) -> tokio::task::JoinHandle<Result<sipagent::infrastructure::protocols::sip::InviteOutcome, SipError>> {
    let agent = h.agent.clone();
    tokio::spawn(async move { agent.invite(CALLEE, media(), TransmitMode::SendRecv).await })
}

#[tokio::test(start_paused = true)]
async fn test_busy_callee() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let (line, invite) = h.next_raw().await;
    assert_eq!(line, "INVITE sip:4155550100@10.0.0.5 SIP/2.0");
    let call_id = invite.call_id().unwrap().to_string();
    let branch = invite.via_branch().unwrap();
    assert_eq!(branch, format!("z9hG4bK{}", &call_id[..25]));
    assert!(invite.body().contains("m=audio 40000 RTP/AVP 0 101\r\n"));
    assert!(invite.body().contains("c=IN IP4 10.0.0.9\r\n"));
    assert!(invite.body().contains("a=sendrecv\r\n"));

    h.send(&reply(&invite, 100, "", "")).await;
    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome.call_id, call_id);
    assert_eq!(outcome.state, CallState::Trying);
    h.expect_update(CallStatus::Trying).await;

    h.send(&reply(&invite, 486, "", "")).await;
    let ack = h.expect(SipMethod::Ack).await;
    assert_eq!(ack.cseq().unwrap().seq, invite.cseq().unwrap().seq);
    assert_eq!(ack.via_branch(), Some(branch));
    assert_eq!(ack.to().unwrap().tag.as_deref(), Some(SERVER_TAG));

    h.expect_update(CallStatus::Busy).await;
    assert!(h.agent.dialog(&call_id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_challenge_then_answer() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let first = h.expect(SipMethod::Invite).await;
    assert!(first.header("Authorization").is_none());
    h.send(&challenge(&first, "n0nce123")).await;
    let ack = h.expect(SipMethod::Ack).await;
    assert_eq!(ack.cseq().unwrap().seq, first.cseq().unwrap().seq);

    let second = h.expect(SipMethod::Invite).await;
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq().unwrap().seq, first.cseq().unwrap().seq + 1);
    assert_ne!(second.via_branch(), first.via_branch());
    let credentials = second.header("Authorization").unwrap();
    assert!(credentials.contains("uri=\"sip:4155550100@10.0.0.5\""));
    assert!(credentials.contains("response=\"521fc46a772daf865ee7d1f36e21cddc\""));

    h.send(&answer(&second)).await;
    let (line, ack) = h.next_raw().await;
    assert_eq!(line, "ACK sip:4155550100@10.0.0.5:5060 SIP/2.0");
    assert_eq!(ack.cseq().unwrap().seq, second.cseq().unwrap().seq);

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome.state, CallState::Established);
    h.expect_update(CallStatus::Established).await;

    let dialog = h.agent.dialog(&outcome.call_id).await.unwrap();
    assert_eq!(dialog.remote_tag.as_deref(), Some(SERVER_TAG));
    assert_eq!(dialog.machine.stats().auth_retries, 1);
    assert!(dialog.auth.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_second_challenge_fails_call() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let first = h.expect(SipMethod::Invite).await;
    h.send(&challenge(&first, "n0nce123")).await;
    h.expect(SipMethod::Ack).await;
    let second = h.expect(SipMethod::Invite).await;
    h.send(&challenge(&second, "n0nce124")).await;
    h.expect(SipMethod::Ack).await;

    let result = call.await.unwrap();
    assert!(matches!(result, Err(SipError::ChallengeExhausted(_))));
    assert!(h.agent.dialog(first.call_id().unwrap()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_503_after_trying_is_not_found() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let invite = h.expect(SipMethod::Invite).await;
    h.send(&reply(&invite, 100, "", "")).await;
    call.await.unwrap().unwrap();
    h.expect_update(CallStatus::Trying).await;

    h.send(&reply(&invite, 503, "", "")).await;
    h.expect(SipMethod::Ack).await;
    h.expect_update(CallStatus::NotFound).await;
}

#[tokio::test(start_paused = true)]
async fn test_503_after_ringing_is_unavailable() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let invite = h.expect(SipMethod::Invite).await;
    h.send(&reply(&invite, 180, "", "")).await;
    assert_eq!(call.await.unwrap().unwrap().state, CallState::Ringing);
    h.expect_update(CallStatus::Ringing).await;

    h.send(&reply(&invite, 503, "", "")).await;
    h.expect(SipMethod::Ack).await;
    h.expect_update(CallStatus::TemporarilyUnavailable).await;
}

#[tokio::test(start_paused = true)]
async fn test_503_without_provisional_is_failure() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let invite = h.expect(SipMethod::Invite).await;
    h.send(&reply(&invite, 503, "", "")).await;
    h.expect(SipMethod::Ack).await;

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome.state, CallState::Failed);
    h.expect_update(CallStatus::Failed(503)).await;
    assert!(h.agent.dialog(&outcome.call_id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_invite_times_out() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let invite = h.expect(SipMethod::Invite).await;
    let result = call.await.unwrap();
    assert!(matches!(result, Err(SipError::Timeout(_))));
    assert!(h.agent.dialog(invite.call_id().unwrap()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hold_and_resume_keep_dialog_identity() {
    let mut h = Harness::new().await;
    h.start().await;
    let call_id = h.established_call().await;
    let dialog = h.agent.dialog(&call_id).await.unwrap();

    let agent = h.agent.clone();
    let id = call_id.clone();
    let hold = tokio::spawn(async move {
        agent.hold(&id, true, media(), TransmitMode::SendRecv).await
    });
    let (line, reinvite) = h.next_raw().await;
    assert_eq!(line, "INVITE sip:4155550100@10.0.0.5:5060 SIP/2.0");
    assert_eq!(reinvite.call_id(), Some(call_id.as_str()));
    assert_eq!(reinvite.from().unwrap().tag, Some(dialog.local_tag.clone()));
    assert_eq!(reinvite.to().unwrap().tag.as_deref(), Some(SERVER_TAG));
    assert!(reinvite.cseq().unwrap().seq > dialog.invite_cseq);
    assert!(reinvite.body().contains("c=IN IP4 0.0.0.0\r\n"));

    h.send(&reply(&reinvite, 200, "", "")).await;
    h.expect(SipMethod::Ack).await;
    assert_eq!(hold.await.unwrap().unwrap(), CallState::OnHold);
    h.expect_update(CallStatus::OnHold).await;

    let agent = h.agent.clone();
    let id = call_id.clone();
    let resume = tokio::spawn(async move {
        agent.hold(&id, false, media(), TransmitMode::SendRecv).await
    });
    let resumed = h.expect(SipMethod::Invite).await;
    assert_eq!(resumed.call_id(), Some(call_id.as_str()));
    assert_eq!(resumed.from().unwrap().tag, Some(dialog.local_tag.clone()));
    assert!(resumed.cseq().unwrap().seq > reinvite.cseq().unwrap().seq);
    assert!(resumed.body().contains("c=IN IP4 10.0.0.9\r\n"));

    h.send(&reply(&resumed, 200, "", "")).await;
    h.expect(SipMethod::Ack).await;
    assert_eq!(resume.await.unwrap().unwrap(), CallState::Established);
    h.expect_update(CallStatus::Established).await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_requires_hold() {
    let mut h = Harness::new().await;
    h.start().await;
    let call_id = h.established_call().await;

    let result = h
        .agent
        .hold(&call_id, false, media(), TransmitMode::SendRecv)
        .await;
    assert!(matches!(result, Err(SipError::InvalidStateTransition(_))));
}

#[tokio::test(start_paused = true)]
async fn test_bye_goes_to_remote_contact() {
    let mut h = Harness::new().await;
    h.start().await;
    let call_id = h.established_call().await;

    let agent = h.agent.clone();
    let id = call_id.clone();
    let bye = tokio::spawn(async move { agent.bye(&id).await });

    let (line, request) = h.next_raw().await;
    assert_eq!(line, "BYE sip:4155550100@10.0.0.5:5060 SIP/2.0");
    assert_eq!(request.call_id(), Some(call_id.as_str()));
    h.expect_update(CallStatus::Ended).await;

    h.send(&reply(&request, 200, "", "")).await;
    bye.await.unwrap().unwrap();
    assert!(h.agent.dialog(&call_id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_bye_rejected_by_server() {
    let mut h = Harness::new().await;
    h.start().await;
    let call_id = h.established_call().await;

    let agent = h.agent.clone();
    let id = call_id.clone();
    let bye = tokio::spawn(async move { agent.bye(&id).await });

    let request = h.expect(SipMethod::Bye).await;
    h.expect_update(CallStatus::Ended).await;
    h.send(&reply(&request, 481, "", "")).await;

    let result = bye.await.unwrap();
    assert!(matches!(result, Err(SipError::Rejected { code: 481, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_ringing_call() {
    let mut h = Harness::new().await;
    h.start().await;
    let call = spawn_invite(&h);

    let invite = h.expect(SipMethod::Invite).await;
    h.send(&reply(&invite, 180, "", "")).await;
    let outcome = call.await.unwrap().unwrap();
    h.expect_update(CallStatus::Ringing).await;

    let agent = h.agent.clone();
    let id = outcome.call_id.clone();
    let cancel = tokio::spawn(async move { agent.cancel(&id).await });

    let (line, request) = h.next_raw().await;
    assert_eq!(line, "CANCEL sip:4155550100@10.0.0.5 SIP/2.0");
    assert_eq!(request.via_branch(), invite.via_branch());
    assert_eq!(request.cseq().unwrap().seq, invite.cseq().unwrap().seq);
    assert_eq!(request.cseq().unwrap().method, SipMethod::Cancel);
    assert!(request.to().unwrap().tag.is_none());

    h.send(&reply(&request, 200, "", "")).await;
    cancel.await.unwrap().unwrap();

    h.send(&reply(&invite, 487, "", "")).await;
    h.expect(SipMethod::Ack).await;
    h.expect_update(CallStatus::Ended).await;
    assert!(h.agent.dialog(&outcome.call_id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_blind_transfer_completes_on_notify() {
    let mut h = Harness::new().await;
    h.start().await;
    let call_id = h.established_call().await;
    let local_tag = h.agent.dialog(&call_id).await.unwrap().local_tag;

    let agent = h.agent.clone();
    let id = call_id.clone();
    let transfer = tokio::spawn(async move { agent.transfer(&id, "200", None).await });

    let (line, refer) = h.next_raw().await;
    assert_eq!(line, "REFER sip:4155550100@10.0.0.5:5060 SIP/2.0");
    assert_eq!(refer.header("Refer-To"), Some("<sip:200@10.0.0.5>"));
    h.send(&reply(&refer, 202, "", "")).await;

    let sipfrag = "SIP/2.0 200 OK\r\n";
    h.send(&in_dialog(
        "NOTIFY",
        &call_id,
        Some(&local_tag),
        2,
        "Event: refer\r\nContent-Type: message/sipfrag\r\n",
        sipfrag,
    ))
    .await;
    let ok = h.expect_status(200).await;
    assert_eq!(ok.cseq().unwrap().method, SipMethod::Notify);

    assert_eq!(transfer.await.unwrap().unwrap(), CallState::Transferred);
    h.expect_update(CallStatus::Transferred).await;
    let dialog = h.agent.dialog(&call_id).await.unwrap();
    assert_eq!(dialog.state(), CallState::Transferred);
}

#[tokio::test(start_paused = true)]
async fn test_attended_transfer_carries_replaces() {
    let mut h = Harness::new().await;
    h.start().await;
    let first = h.established_call().await;
    let second = h.established_call().await;
    let consult = h.agent.dialog(&second).await.unwrap();

    let agent = h.agent.clone();
    let (id, other) = (first.clone(), second.clone());
    let transfer = tokio::spawn(async move { agent.transfer(&id, "200", Some(&other)).await });

    let refer = h.expect(SipMethod::Refer).await;
    assert_eq!(refer.call_id(), Some(first.as_str()));
    let expected = format!(
        "<sip:200@10.0.0.5?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}>",
        second, SERVER_TAG, consult.local_tag
    );
    assert_eq!(refer.header("Refer-To"), Some(expected.as_str()));

    h.send(&reply(&refer, 603, "", "")).await;
    let result = transfer.await.unwrap();
    assert!(matches!(result, Err(SipError::Rejected { code: 603, .. })));
    assert_eq!(
        h.agent.dialog(&first).await.unwrap().state(),
        CallState::Established
    );
}

#[tokio::test(start_paused = true)]
async fn test_message_with_challenge() {
    let mut h = Harness::new().await;
    h.start().await;

    let agent = h.agent.clone();
    let send = tokio::spawn(async move { agent.send_message(CALLEE, "hello").await });

    let (line, first) = h.next_raw().await;
    assert_eq!(line, "MESSAGE sip:4155550100@10.0.0.5 SIP/2.0");
    assert_eq!(first.body(), "hello");
    assert_eq!(first.header("Content-Type"), Some("text/plain"));
    h.send(&challenge(&first, "n0nce123")).await;

    let second = h.expect(SipMethod::Message).await;
    assert!(second
        .header("Authorization")
        .unwrap()
        .contains("response=\"7d3400bb9b01155af0fa7bb56ed245a3\""));
    h.send(&reply(&second, 202, "", "")).await;
    send.await.unwrap().unwrap();
}
