//! Interactive verification between simulated devices.
//!
//! Every flow runs over the simulated network: each message is encrypted by
//! the sender's pairwise channel, queued, and decrypted by the recipient's
//! machine before the verification engine sees it.

use std::{sync::Arc, time::Duration};

use trustcore_core::{
    MachineConfig, TrustState,
    config::VerificationConfig,
    ids::{DeviceAddress, RoomId},
    verification::{CancelCode, VerificationError, VerificationMethod, VerificationState, VerificationUpdate},
};
use trustcore_harness::{SimMachine, TestCluster};

const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

fn alice() -> DeviceAddress {
    DeviceAddress::new(ALICE, "ALICE")
}

fn bob() -> DeviceAddress {
    DeviceAddress::new(BOB, "BOB")
}

fn trust(machine: &SimMachine, address: &DeviceAddress) -> TrustState {
    machine.devices().device(address).unwrap().unwrap().trust
}

/// Two introduced devices; returns (cluster, alice, bob).
fn pair(seed: u64) -> (TestCluster, Arc<SimMachine>, Arc<SimMachine>) {
    let mut cluster = TestCluster::new(seed);
    let a = cluster.add_device(ALICE, "ALICE");
    let b = cluster.add_device(BOB, "BOB");
    cluster.introduce_all().unwrap();
    (cluster, a, b)
}

/// Request from alice, accepted by bob, delivered both ways.
async fn ready_request(cluster: &TestCluster, a: &SimMachine, b: &SimMachine) -> String {
    let request = a
        .verification()
        .request_verification(&bob().user_id, Some(&bob().device_id))
        .await
        .unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    let incoming = b.verification().request(&request.transaction_id).await.unwrap();
    assert!(incoming.incoming);
    assert_eq!(incoming.other_device_id, Some(alice().device_id));

    b.verification().accept_request(&request.transaction_id).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());
    assert!(a.verification().request(&request.transaction_id).await.unwrap().is_ready());
    request.transaction_id
}

#[tokio::test]
async fn sas_verification_marks_both_devices_verified() {
    let (cluster, a, b) = pair(1);
    let txn = ready_request(&cluster, &a, &b).await;

    a.verification().start_sas(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    let ours = a.verification().transaction(&txn).await.unwrap();
    let theirs = b.verification().transaction(&txn).await.unwrap();
    assert_eq!(ours.state, VerificationState::ShortCodeReady);
    assert_eq!(theirs.state, VerificationState::ShortCodeReady);
    assert!(ours.we_started);
    assert!(!theirs.we_started);
    assert!(ours.short_code.is_some());
    assert_eq!(ours.short_code, theirs.short_code);

    // Nothing is trusted before both users confirm.
    assert_eq!(trust(&a, &bob()), TrustState::Unknown);

    a.verification().confirm_short_code(&txn).await.unwrap();
    b.verification().confirm_short_code(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    assert_eq!(a.verification().transaction(&txn).await.unwrap().state, VerificationState::Verified);
    assert_eq!(b.verification().transaction(&txn).await.unwrap().state, VerificationState::Verified);
    assert_eq!(trust(&a, &bob()), TrustState::Verified);
    assert_eq!(trust(&b, &alice()), TrustState::Verified);
    assert!(a.verification().request(&txn).await.unwrap().is_successful);
}

#[tokio::test]
async fn cluster_helper_runs_the_whole_exchange() {
    let (cluster, a, _b) = pair(2);
    let (ours, theirs) = cluster.verify_with_sas(&alice(), &bob()).await.unwrap();
    assert_eq!(ours.state, VerificationState::Verified);
    assert_eq!(theirs.state, VerificationState::Verified);
    assert!(a.devices().device(&bob()).unwrap().unwrap().is_verified());
}

#[tokio::test]
async fn rejected_short_code_cancels_without_trust() {
    let (cluster, a, b) = pair(3);
    let txn = ready_request(&cluster, &a, &b).await;
    a.verification().start_sas(&txn).await.unwrap();
    cluster.deliver_all().await;

    a.verification().confirm_short_code(&txn).await.unwrap();
    b.verification().reject_short_code(&txn).await.unwrap();
    cluster.deliver_all().await;

    let ours = a.verification().transaction(&txn).await.unwrap();
    let theirs = b.verification().transaction(&txn).await.unwrap();
    assert_eq!(ours.state, VerificationState::Cancelled { code: CancelCode::MismatchedSas, by_me: false });
    assert_eq!(theirs.state, VerificationState::Cancelled { code: CancelCode::MismatchedSas, by_me: true });
    assert_eq!(trust(&a, &bob()), TrustState::Unknown);
    assert_eq!(trust(&b, &alice()), TrustState::Unknown);
    assert_eq!(a.verification().request(&txn).await.unwrap().cancel_code, Some(CancelCode::MismatchedSas));
}

#[tokio::test]
async fn user_cancel_reaches_the_peer() {
    let (cluster, a, b) = pair(4);
    let txn = ready_request(&cluster, &a, &b).await;

    a.verification().cancel(&txn).await.unwrap();
    cluster.deliver_all().await;

    assert_eq!(b.verification().request(&txn).await.unwrap().cancel_code, Some(CancelCode::User));
    assert!(matches!(
        b.verification().start_sas(&txn).await,
        Err(VerificationError::InvalidState { .. })
    ));
    // Cancelling a finished flow is a no-op.
    a.verification().cancel(&txn).await.unwrap();
}

#[tokio::test]
async fn blocking_mid_flow_cancels_instead_of_verifying() {
    let (cluster, a, b) = pair(18);
    let txn = ready_request(&cluster, &a, &b).await;
    a.verification().start_sas(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    a.devices().block(&bob()).unwrap();
    b.verification().confirm_short_code(&txn).await.unwrap();
    let ours = a.verification().confirm_short_code(&txn).await.unwrap();
    assert_eq!(ours.state, VerificationState::Cancelled { code: CancelCode::User, by_me: true });
    cluster.deliver_all().await;

    assert_eq!(trust(&a, &bob()), TrustState::Blocked);
    assert_eq!(
        b.verification().transaction(&txn).await.unwrap().state,
        VerificationState::Cancelled { code: CancelCode::User, by_me: false }
    );
    assert_eq!(trust(&b, &alice()), TrustState::Unknown);
}

#[tokio::test]
async fn confirming_out_of_order_is_rejected_without_cancelling() {
    let (cluster, a, b) = pair(5);
    let txn = ready_request(&cluster, &a, &b).await;

    assert!(matches!(
        a.verification().confirm_short_code(&txn).await,
        Err(VerificationError::InvalidState { .. })
    ));
    assert!(!a.verification().request(&txn).await.unwrap().is_finished());

    assert!(matches!(
        a.verification().confirm_short_code("no-such-transaction").await,
        Err(VerificationError::UnknownTransaction(_))
    ));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (cluster, a, b) = pair(6);
    let request = a
        .verification()
        .request_verification(&bob().user_id, Some(&bob().device_id))
        .await
        .unwrap();
    cluster.deliver_all().await;

    cluster.env().advance(Duration::from_secs(9 * 60));
    assert!(a.verification().check_timeouts().await.is_empty());

    cluster.env().advance(Duration::from_secs(2 * 60));
    assert_eq!(a.verification().check_timeouts().await, vec![request.transaction_id.clone()]);
    cluster.deliver_all().await;

    let ours = a.verification().request(&request.transaction_id).await.unwrap();
    let theirs = b.verification().request(&request.transaction_id).await.unwrap();
    assert_eq!(ours.cancel_code, Some(CancelCode::Timeout));
    assert_eq!(theirs.cancel_code, Some(CancelCode::Timeout));

    // Already cancelled flows are not reported again.
    cluster.env().advance(Duration::from_secs(60 * 60));
    assert!(a.verification().check_timeouts().await.is_empty());
}

#[tokio::test]
async fn finished_flows_are_forgotten_after_retention() {
    let (cluster, a, b) = pair(16);
    for _ in 0..50 {
        let request = a
            .verification()
            .request_verification(&bob().user_id, Some(&bob().device_id))
            .await
            .unwrap();
        a.verification().cancel(&request.transaction_id).await.unwrap();
    }
    let verified = ready_request(&cluster, &a, &b).await;
    a.verification().start_sas(&verified).await.unwrap();
    cluster.deliver_all().await;
    a.verification().confirm_short_code(&verified).await.unwrap();
    b.verification().confirm_short_code(&verified).await.unwrap();
    cluster.deliver_all().await;
    assert_eq!(a.verification().requests().await.len(), 51);

    // Still inside the retention window: late messages find the flow.
    cluster.env().advance(Duration::from_secs(60));
    assert!(a.verification().check_timeouts().await.is_empty());
    assert_eq!(a.verification().requests().await.len(), 51);

    cluster.env().advance(Duration::from_secs(2 * 60));
    assert!(a.verification().check_timeouts().await.is_empty());
    assert!(a.verification().requests().await.is_empty());
    assert!(a.verification().transaction(&verified).await.is_none());
    assert_eq!(trust(&a, &bob()), TrustState::Verified);
}

#[tokio::test]
async fn stalled_transaction_times_out() {
    let (cluster, a, b) = pair(7);
    let txn = ready_request(&cluster, &a, &b).await;
    a.verification().start_sas(&txn).await.unwrap();
    cluster.deliver_all().await;

    cluster.env().advance(Duration::from_secs(11 * 60));
    assert_eq!(b.verification().check_timeouts().await, vec![txn.clone()]);
    cluster.deliver_all().await;

    assert_eq!(
        a.verification().transaction(&txn).await.unwrap().state,
        VerificationState::Cancelled { code: CancelCode::Timeout, by_me: false }
    );
    assert_eq!(trust(&a, &bob()), TrustState::Unknown);
}

#[tokio::test]
async fn sas_only_devices_offer_no_qr_code() {
    let config = MachineConfig {
        verification: VerificationConfig { methods: vec![VerificationMethod::SasV1], ..VerificationConfig::default() },
        ..MachineConfig::default()
    };
    let mut cluster = TestCluster::with_config(17, config);
    let a = cluster.add_device(ALICE, "ALICE");
    let b = cluster.add_device(BOB, "BOB");
    cluster.introduce_all().unwrap();
    let txn = ready_request(&cluster, &a, &b).await;

    let request = a.verification().request(&txn).await.unwrap();
    assert_eq!(request.requested_methods, vec![VerificationMethod::SasV1]);
    assert!(request.sas_supported());
    assert!(!request.other_can_scan_qr());
    assert!(!request.other_can_show_qr());
    assert!(matches!(
        a.verification().qr_code(&txn).await,
        Err(VerificationError::MethodUnsupported(VerificationMethod::QrCodeShow))
    ));

    a.verification().start_sas(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());
    assert_eq!(b.verification().transaction(&txn).await.unwrap().state, VerificationState::ShortCodeReady);
}

#[tokio::test]
async fn qr_verification_by_scanning() {
    let (cluster, a, b) = pair(8);
    let txn = ready_request(&cluster, &a, &b).await;

    let code = a.verification().qr_code(&txn).await.unwrap();
    assert_eq!(a.verification().qr_code(&txn).await.unwrap(), code);

    b.verification().scan_qr_code(&txn, &code.encode()).await.unwrap();
    cluster.deliver_all().await;
    assert_eq!(
        b.verification().transaction(&txn).await.unwrap().state,
        VerificationState::WaitingOtherReciprocateConfirm
    );
    assert_eq!(a.verification().transaction(&txn).await.unwrap().state, VerificationState::QrScannedByOther);

    a.verification().confirm_qr_scanned(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    assert_eq!(a.verification().transaction(&txn).await.unwrap().state, VerificationState::Verified);
    assert_eq!(b.verification().transaction(&txn).await.unwrap().state, VerificationState::Verified);
    assert_eq!(trust(&a, &bob()), TrustState::Verified);
    assert_eq!(trust(&b, &alice()), TrustState::Verified);
}

#[tokio::test]
async fn unreadable_qr_code_can_be_rescanned() {
    let (cluster, a, b) = pair(9);
    let txn = ready_request(&cluster, &a, &b).await;
    let code = a.verification().qr_code(&txn).await.unwrap();

    assert!(matches!(
        b.verification().scan_qr_code(&txn, b"not a qr code").await,
        Err(VerificationError::InvalidQrCode(_))
    ));
    assert!(!b.verification().request(&txn).await.unwrap().is_finished());

    b.verification().scan_qr_code(&txn, &code.encode()).await.unwrap();
}

#[tokio::test]
async fn qr_code_for_another_transaction_cancels() {
    let (cluster, a, b) = pair(10);
    let txn = ready_request(&cluster, &a, &b).await;
    let mut code = a.verification().qr_code(&txn).await.unwrap();
    code.transaction_id = "some-other-transaction".to_string();

    assert!(matches!(
        b.verification().scan_qr_code(&txn, &code.encode()).await,
        Err(VerificationError::Cancelled(CancelCode::QrCodeInvalid))
    ));
    cluster.deliver_all().await;
    assert_eq!(a.verification().request(&txn).await.unwrap().cancel_code, Some(CancelCode::QrCodeInvalid));
}

#[tokio::test]
async fn in_room_request_uses_the_event_id() {
    let (cluster, a, b) = pair(11);
    let room = RoomId::new("!dm:example.org");

    let request = a.verification().request_verification_in_room(&room, &bob().user_id).await.unwrap();
    let received = cluster.deliver_room_events(&room).unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].transaction_id, request.transaction_id);
    assert_eq!(received[0].room_id, Some(room.clone()));

    // Seeing the same event again creates nothing new.
    assert!(cluster.deliver_room_events(&room).unwrap().is_empty());

    let txn = request.transaction_id;
    b.verification().accept_request(&txn).await.unwrap();
    cluster.deliver_all().await;
    assert_eq!(a.verification().request(&txn).await.unwrap().other_device_id, Some(bob().device_id));

    a.verification().start_sas(&txn).await.unwrap();
    cluster.deliver_all().await;
    a.verification().confirm_short_code(&txn).await.unwrap();
    b.verification().confirm_short_code(&txn).await.unwrap();
    cluster.deliver_all().await;

    assert_eq!(trust(&a, &bob()), TrustState::Verified);
    assert_eq!(trust(&b, &alice()), TrustState::Verified);
}

#[tokio::test]
async fn simultaneous_starts_settle_on_one_transaction() {
    let (cluster, a, b) = pair(12);
    let txn = ready_request(&cluster, &a, &b).await;

    a.verification().start_sas(&txn).await.unwrap();
    b.verification().start_sas(&txn).await.unwrap();
    cluster.deliver_all().await;

    // Alice has the lower address, so her start wins.
    let ours = a.verification().transaction(&txn).await.unwrap();
    let theirs = b.verification().transaction(&txn).await.unwrap();
    assert!(ours.we_started);
    assert!(!theirs.we_started);
    assert_eq!(ours.state, VerificationState::ShortCodeReady);
    assert_eq!(ours.short_code, theirs.short_code);
}

#[tokio::test]
async fn request_to_every_device_is_claimed_by_the_first_answer() {
    let mut cluster = TestCluster::new(13);
    let a = cluster.add_device(ALICE, "ALICE");
    let phone = cluster.add_device(BOB, "PHONE");
    let laptop = cluster.add_device(BOB, "LAPTOP");
    cluster.introduce_all().unwrap();

    let request = a.verification().request_verification(&bob().user_id, None).await.unwrap();
    cluster.deliver_all().await;
    let txn = request.transaction_id;
    assert!(phone.verification().request(&txn).await.is_some());
    assert!(laptop.verification().request(&txn).await.is_some());

    laptop.verification().accept_request(&txn).await.unwrap();
    cluster.deliver_all().await;
    assert_eq!(
        a.verification().request(&txn).await.unwrap().other_device_id,
        Some(DeviceAddress::new(BOB, "LAPTOP").device_id)
    );

    // A late answer from the other device is ignored.
    phone.verification().accept_request(&txn).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());
    assert!(!a.verification().request(&txn).await.unwrap().is_finished());
}

#[tokio::test]
async fn listeners_see_request_and_transaction_updates() {
    let (cluster, a, b) = pair(14);
    let mut updates = b.verification().subscribe();
    let txn = ready_request(&cluster, &a, &b).await;

    let first = updates.recv().await.unwrap();
    assert!(matches!(
        first,
        VerificationUpdate::Request(ref request) if request.transaction_id == txn
    ));
}
