//! Room key sharing, rotation and decryption across simulated devices.

use std::{collections::BTreeSet, sync::Arc};

use proptest::prelude::*;
use trustcore_core::{
    MachineError,
    config::{GroupSessionConfig, MachineConfig},
    group::GroupSessionError,
    ids::{DeviceAddress, RoomId},
};
use trustcore_harness::{SimMachine, TestCluster};

const ALICE: &str = "@alice:example.org";

fn room() -> RoomId {
    RoomId::new("!room:example.org")
}

fn member(n: usize) -> DeviceAddress {
    DeviceAddress::new(format!("@member{n}:example.org"), "DEVICE")
}

/// Alice plus `members` other users with one device each, all introduced.
fn room_cluster(
    seed: u64,
    members: usize,
    config: MachineConfig,
) -> (TestCluster, Arc<SimMachine>, Vec<Arc<SimMachine>>) {
    let mut cluster = TestCluster::with_config(seed, config);
    let alice = cluster.add_device(ALICE, "ALICE");
    let others = (0..members)
        .map(|n| {
            let address = member(n);
            cluster.add_device(address.user_id.as_str(), address.device_id.as_str())
        })
        .collect();
    cluster.introduce_all().unwrap();
    (cluster, alice, others)
}

#[tokio::test]
async fn every_member_decrypts_after_sharing() {
    let (cluster, alice, others) = room_cluster(1, 3, MachineConfig::default());

    let message = alice.encrypt_room_message(&room(), b"hello room", &cluster.addresses()).await.unwrap();
    assert!(cluster.deliver_all().await.is_clean());

    for other in &others {
        assert_eq!(other.decrypt_room_message(&room(), &message).unwrap(), b"hello room");
    }
    // The sender keeps an inbound copy of its own session.
    assert_eq!(alice.decrypt_room_message(&room(), &message).unwrap(), b"hello room");

    let info = alice.groups().outbound_session_info(&room()).await.unwrap();
    assert_eq!(info.shared_with, (0..3).map(member).collect());
    assert!(info.withheld.is_empty());
    assert_eq!(info.use_count, 1);
}

#[tokio::test]
async fn session_key_is_shared_once() {
    let (cluster, alice, others) = room_cluster(2, 2, MachineConfig::default());

    alice.encrypt_room_message(&room(), b"one", &cluster.addresses()).await.unwrap();
    let first = cluster.deliver_all().await;
    alice.encrypt_room_message(&room(), b"two", &cluster.addresses()).await.unwrap();
    let second = cluster.deliver_all().await;

    assert_eq!(first.delivered, 2);
    assert_eq!(second.delivered, 0);
    assert_eq!(others[0].groups().export_inbound_sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn blocked_device_never_gets_the_key() {
    let (cluster, alice, others) = room_cluster(3, 2, MachineConfig::default());
    alice.devices().block(&member(1)).unwrap();

    let message = alice.encrypt_room_message(&room(), b"secret", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    assert!(others[0].decrypt_room_message(&room(), &message).is_ok());
    assert!(matches!(
        others[1].decrypt_room_message(&room(), &message),
        Err(MachineError::Group(GroupSessionError::MissingSession { .. }))
    ));
    let info = alice.groups().outbound_session_info(&room()).await.unwrap();
    assert!(!info.shared_with.contains(&member(1)));
}

#[tokio::test]
async fn unblocking_rotates_the_session() {
    let (cluster, alice, others) = room_cluster(4, 1, MachineConfig::default());
    alice.devices().block(&member(0)).unwrap();
    let first = alice.encrypt_room_message(&room(), b"before", &cluster.addresses()).await.unwrap();

    alice.devices().unblock(&member(0)).unwrap();
    let second = alice.encrypt_room_message(&room(), b"after", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    assert_ne!(first.session_id, second.session_id);
    assert_eq!(others[0].decrypt_room_message(&room(), &second).unwrap(), b"after");
    assert!(others[0].decrypt_room_message(&room(), &first).is_err());
}

#[tokio::test]
async fn unreachable_device_is_withheld_then_caught_up() {
    let (cluster, alice, others) = room_cluster(5, 2, MachineConfig::default());
    cluster.network().set_unreachable(&member(1));

    let first = alice.encrypt_room_message(&room(), b"first", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;
    let info = alice.groups().outbound_session_info(&room()).await.unwrap();
    assert_eq!(info.withheld, BTreeSet::from([member(1)]));
    assert_eq!(others[0].decrypt_room_message(&room(), &first).unwrap(), b"first");

    cluster.network().set_reachable(&member(1));
    let second = alice.encrypt_room_message(&room(), b"second", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    // Same session; the late device can read from where it joined.
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(others[1].decrypt_room_message(&room(), &second).unwrap(), b"second");
    let info = alice.groups().outbound_session_info(&room()).await.unwrap();
    assert!(info.withheld.is_empty());
    assert!(info.shared_with.contains(&member(1)));
}

#[tokio::test]
async fn transient_failures_are_retried_within_one_send() {
    let (cluster, alice, others) = room_cluster(6, 1, MachineConfig::default());
    cluster.network().fail_next_sends(&member(0), 2);

    let message = alice.encrypt_room_message(&room(), b"eventually", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    assert_eq!(others[0].decrypt_room_message(&room(), &message).unwrap(), b"eventually");
}

#[tokio::test]
async fn message_limit_rotates_the_session() {
    let config = MachineConfig {
        group: GroupSessionConfig { rotation_message_count: 2, ..GroupSessionConfig::default() },
        ..MachineConfig::default()
    };
    let (cluster, alice, others) = room_cluster(7, 1, config);

    let mut session_ids = Vec::new();
    let mut messages = Vec::new();
    for body in [b"m1", b"m2", b"m3"] {
        let message = alice.encrypt_room_message(&room(), body, &cluster.addresses()).await.unwrap();
        session_ids.push(message.session_id.clone());
        messages.push(message);
    }
    cluster.deliver_all().await;

    assert_eq!(session_ids[0], session_ids[1]);
    assert_ne!(session_ids[1], session_ids[2]);
    for message in &messages {
        assert!(others[0].decrypt_room_message(&room(), message).is_ok());
    }
}

#[tokio::test]
async fn new_member_gets_a_fresh_session() {
    let mut cluster = TestCluster::new(8);
    let alice = cluster.add_device(ALICE, "ALICE");
    let first_member = cluster.add_device("@member0:example.org", "DEVICE");
    cluster.introduce_all().unwrap();

    let before = alice.encrypt_room_message(&room(), b"before", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    let late = cluster.add_device("@member1:example.org", "DEVICE");
    cluster.introduce_all().unwrap();
    let after = alice.encrypt_room_message(&room(), b"after", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;

    assert_ne!(before.session_id, after.session_id);
    assert!(late.decrypt_room_message(&room(), &before).is_err());
    assert_eq!(late.decrypt_room_message(&room(), &after).unwrap(), b"after");
    assert_eq!(first_member.decrypt_room_message(&room(), &after).unwrap(), b"after");
}

#[tokio::test]
async fn key_request_is_withdrawn_once_the_key_arrives() {
    let (cluster, alice, others) = room_cluster(9, 1, MachineConfig::default());
    cluster.network().set_unreachable(&member(0));
    let message = alice.encrypt_room_message(&room(), b"missed", &cluster.addresses()).await.unwrap();

    let request = others[0]
        .groups()
        .request_room_key(&room(), message.sender_key, &message.session_id)
        .await
        .unwrap();
    assert!(request.is_some());
    assert_eq!(others[0].groups().pending_key_requests().len(), 1);

    // Asking twice does not duplicate the request.
    let again = others[0]
        .groups()
        .request_room_key(&room(), message.sender_key, &message.session_id)
        .await
        .unwrap();
    assert!(again.is_none());

    cluster.network().set_reachable(&member(0));
    alice.encrypt_room_message(&room(), b"catch up", &cluster.addresses()).await.unwrap();
    cluster.deliver_all().await;
    assert!(others[0].groups().pending_key_requests().is_empty());
}

#[tokio::test]
async fn replayed_to_device_payload_is_rejected() {
    let (cluster, alice, others) = room_cluster(10, 1, MachineConfig::default());
    alice.encrypt_room_message(&room(), b"once", &cluster.addresses()).await.unwrap();

    let envelopes = cluster.network().take_all();
    assert_eq!(envelopes.len(), 1);
    let envelope = &envelopes[0];

    others[0].receive_to_device(&envelope.sender.user_id, &envelope.payload).await.unwrap();
    let err = others[0].receive_to_device(&envelope.sender.user_id, &envelope.payload).await.unwrap_err();
    assert!(err.is_tamper());
}

#[tokio::test]
async fn payload_claiming_another_user_is_rejected() {
    let (cluster, alice, others) = room_cluster(11, 2, MachineConfig::default());
    alice.encrypt_room_message(&room(), b"hello", &cluster.addresses()).await.unwrap();

    let envelope = cluster.network().take_inbox(&member(0)).remove(0);
    let impostor = member(1).user_id;
    assert!(others[0].receive_to_device(&impostor, &envelope.payload).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_share_one_session() {
    let (cluster, alice, others) = room_cluster(12, 2, MachineConfig::default());
    let devices = cluster.addresses();

    let mut tasks = Vec::new();
    for n in 0..16u8 {
        let alice = Arc::clone(&alice);
        let devices = devices.clone();
        tasks.push(tokio::spawn(async move {
            alice.encrypt_room_message(&room(), &[n], &devices).await
        }));
    }
    let mut messages = Vec::new();
    for task in tasks {
        messages.push(task.await.unwrap().unwrap());
    }
    cluster.deliver_all().await;

    let sessions: BTreeSet<_> = messages.iter().map(|m| m.session_id.clone()).collect();
    assert_eq!(sessions.len(), 1);
    let indices: BTreeSet<_> = messages.iter().map(|m| m.message_index).collect();
    assert_eq!(indices.len(), messages.len());

    for other in &others {
        for message in &messages {
            let plaintext = other.decrypt_room_message(&room(), message).unwrap();
            assert_eq!(plaintext.len(), 1);
        }
    }
    assert_eq!(alice.groups().outbound_session_info(&room()).await.unwrap().use_count, 16);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever subset of members is unreachable, the session is shared with
    /// exactly the reachable ones, the rest are withheld, and every member
    /// reads new messages once the network heals.
    #[test]
    fn prop_share_set_matches_reachability(
        seed in 1u64..10_000,
        unreachable in proptest::collection::btree_set(0usize..4, 0..=4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (cluster, alice, others) = room_cluster(seed, 4, MachineConfig::default());
            for n in &unreachable {
                cluster.network().set_unreachable(&member(*n));
            }

            alice.encrypt_room_message(&room(), b"partial", &cluster.addresses()).await.unwrap();
            cluster.deliver_all().await;

            let info = alice.groups().outbound_session_info(&room()).await.unwrap();
            let withheld: BTreeSet<_> = unreachable.iter().map(|n| member(*n)).collect();
            let shared: BTreeSet<_> = (0..4).filter(|n| !unreachable.contains(n)).map(member).collect();
            assert_eq!(info.withheld, withheld);
            assert_eq!(info.shared_with, shared);

            cluster.network().heal();
            let healed = alice.encrypt_room_message(&room(), b"healed", &cluster.addresses()).await.unwrap();
            cluster.deliver_all().await;
            for other in &others {
                assert_eq!(other.decrypt_room_message(&room(), &healed).unwrap(), b"healed");
            }
        });
    }

    /// As members join and leave, the session in use is shared with exactly
    /// the current members, and only they can read each message.
    #[test]
    fn prop_share_set_follows_membership(
        seed in 1u64..10_000,
        memberships in proptest::collection::vec(proptest::collection::btree_set(0usize..5, 0..=5), 1..=8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (cluster, alice, others) = room_cluster(seed, 5, MachineConfig::default());
            let own = DeviceAddress::new(ALICE, "ALICE");

            for present in &memberships {
                let devices: Vec<_> = std::iter::once(own.clone()).chain(present.iter().map(|n| member(*n))).collect();
                let message = alice.encrypt_room_message(&room(), b"members only", &devices).await.unwrap();
                assert!(cluster.deliver_all().await.is_clean());

                let info = alice.groups().outbound_session_info(&room()).await.unwrap();
                let expected: BTreeSet<_> = present.iter().map(|n| member(*n)).collect();
                assert_eq!(info.shared_with, expected);
                assert!(info.withheld.is_empty());

                for (n, other) in others.iter().enumerate() {
                    let decrypted = other.decrypt_room_message(&room(), &message);
                    if present.contains(&n) {
                        assert_eq!(decrypted.unwrap(), b"members only");
                    } else {
                        assert!(decrypted.is_err(), "{} read a message after leaving", member(n));
                    }
                }
            }
        });
    }
}
