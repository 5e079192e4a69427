//! Pairwise channels between simulated devices.

use trustcore_core::{
    codec,
    direct::{DirectMessage, DirectSessionError},
    ids::DeviceAddress,
    messages::ToDeviceContent,
};
use trustcore_crypto::{AgreementPublicKey, CryptoError};
use trustcore_harness::TestCluster;

const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";
const CAROL: &str = "@carol:example.org";

fn alice() -> DeviceAddress {
    DeviceAddress::new(ALICE, "ALICE")
}

fn bob() -> DeviceAddress {
    DeviceAddress::new(BOB, "BOB")
}

fn carol() -> DeviceAddress {
    DeviceAddress::new(CAROL, "CAROL")
}

fn ping() -> ToDeviceContent {
    ToDeviceContent::Unknown("org.example.ping".into())
}

#[tokio::test]
async fn second_message_reuses_the_session() {
    let mut cluster = TestCluster::new(1);
    let a = cluster.add_device(ALICE, "ALICE");
    let b = cluster.add_device(BOB, "BOB");
    cluster.introduce_all().unwrap();
    let bob_identity = a.devices().device(&bob()).unwrap().unwrap();
    assert!(!a.direct().has_outbound_session(&bob()).await);

    let first_payload = a.direct().encrypt_for(&bob_identity, &ping()).await.unwrap();
    assert!(a.direct().has_outbound_session(&bob()).await);
    let second_payload = a.direct().encrypt_for(&bob_identity, &ping()).await.unwrap();

    let first: DirectMessage = codec::decode(&first_payload).unwrap();
    let second: DirectMessage = codec::decode(&second_payload).unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.index, first.index + 1);
    assert_eq!(first.pre_key, second.pre_key);

    for payload in [&first_payload, &second_payload] {
        let decrypted = b.receive_to_device(&alice().user_id, payload).await.unwrap();
        assert_eq!(decrypted.sender.address(), alice());
        assert_eq!(decrypted.content, ping());
    }
}

#[tokio::test]
async fn one_bad_recipient_does_not_stop_the_others() {
    let mut cluster = TestCluster::new(2);
    let a = cluster.add_device(ALICE, "ALICE");
    let b = cluster.add_device(BOB, "BOB");
    let c = cluster.add_device(CAROL, "CAROL");
    cluster.introduce_all().unwrap();

    let bob_identity = a.devices().device(&bob()).unwrap().unwrap();
    let carol_identity = a.devices().device(&carol()).unwrap().unwrap();
    let mut broken = bob_identity.clone();
    broken.device_id = "BROKEN".into();
    broken.identity_key = AgreementPublicKey::from_bytes([0; 32]);

    let results = a
        .direct()
        .encrypt_for_devices(&[bob_identity, broken.clone(), carol_identity], &ping())
        .await;
    let addresses: Vec<_> = results.iter().map(|(address, _)| address.clone()).collect();
    assert_eq!(addresses, vec![bob(), broken.address(), carol()]);
    assert!(matches!(results[1].1, Err(DirectSessionError::Crypto(CryptoError::WeakKeyAgreement))));
    assert!(!a.direct().has_outbound_session(&broken.address()).await);

    for ((_, result), machine) in [&results[0], &results[2]].into_iter().zip([&b, &c]) {
        let payload = result.as_ref().unwrap();
        let decrypted = machine.receive_to_device(&alice().user_id, payload).await.unwrap();
        assert_eq!(decrypted.content, ping());
    }
}
