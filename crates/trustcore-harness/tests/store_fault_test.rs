//! Storage failures in the middle of bulk imports and backup uploads.

use proptest::prelude::*;
use trustcore_core::{
    BackupError, BackupState, BackupTransport, CryptoStore, RecoveryKey,
    backup::{BACKUP_ALGORITHM, BackupAuthData, NewBackupVersion},
    group::{ExportedRoomKey, GroupSessionError, ImportResult, SessionOrigin},
    ids::{DeviceAddress, RoomId},
    store::StoreError,
};
use trustcore_crypto::AgreementSecret;
use trustcore_harness::TestCluster;

const ALICE: &str = "@alice:example.org";

fn phone() -> DeviceAddress {
    DeviceAddress::new(ALICE, "PHONE")
}

/// Cluster where alice's laptop holds one session for each of `rooms` rooms.
/// Returns the laptop's export.
async fn laptop_with_sessions(cluster: &mut TestCluster, rooms: usize) -> Vec<ExportedRoomKey> {
    let laptop = cluster.add_device(ALICE, "LAPTOP");
    for n in 0..rooms {
        let room = RoomId::new(format!("!room{n}:example.org"));
        laptop.encrypt_room_message(&room, b"hello", &[]).await.unwrap();
    }
    let exports = laptop.groups().export_inbound_sessions().unwrap();
    assert_eq!(exports.len(), rooms);
    exports
}

#[tokio::test]
async fn interrupted_import_completes_on_retry() {
    let mut cluster = TestCluster::new(21);
    let exports = laptop_with_sessions(&mut cluster, 10).await;
    let machine = cluster.add_device(ALICE, "PHONE");
    let store = &cluster.device(&phone()).unwrap().store;

    store.fail_after(4);
    let err = machine.groups().import_inbound_sessions(&exports, SessionOrigin::Import, |_, _| {}).await.unwrap_err();
    assert!(matches!(err, GroupSessionError::Store(StoreError::Io(_))));
    assert!(!err.is_fatal());
    assert_eq!(machine.groups().export_inbound_sessions().unwrap().len(), 4);

    store.heal();
    let result = machine.groups().import_inbound_sessions(&exports, SessionOrigin::Import, |_, _| {}).await.unwrap();
    assert_eq!(result, ImportResult { total_count: 10, imported_count: 6 });

    let again = machine.groups().import_inbound_sessions(&exports, SessionOrigin::Import, |_, _| {}).await.unwrap();
    assert_eq!(again.imported_count, 0);
    assert_eq!(store.failures(), 1);
}

#[tokio::test]
async fn failed_bookkeeping_after_upload_reuploads() {
    let mut cluster = TestCluster::new(22);
    laptop_with_sessions(&mut cluster, 3).await;
    let laptop_address = DeviceAddress::new(ALICE, "LAPTOP");
    let laptop = &cluster.device(&laptop_address).unwrap().machine;
    let store = &cluster.device(&laptop_address).unwrap().store;
    let created = laptop.backup().create_backup(None).await.unwrap();

    // The server takes the batch, recording it locally fails.
    store.fail_after(0);
    let err = laptop.backup().backup_keys().await.unwrap_err();
    assert!(matches!(err, BackupError::Store(StoreError::Io(_))));
    assert_eq!(cluster.backup_server().key_count(&created.version), 3);
    assert_eq!(laptop.backup().progress().unwrap().backed_up, 0);

    store.heal();
    assert_eq!(laptop.backup().backup_keys().await.unwrap(), 3);
    assert_eq!(cluster.backup_server().key_count(&created.version), 3);
    assert_eq!(cluster.backup_server().upload_requests(), 2);
}

#[tokio::test]
async fn failed_version_switch_is_retried() {
    let mut cluster = TestCluster::new(23);
    laptop_with_sessions(&mut cluster, 2).await;
    let laptop_address = DeviceAddress::new(ALICE, "LAPTOP");
    let laptop = &cluster.device(&laptop_address).unwrap().machine;
    let store = &cluster.device(&laptop_address).unwrap().store;
    let created = laptop.backup().create_backup(None).await.unwrap();
    laptop.backup().backup_keys().await.unwrap();

    // Another version appears; recording the switch fails before anything
    // is reset.
    let key = RecoveryKey::from_bytes([5; 32]);
    let public_key = cluster.crypto().agreement_public_key(&AgreementSecret::from_bytes(*key.as_bytes()));
    let auth_data = BackupAuthData::signed(cluster.crypto().as_ref(), laptop.devices().account(), public_key, None);
    let version = cluster
        .backup_server()
        .create_version(NewBackupVersion { algorithm: BACKUP_ALGORITHM.to_string(), auth_data })
        .await
        .unwrap();
    assert_ne!(version, created.version);

    store.fail_after(0);
    assert!(matches!(laptop.backup().check_backup_version().await, Err(BackupError::Store(_))));
    assert_eq!(store.load_backup_version().unwrap(), Some(created.version));
    assert_eq!(laptop.backup().progress().unwrap().backed_up, 2);

    store.heal();
    assert_eq!(laptop.backup().check_backup_version().await.unwrap(), BackupState::WillBackUp);
    assert_eq!(laptop.backup().backup_keys().await.unwrap(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// However often writes fail, retrying the import ends with every
    /// session stored exactly once.
    #[test]
    fn prop_retried_import_converges(seed in any::<u64>(), rooms in 1usize..12, rate in 0.0f64..0.6) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let mut cluster = TestCluster::new(seed);
            let exports = laptop_with_sessions(&mut cluster, rooms).await;
            let machine = cluster.add_device(ALICE, "PHONE");
            let store = &cluster.device(&phone()).unwrap().store;
            store.set_failure_rate(rate);

            let mut imported = 0;
            for attempt in 0.. {
                if attempt == 50 {
                    store.heal();
                }
                let before = machine.groups().export_inbound_sessions().unwrap().len();
                match machine.groups().import_inbound_sessions(&exports, SessionOrigin::Import, |_, _| {}).await {
                    Ok(result) => {
                        imported += result.imported_count;
                        break;
                    },
                    Err(err) => {
                        assert!(!err.is_fatal());
                        imported += machine.groups().export_inbound_sessions().unwrap().len() - before;
                    },
                }
            }

            assert_eq!(imported, rooms);
            assert_eq!(machine.groups().export_inbound_sessions().unwrap().len(), rooms);
            assert_eq!(machine.backup().progress().unwrap().total, rooms);
        });
    }
}
