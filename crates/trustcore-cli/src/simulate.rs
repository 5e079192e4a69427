//! In-process walkthrough of the trust core.
//!
//! Alice's laptop and phone verify each other with SAS, the laptop shares a
//! room key with the phone, backs its sessions up, and a third device
//! restores them with the recovery key.

use std::io::Write;

use tracing::info;
use trustcore_core::{
    ids::{DeviceAddress, RoomId},
    verification::{VerificationState, VerificationTransactionInfo},
};
use trustcore_harness::TestCluster;

use crate::error::CliError;

const USER: &str = "@alice:example.org";

/// Run the walkthrough, writing each step to `out`.
pub async fn run(seed: u64, out: &mut impl Write) -> Result<(), CliError> {
    let room = RoomId::new("!walkthrough:example.org");
    let laptop_address = DeviceAddress::new(USER, "LAPTOP");
    let phone_address = DeviceAddress::new(USER, "PHONE");

    let mut cluster = TestCluster::new(seed);
    let laptop = cluster.add_device(USER, "LAPTOP");
    let phone = cluster.add_device(USER, "PHONE");
    cluster.introduce_all()?;
    writeln!(out, "devices: {laptop_address}, {phone_address}")?;

    let (ours, theirs) = cluster.verify_with_sas(&laptop_address, &phone_address).await?;
    expect_verified(&ours)?;
    expect_verified(&theirs)?;
    if let Some(code) = &ours.short_code {
        let [a, b, c] = code.decimals();
        let emoji: Vec<_> = code.emoji().iter().map(|emoji| emoji.description).collect();
        writeln!(out, "verified with short code {a} {b} {c} ({})", emoji.join(", "))?;
    }

    let message = laptop.encrypt_room_message(&room, b"hello from the laptop", &cluster.addresses()).await?;
    let report = cluster.deliver_all().await;
    if !report.is_clean() {
        return Err(CliError::Simulation(format!("{} deliveries failed", report.failed.len())));
    }
    let plaintext = phone.decrypt_room_message(&room, &message)?;
    writeln!(out, "phone decrypted: {}", String::from_utf8_lossy(&plaintext))?;

    let created = laptop.backup().create_backup(None).await?;
    let uploaded = laptop.backup().backup_keys().await?;
    let recovery_key = created.recovery_key.encode();
    writeln!(out, "backup version {} holds {uploaded} sessions", created.version)?;
    writeln!(out, "recovery key: {recovery_key}")?;

    let tablet = cluster.add_device(USER, "TABLET");
    let restored = tablet.backup().restore_with_recovery_key(&recovery_key, |_, _| {}).await?;
    let plaintext = tablet.decrypt_room_message(&room, &message)?;
    writeln!(
        out,
        "tablet restored {}/{} sessions and decrypted: {}",
        restored.imported_count,
        restored.total_count,
        String::from_utf8_lossy(&plaintext)
    )?;

    info!(seed, "walkthrough complete");
    Ok(())
}

fn expect_verified(info: &VerificationTransactionInfo) -> Result<(), CliError> {
    if info.state == VerificationState::Verified {
        Ok(())
    } else {
        Err(CliError::Simulation(format!("verification with {} ended in {:?}", info.other, info.state)))
    }
}
