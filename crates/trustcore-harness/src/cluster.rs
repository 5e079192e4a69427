//! Simulated cluster of devices for end-to-end testing.
//!
//! Every device gets its own [`Machine`] backed by a [`ChaoticStore`], all
//! share one [`SimEnv`], one [`SimNetwork`] and one [`MemoryBackupServer`].
//! Nothing is delivered until the test calls [`TestCluster::deliver_all`],
//! which keeps interleavings explicit.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};
use trustcore_core::{
    Machine, MachineError, MemoryStore,
    config::MachineConfig,
    devices::{DeviceKeyError, LocalAccount},
    ids::{DeviceAddress, RoomId},
    transport::BackupTransport,
    verification::{PendingVerificationRequest, VerificationError, VerificationTransactionInfo},
};
use trustcore_crypto::{CryptoPrimitives, RustCryptoPrimitives};

use crate::{
    backup_server::MemoryBackupServer, chaotic_store::ChaoticStore, sim_env::SimEnv,
    sim_transport::SimNetwork,
};

/// Deliveries before [`TestCluster::deliver_all`] gives up on a chatty
/// network.
const MAX_DELIVERY_ROUNDS: usize = 64;

/// One-time keys each device publishes on creation
const ONE_TIME_KEYS_PER_DEVICE: usize = 10;

/// Machine type every simulated device runs.
pub type SimMachine = Machine<SimEnv, ChaoticStore<MemoryStore>>;

/// A simulated device.
pub struct SimDevice {
    /// The device's trust core
    pub machine: Arc<SimMachine>,
    /// The device's storage, for fault injection and inspection
    pub store: ChaoticStore<MemoryStore>,
}

/// Outcome of draining the network.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Payloads the recipient accepted
    pub delivered: usize,
    /// Payloads addressed to devices outside the cluster
    pub undeliverable: usize,
    /// Payloads the recipient rejected
    pub failed: Vec<(DeviceAddress, MachineError)>,
}

impl DeliveryReport {
    /// Every payload reached a device that accepted it.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.undeliverable == 0
    }
}

/// Devices sharing a simulated network and backup server.
pub struct TestCluster {
    seed: u64,
    env: SimEnv,
    crypto: Arc<dyn CryptoPrimitives>,
    config: MachineConfig,
    network: SimNetwork,
    backup_server: Arc<MemoryBackupServer>,
    devices: BTreeMap<DeviceAddress, SimDevice>,
}

impl TestCluster {
    /// Empty cluster with default configuration.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, MachineConfig::default())
    }

    /// Empty cluster whose devices use `config`.
    pub fn with_config(seed: u64, config: MachineConfig) -> Self {
        Self {
            seed,
            env: SimEnv::with_seed(seed),
            crypto: Arc::new(RustCryptoPrimitives::new()),
            config,
            network: SimNetwork::with_seed(seed),
            backup_server: Arc::new(MemoryBackupServer::new()),
            devices: BTreeMap::new(),
        }
    }

    /// Shared environment; advance it to expire timeouts.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Primitives every device uses.
    pub fn crypto(&self) -> &Arc<dyn CryptoPrimitives> {
        &self.crypto
    }

    /// Shared network.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Shared backup server.
    pub fn backup_server(&self) -> &Arc<MemoryBackupServer> {
        &self.backup_server
    }

    /// Create a device with fresh keys and publish its one-time keys.
    ///
    /// The device knows no other device until [`Self::introduce_all`].
    pub fn add_device(&mut self, user_id: &str, device_id: &str) -> Arc<SimMachine> {
        let address = DeviceAddress::new(user_id, device_id);
        let account = LocalAccount::generate(&self.env, self.crypto.as_ref(), address.clone());
        let store = ChaoticStore::new(MemoryStore::new(), self.seed ^ self.devices.len() as u64);
        let backup_transport: Arc<dyn BackupTransport> = Arc::clone(&self.backup_server) as _;
        let machine = Arc::new(Machine::new(
            self.env.clone(),
            Arc::clone(&self.crypto),
            self.config.clone(),
            account,
            store.clone(),
            self.network.transport(address.clone()),
            backup_transport,
        ));

        let keys = machine.devices().generate_one_time_keys(&self.env, ONE_TIME_KEYS_PER_DEVICE);
        self.network.publish_one_time_keys(&address, keys);
        debug!(device = %address, "added simulated device");

        self.devices.insert(address, SimDevice { machine: Arc::clone(&machine), store });
        machine
    }

    /// Device at `address`.
    pub fn device(&self, address: &DeviceAddress) -> Option<&SimDevice> {
        self.devices.get(address)
    }

    /// Every device address, sorted.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.devices.keys().cloned().collect()
    }

    /// Give every device the published keys of every other device.
    pub fn introduce_all(&self) -> Result<(), DeviceKeyError> {
        for (address, device) in &self.devices {
            for (other_address, other) in &self.devices {
                if address != other_address {
                    device.machine.devices().receive_device_keys(&other.machine.device_keys())?;
                }
            }
        }
        Ok(())
    }

    /// Deliver queued to-device payloads, including the replies they cause,
    /// until the network is quiet.
    pub async fn deliver_all(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let batch = self.network.take_all();
            if batch.is_empty() {
                return report;
            }
            for envelope in batch {
                let Some(device) = self.devices.get(&envelope.recipient) else {
                    report.undeliverable += 1;
                    continue;
                };
                match device.machine.receive_to_device(&envelope.sender.user_id, &envelope.payload).await {
                    Ok(_) => report.delivered += 1,
                    Err(err) => {
                        warn!(sender = %envelope.sender, recipient = %envelope.recipient, error = %err, "delivery rejected");
                        report.failed.push((envelope.recipient, err));
                    },
                }
            }
        }
        warn!(pending = self.network.pending(), "network still busy after delivery rounds");
        report
    }

    /// Show every event of `room_id` to every device except its sender.
    ///
    /// Returns the verification requests this created.
    pub fn deliver_room_events(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<PendingVerificationRequest>, MachineError> {
        let mut requests = Vec::new();
        for event in self.network.room_events(room_id) {
            for (address, device) in &self.devices {
                if address == &event.sender {
                    continue;
                }
                if let Some(request) = device.machine.receive_room_event(
                    &event.sender.user_id,
                    room_id,
                    &event.event_id,
                    &event.payload,
                )? {
                    requests.push(request);
                }
            }
        }
        Ok(requests)
    }

    /// Run a SAS verification between two devices the way two users would:
    /// request, accept, start, then compare the short codes and confirm
    /// them if they match or reject them if they do not.
    ///
    /// Returns the final transaction of the initiator and of the responder.
    pub async fn verify_with_sas(
        &self,
        initiator: &DeviceAddress,
        responder: &DeviceAddress,
    ) -> Result<(VerificationTransactionInfo, VerificationTransactionInfo), VerificationError> {
        let ours = self.verification_peer(initiator)?;
        let theirs = self.verification_peer(responder)?;

        let request = ours.verification().request_verification(&responder.user_id, Some(&responder.device_id)).await?;
        let transaction_id = request.transaction_id;
        self.deliver_all().await;
        theirs.verification().accept_request(&transaction_id).await?;
        self.deliver_all().await;
        ours.verification().start_sas(&transaction_id).await?;
        self.deliver_all().await;

        let mine = transaction(&ours, &transaction_id).await?;
        let other = transaction(&theirs, &transaction_id).await?;
        if mine.short_code.is_some() && mine.short_code == other.short_code {
            ours.verification().confirm_short_code(&transaction_id).await?;
            theirs.verification().confirm_short_code(&transaction_id).await?;
        } else {
            warn!(txn = %transaction_id, "short codes differ, rejecting");
            theirs.verification().reject_short_code(&transaction_id).await?;
        }
        self.deliver_all().await;

        Ok((transaction(&ours, &transaction_id).await?, transaction(&theirs, &transaction_id).await?))
    }

    fn verification_peer(&self, address: &DeviceAddress) -> Result<Arc<SimMachine>, VerificationError> {
        self.devices
            .get(address)
            .map(|device| Arc::clone(&device.machine))
            .ok_or_else(|| VerificationError::UnknownDevice(address.clone()))
    }
}

async fn transaction(
    machine: &SimMachine,
    transaction_id: &str,
) -> Result<VerificationTransactionInfo, VerificationError> {
    machine
        .verification()
        .transaction(transaction_id)
        .await
        .ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))
}
