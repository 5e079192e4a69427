//! In-memory to-device network with per-device fault injection.
//!
//! Sends never deliver synchronously. Payloads queue in the recipient's
//! inbox until the test (or [`TestCluster`](crate::TestCluster)) drains it,
//! so no device ever re-enters another device's machine from inside a send.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace};
use trustcore_core::{
    ids::{DeviceAddress, RoomId},
    transport::{Transport, TransportError},
};
use trustcore_crypto::AgreementPublicKey;

/// A to-device payload waiting in an inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending device
    pub sender: DeviceAddress,
    /// Recipient device
    pub recipient: DeviceAddress,
    /// Encrypted payload
    pub payload: Vec<u8>,
}

/// A payload posted into a room timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
    /// Event id assigned by the network
    pub event_id: String,
    /// Posting device
    pub sender: DeviceAddress,
    /// Room
    pub room_id: RoomId,
    /// Unencrypted content
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceFaults {
    unreachable: bool,
    fail_next: u32,
    loss_rate: f64,
}

struct NetworkState {
    rng: ChaCha20Rng,
    inboxes: VecDeque<Envelope>,
    rooms: BTreeMap<RoomId, Vec<RoomEvent>>,
    one_time_keys: BTreeMap<DeviceAddress, VecDeque<AgreementPublicKey>>,
    faults: BTreeMap<DeviceAddress, DeviceFaults>,
    next_event: u64,
    lost: usize,
}

/// Shared in-memory network.
///
/// Clones address the same network. Each device talks to it through its own
/// [`SimTransport`].
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    /// Empty network. `seed` drives random message loss.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                inboxes: VecDeque::new(),
                rooms: BTreeMap::new(),
                one_time_keys: BTreeMap::new(),
                faults: BTreeMap::new(),
                next_event: 0,
                lost: 0,
            })),
        }
    }

    /// Transport for `owner`; everything it sends is attributed to `owner`.
    pub fn transport(&self, owner: DeviceAddress) -> Arc<SimTransport> {
        Arc::new(SimTransport { owner, network: self.clone() })
    }

    /// Make one-time keys claimable for `device`.
    pub fn publish_one_time_keys(&self, device: &DeviceAddress, keys: Vec<AgreementPublicKey>) {
        self.lock().one_time_keys.entry(device.clone()).or_default().extend(keys);
    }

    /// Unclaimed one-time keys of `device`.
    pub fn one_time_key_count(&self, device: &DeviceAddress) -> usize {
        self.lock().one_time_keys.get(device).map_or(0, VecDeque::len)
    }

    /// Fail every send to `device` with `Unreachable` until
    /// [`Self::set_reachable`].
    pub fn set_unreachable(&self, device: &DeviceAddress) {
        self.lock().faults.entry(device.clone()).or_default().unreachable = true;
    }

    /// Deliver to `device` again. Loss rate and pending failures are kept.
    pub fn set_reachable(&self, device: &DeviceAddress) {
        self.lock().faults.entry(device.clone()).or_default().unreachable = false;
    }

    /// Fail the next `count` sends to `device` with `Timeout`.
    pub fn fail_next_sends(&self, device: &DeviceAddress, count: u32) {
        self.lock().faults.entry(device.clone()).or_default().fail_next = count;
    }

    /// Silently drop a share of the sends to `device`. The sender sees
    /// success.
    pub fn set_loss_rate(&self, device: &DeviceAddress, rate: f64) {
        self.lock().faults.entry(device.clone()).or_default().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Clear every fault.
    pub fn heal(&self) {
        self.lock().faults.clear();
    }

    /// Payloads sent but dropped by loss.
    pub fn lost(&self) -> usize {
        self.lock().lost
    }

    /// Queued to-device payloads, all recipients.
    pub fn pending(&self) -> usize {
        self.lock().inboxes.len()
    }

    /// Drain every queued to-device payload, in send order.
    pub fn take_all(&self) -> Vec<Envelope> {
        self.lock().inboxes.drain(..).collect()
    }

    /// Drain the payloads queued for `device`, leaving others queued.
    pub fn take_inbox(&self, device: &DeviceAddress) -> Vec<Envelope> {
        let mut state = self.lock();
        let (mine, rest): (VecDeque<_>, VecDeque<_>) =
            state.inboxes.drain(..).partition(|env| &env.recipient == device);
        state.inboxes = rest;
        mine.into()
    }

    /// Every event posted to `room`, oldest first.
    pub fn room_events(&self, room_id: &RoomId) -> Vec<RoomEvent> {
        self.lock().rooms.get(room_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(
        &self,
        sender: &DeviceAddress,
        recipient: &DeviceAddress,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let faults = state.faults.get(recipient).copied().unwrap_or_default();
        if faults.unreachable {
            return Err(TransportError::Unreachable(recipient.to_string()));
        }
        if faults.fail_next > 0 {
            if let Some(entry) = state.faults.get_mut(recipient) {
                entry.fail_next -= 1;
            }
            debug!(%sender, %recipient, "injected send timeout");
            return Err(TransportError::Timeout);
        }
        if faults.loss_rate > 0.0 && state.rng.gen_bool(faults.loss_rate) {
            state.lost += 1;
            debug!(%sender, %recipient, "payload lost");
            return Ok(());
        }
        trace!(%sender, %recipient, bytes = payload.len(), "queued to-device payload");
        state.inboxes.push_back(Envelope { sender: sender.clone(), recipient: recipient.clone(), payload });
        Ok(())
    }
}

/// One device's view of a [`SimNetwork`].
pub struct SimTransport {
    owner: DeviceAddress,
    network: SimNetwork,
}

impl SimTransport {
    /// Device this transport sends as.
    pub fn owner(&self) -> &DeviceAddress {
        &self.owner
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send_to_device(
        &self,
        recipient: &DeviceAddress,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.network.deliver(&self.owner, recipient, payload)
    }

    async fn send_to_room(&self, room_id: &RoomId, payload: Vec<u8>) -> Result<String, TransportError> {
        let mut state = self.network.lock();
        state.next_event += 1;
        let event_id = format!("$event{}", state.next_event);
        state.rooms.entry(room_id.clone()).or_default().push(RoomEvent {
            event_id: event_id.clone(),
            sender: self.owner.clone(),
            room_id: room_id.clone(),
            payload,
        });
        Ok(event_id)
    }

    async fn claim_one_time_key(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<AgreementPublicKey>, TransportError> {
        let mut state = self.network.lock();
        if state.faults.get(device).is_some_and(|faults| faults.unreachable) {
            return Err(TransportError::Unreachable(device.to_string()));
        }
        Ok(state.one_time_keys.get_mut(device).and_then(VecDeque::pop_front))
    }
}
