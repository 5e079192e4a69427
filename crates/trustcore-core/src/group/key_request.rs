//! Outgoing room key requests.
//!
//! At most one request is pending per inbound session key. A request is
//! completed (and a cancellation sent) as soon as the session arrives by any
//! route: a direct share, an import or a backup restore.

#![allow(clippy::disallowed_types, reason = "Synchronous map operations only")]

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use super::{
    content::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
    inbound::InboundSessionKey,
};
use crate::ids::DeviceId;

/// A room key request sent to our own devices and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingKeyRequest {
    /// Id shared by the request and its cancellation
    pub request_id: String,
    /// Session being requested
    pub info: RequestedKeyInfo,
}

impl OutgoingKeyRequest {
    pub(crate) fn request(&self, requesting_device_id: &DeviceId) -> RoomKeyRequestContent {
        RoomKeyRequestContent {
            action: KeyRequestAction::Request,
            request_id: self.request_id.clone(),
            requesting_device_id: requesting_device_id.clone(),
            body: Some(self.info.clone()),
        }
    }

    pub(crate) fn cancellation(&self, requesting_device_id: &DeviceId) -> RoomKeyRequestContent {
        RoomKeyRequestContent {
            action: KeyRequestAction::RequestCancellation,
            request_id: self.request_id.clone(),
            requesting_device_id: requesting_device_id.clone(),
            body: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct KeyRequestTracker {
    pending: Mutex<BTreeMap<InboundSessionKey, OutgoingKeyRequest>>,
}

impl KeyRequestTracker {
    /// Record a new request. Returns `None` if one is already pending for
    /// the session.
    pub(crate) fn start(&self, key: InboundSessionKey, request_id: String) -> Option<OutgoingKeyRequest> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.contains_key(&key) {
            return None;
        }
        let request = OutgoingKeyRequest {
            request_id,
            info: RequestedKeyInfo {
                room_id: key.room_id.clone(),
                sender_key: key.sender_key,
                session_id: key.session_id.clone(),
            },
        };
        pending.insert(key, request.clone());
        Some(request)
    }

    /// Remove the pending request for a session that has arrived.
    pub(crate) fn complete(&self, key: &InboundSessionKey) -> Option<OutgoingKeyRequest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    pub(crate) fn pending(&self) -> Vec<OutgoingKeyRequest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }
}
