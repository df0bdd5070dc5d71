//! Pending-Request Table
//!
//! In-flight confirmed requests keyed by (destination, invoke id). Each
//! destination owns a pool of 256 invoke ids; an id is free again only once
//! its entry has been removed, which happens exactly once per exchange.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::codec::Ack;
use crate::future::Completer;
use crate::policy::TimeoutPolicy;
use crate::types::{ConfirmedService, DeviceAddress};

/// One outstanding confirmed request
pub(crate) struct PendingRequest {
    /// Dispatch sequence number, unique over the life of the dispatcher
    pub seq: u64,
    pub service: ConfirmedService,
    /// Encoded frame, resent unchanged on retry
    pub frame: Bytes,
    pub attempts: u32,
    pub deadline: Instant,
    pub policy: TimeoutPolicy,
    pub completer: Completer<Ack>,
    pub timer: Option<AbortHandle>,
}

impl PendingRequest {
    /// Disarm the retry timer
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct DestinationSlots {
    /// Where the next probe starts
    cursor: u8,
    in_flight: HashMap<u8, PendingRequest>,
}

/// Table of outstanding confirmed requests
#[derive(Default)]
pub(crate) struct PendingTable {
    destinations: HashMap<DeviceAddress, DestinationSlots>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free invoke id for `destination`, probing linearly from the
    /// cursor and wrapping. `None` when all 256 ids are in flight.
    ///
    /// The id is not reserved until [`PendingTable::insert`] is called.
    pub fn allocate(&mut self, destination: &DeviceAddress) -> Option<u8> {
        let slots = self
            .destinations
            .entry(destination.clone())
            .or_insert_with(|| DestinationSlots {
                cursor: rand::random(),
                in_flight: HashMap::new(),
            });

        let start = slots.cursor;
        for step in 0..=u8::MAX {
            let id = start.wrapping_add(step);
            if !slots.in_flight.contains_key(&id) {
                slots.cursor = id.wrapping_add(1);
                return Some(id);
            }
        }
        None
    }

    pub fn insert(&mut self, destination: &DeviceAddress, invoke_id: u8, request: PendingRequest) {
        let slots = self.destinations.entry(destination.clone()).or_default();
        slots.in_flight.insert(invoke_id, request);
    }

    /// Remove and return the entry, if any
    pub fn remove(&mut self, destination: &DeviceAddress, invoke_id: u8) -> Option<PendingRequest> {
        // The slots (and cursor) stay, so a just-released id is not handed out next
        self.destinations.get_mut(destination)?.in_flight.remove(&invoke_id)
    }

    /// Remove the entry only if it still belongs to dispatch `seq`
    pub fn remove_if_seq(
        &mut self,
        destination: &DeviceAddress,
        invoke_id: u8,
        seq: u64,
    ) -> Option<PendingRequest> {
        let matches = self
            .get_mut(destination, invoke_id)
            .is_some_and(|request| request.seq == seq);
        if matches {
            self.remove(destination, invoke_id)
        } else {
            None
        }
    }

    /// Drop the id pool of `destination` if nothing is in flight to it.
    /// Returns true if the pool is gone afterwards.
    pub fn prune(&mut self, destination: &DeviceAddress) -> bool {
        match self.destinations.get(destination) {
            Some(slots) if !slots.in_flight.is_empty() => false,
            Some(_) => {
                self.destinations.remove(destination);
                true
            }
            None => true,
        }
    }

    /// Number of destinations holding an id pool
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    pub fn get_mut(&mut self, destination: &DeviceAddress, invoke_id: u8) -> Option<&mut PendingRequest> {
        self.destinations
            .get_mut(destination)
            .and_then(|slots| slots.in_flight.get_mut(&invoke_id))
    }

    /// Number of requests in flight to `destination`
    pub fn outstanding(&self, destination: &DeviceAddress) -> usize {
        self.destinations
            .get(destination)
            .map_or(0, |slots| slots.in_flight.len())
    }

    pub fn len(&self) -> usize {
        self.destinations.values().map(|s| s.in_flight.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.destinations
            .values_mut()
            .flat_map(|slots| slots.in_flight.drain().map(|(_, r)| r))
            .collect()
    }
}
