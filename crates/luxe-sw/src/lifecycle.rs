//! Worker lifecycle states and the clients a worker controls.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use url::Url;

use crate::ServiceWorkerError;

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, install not yet attempted.
    #[default]
    Parsed,
    /// Populating the static partition.
    Installing,
    /// Installed and asked to skip waiting.
    Installed,
    /// Cleaning up old partitions.
    Activating,
    /// Intercepting fetches.
    Activated,
    /// Install failed or replaced.
    Redundant,
}

impl WorkerState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installing, Redundant)
                | (Installed, Activating)
                | (Activated, Activating)
                | (Activating, Activated)
                | (Installed, Redundant)
                | (Activated, Redundant)
        )
    }
}

/// Lifecycle record for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerLifecycle {
    pub id: WorkerId,
    pub state: WorkerState,
    pub state_changed_at: Instant,
}

impl WorkerLifecycle {
    pub fn new() -> Self {
        Self {
            id: WorkerId::new(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Move to `next`, rejecting transitions the platform would never make.
    pub fn transition(&mut self, next: WorkerState) -> Result<WorkerState, ServiceWorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        self.state_changed_at = Instant::now();
        Ok(previous)
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }
}

impl Default for WorkerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== Clients ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A page or worker context in the worker's scope.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,
}

impl Client {
    /// An uncontrolled window client.
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            client_type: ClientType::Window,
            controller: None,
        }
    }
}

/// Open clients of the origin.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Clients of a type.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| client_type == ClientType::All || c.client_type == client_type)
            .collect()
    }

    /// Make `worker` the controller of every client. Returns how many clients changed hands.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: WorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
