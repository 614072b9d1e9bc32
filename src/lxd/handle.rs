//! Lazily connected, per-process LXD client
//!
//! The handle implements [`DaemonApi`] itself: every call connects on demand
//! and a connection failure drops the cached client so the next call retries.

use std::sync::Arc;

use parking_lot::Mutex;

use super::client::{DaemonApi, ExecRequest, ExecSession, LxdClient, StateAction};
use super::operation::Operation;
use crate::instance::{CreateInstanceRequest, Instance};
use crate::network::{NetworkSpec, ProfileSpec};
use crate::Result;

/// Holds at most one connected client and reconnects after it is invalidated
pub struct ClientHandle {
    port: u16,
    client: Mutex<Option<Arc<LxdClient>>>,
}

impl ClientHandle {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            client: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the cached client, connecting first if there is none
    pub fn get(&self) -> Result<Arc<LxdClient>> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(LxdClient::connect(self.port)?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the cached client, e.g. after a connection error
    pub fn invalidate(&self) {
        if self.client.lock().take().is_some() {
            tracing::debug!(port = self.port, "Dropped cached LXD client");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    fn with<T>(&self, f: impl FnOnce(&LxdClient) -> Result<T>) -> Result<T> {
        let client = self.get()?;
        let result = f(&client);
        if matches!(&result, Err(e) if e.is_connection_error()) {
            self.invalidate();
        }
        result
    }
}

impl DaemonApi for ClientHandle {
    fn ping(&self) -> Result<()> {
        self.with(|c| c.ping())
    }

    fn get_operation(&self, uri: &str) -> Result<Operation> {
        self.with(|c| c.get_operation(uri))
    }

    fn wait_operation(&self, uri: &str) -> Result<Operation> {
        self.with(|c| c.wait_operation(uri))
    }

    fn list_instances(&self) -> Result<Vec<Instance>> {
        self.with(|c| c.list_instances())
    }

    fn get_instance(&self, name: &str) -> Result<Instance> {
        self.with(|c| c.get_instance(name))
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String> {
        self.with(|c| c.create_instance(request))
    }

    fn change_state(&self, name: &str, action: StateAction, force: bool) -> Result<()> {
        self.with(|c| c.change_state(name, action, force))
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        self.with(|c| c.delete_instance(name))
    }

    fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession> {
        self.with(|c| c.exec(name, request))
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        self.with(|c| c.network_exists(name))
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.with(|c| c.create_network(spec))
    }

    fn profile_exists(&self, name: &str) -> Result<bool> {
        self.with(|c| c.profile_exists(name))
    }

    fn create_profile(&self, spec: &ProfileSpec) -> Result<()> {
        self.with(|c| c.create_profile(spec))
    }

    fn list_images(&self) -> Result<Vec<serde_json::Value>> {
        self.with(|c| c.list_images())
    }
}
