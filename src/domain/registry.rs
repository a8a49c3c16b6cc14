//! Device registry.
//!
//! Owns every [`TargetDevice`] plus the connected set. Targets keep their
//! registration order, which decides ties during discovery matching.

use crate::domain::models::{ConnectionState, TargetConfig, TargetDevice};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    targets: Vec<TargetDevice>,
    /// Names in connection order
    connected: Vec<String>,
    /// Last config seen per name, kept after removal
    known: HashMap<String, TargetConfig>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Returns false if the name is already registered.
    pub fn add(&mut self, config: TargetConfig) -> bool {
        if self.contains(&config.name) {
            return false;
        }
        self.known.insert(config.name.clone(), config.clone());
        self.targets.push(TargetDevice::new(config));
        true
    }

    /// Register a target or overwrite the identifiers of an existing one.
    /// Returns true if a new entry was created.
    pub fn upsert(&mut self, config: TargetConfig) -> bool {
        self.known.insert(config.name.clone(), config.clone());
        match self.get_mut(&config.name) {
            Some(device) => {
                device.config = config;
                false
            }
            None => {
                self.targets.push(TargetDevice::new(config));
                true
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<TargetDevice> {
        let index = self.targets.iter().position(|d| d.name() == name)?;
        self.connected.retain(|n| n != name);
        Some(self.targets.remove(index))
    }

    pub fn clear(&mut self) -> Vec<TargetDevice> {
        self.connected.clear();
        std::mem::take(&mut self.targets)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.iter().any(|d| d.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&TargetDevice> {
        self.targets.iter().find(|d| d.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TargetDevice> {
        self.targets.iter_mut().find(|d| d.name() == name)
    }

    /// The device whose live attempt is `(address, generation)`
    pub fn get_by_link_mut(&mut self, address: &str, generation: u64) -> Option<&mut TargetDevice> {
        self.targets
            .iter_mut()
            .find(|d| d.attempt == Some(generation) && d.address.as_deref() == Some(address))
    }

    pub fn known_config(&self, name: &str) -> Option<&TargetConfig> {
        self.known.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDevice> {
        self.targets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TargetDevice> {
        self.targets.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// True if another target already owns `address`
    pub fn address_claimed(&self, address: &str, except: &str) -> bool {
        self.targets
            .iter()
            .any(|d| d.name() != except && d.address.as_deref() == Some(address))
    }

    pub fn mark_connected(&mut self, name: &str) {
        if !self.connected.iter().any(|n| n == name) {
            self.connected.push(name.to_string());
        }
    }

    pub fn mark_disconnected(&mut self, name: &str) {
        self.connected.retain(|n| n != name);
    }

    pub fn clear_connected(&mut self) {
        self.connected.clear();
    }

    pub fn connected(&self) -> &[String] {
        &self.connected
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connected.iter().any(|n| n == name)
            && self.get(name).map(|d| d.connected).unwrap_or(false)
    }

    pub fn any_connecting(&self) -> bool {
        self.targets.iter().any(|d| d.connecting)
    }

    /// All targets connected, and there is at least one target
    pub fn all_connected(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|d| d.connected)
    }

    pub fn unconnected_count(&self) -> usize {
        self.targets.iter().filter(|d| !d.connected).count()
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        if self.connected.iter().any(|n| n == name) {
            return ConnectionState::Connected;
        }
        match self.get(name) {
            Some(device) if device.connecting => ConnectionState::Connecting,
            Some(device) if device.address.is_some() => ConnectionState::Discovered,
            Some(_) => ConnectionState::Pending,
            None => ConnectionState::NotConfigured,
        }
    }
}
