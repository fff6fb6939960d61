// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device discovery registry.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::device::descriptor::{DeviceDescriptor, DeviceId, LunAddress};
use crate::{Error, Result};

/// What a storage device publishes about itself when it is inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryEntry {
    /// Device node identifier.
    pub id: DeviceId,
    /// Name assigned at discovery.
    pub name: String,
    /// Bus address.
    pub lun: LunAddress,
    /// Class name of the device.
    pub class_name: &'static str,
    /// Command set identifier.
    pub command_set: &'static str,
    /// Interface type identifier.
    pub interface_type: &'static str,
    /// Capacity in bytes.
    pub capacity_bytes: u64,
    /// Sector size in bytes.
    pub sector_size: usize,
}

impl From<&DeviceDescriptor> for RegistryEntry {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        RegistryEntry {
            id: descriptor.id(),
            name: descriptor.early_storage_name().to_string(),
            lun: descriptor.lun(),
            class_name: descriptor.class_name(),
            command_set: descriptor.command_set().as_str(),
            interface_type: descriptor.interface_type().as_str(),
            capacity_bytes: descriptor.capacity_bytes(),
            sector_size: descriptor.sector_size(),
        }
    }
}

/// Namespace storage devices are published under.
pub trait DeviceRegistry {
    /// Publishes `entry`.
    fn register(&self, entry: RegistryEntry) -> Result<()>;

    /// Removes the device identified by `id`.
    fn unregister(&self, id: DeviceId) -> Result<()>;
}

/// In-memory `DeviceRegistry`.
#[derive(Default)]
pub struct DeviceDirectory {
    entries: Mutex<BTreeMap<DeviceId, RegistryEntry>>,
}

impl DeviceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry registered under `id`.
    pub fn lookup(&self, id: DeviceId) -> Option<RegistryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    /// Returns the number of registered devices.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Returns `true` if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRegistry for DeviceDirectory {
    fn register(&self, entry: RegistryEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.contains_key(&entry.id) {
            return Err(Error::AlreadyRegistered(entry.id));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    fn unregister(&self, id: DeviceId) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::NotRegistered(id))
    }
}
