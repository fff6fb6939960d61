// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Static description of a storage device.

use std::fmt;

use crate::{Error, Result, PAGE_SIZE};

/// Major/minor pair identifying a device node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl DeviceId {
    /// Creates a device identifier.
    pub fn new(major: u32, minor: u32) -> Self {
        DeviceId { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Position of a logical unit on its bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LunAddress {
    /// Storage controller.
    pub controller_id: u32,
    /// Target on the controller.
    pub target_id: u32,
    /// Logical unit on the target.
    pub disk_id: u32,
}

impl fmt::Display for LunAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.controller_id, self.target_id, self.disk_id
        )
    }
}

/// Command set the device speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandSet {
    /// Memory-backed device.
    PlainMemory,
    /// SCSI.
    SCSI,
    /// ATA.
    ATA,
    /// NVMe.
    NVMe,
}

impl CommandSet {
    /// Returns the identifier exposed to device discovery.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandSet::PlainMemory => "memory",
            CommandSet::SCSI => "scsi",
            CommandSet::ATA => "ata",
            CommandSet::NVMe => "nvme",
        }
    }
}

/// Physical interface the device is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceType {
    /// Memory-backed device.
    PlainMemory,
    /// SCSI.
    SCSI,
    /// ATA.
    ATA,
    /// NVMe.
    NVMe,
}

impl InterfaceType {
    /// Returns the identifier exposed to device discovery.
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceType::PlainMemory => "memory",
            InterfaceType::SCSI => "scsi",
            InterfaceType::ATA => "ata",
            InterfaceType::NVMe => "nvme",
        }
    }
}

/// Fixed properties of a storage device, set once at discovery.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    id: DeviceId,
    lun: LunAddress,
    early_name: String,
    sector_size: usize,
    block_size_log: u32,
    max_addressable_block: u64,
    blocks_per_page: usize,
    command_set: CommandSet,
    interface_type: InterfaceType,
}

impl DeviceDescriptor {
    /// Creates a descriptor for a device of `max_addressable_block` sectors of `sector_size`
    /// bytes. The sector size must be a power of two no larger than `PAGE_SIZE`.
    pub fn new<S: Into<String>>(
        id: DeviceId,
        lun: LunAddress,
        early_name: S,
        sector_size: usize,
        max_addressable_block: u64,
        command_set: CommandSet,
        interface_type: InterfaceType,
    ) -> Result<Self> {
        let mut descriptor = DeviceDescriptor {
            id,
            lun,
            early_name: early_name.into(),
            sector_size,
            block_size_log: 0,
            max_addressable_block,
            blocks_per_page: 0,
            command_set,
            interface_type,
        };
        descriptor.set_page_size(PAGE_SIZE)?;
        Ok(descriptor)
    }

    /// Uses `page_size` instead of `PAGE_SIZE` to bound single transfers.
    pub fn with_page_size(mut self, page_size: usize) -> Result<Self> {
        self.set_page_size(page_size)?;
        Ok(self)
    }

    fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if !self.sector_size.is_power_of_two() || self.sector_size > page_size {
            return Err(Error::InvalidSectorSize(self.sector_size));
        }
        self.block_size_log = self.sector_size.trailing_zeros();
        self.blocks_per_page = page_size / self.sector_size;
        Ok(())
    }

    /// Returns the device node identifier.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Returns the bus address.
    pub fn lun(&self) -> LunAddress {
        self.lun
    }

    /// Returns the name assigned before the device was registered.
    pub fn early_storage_name(&self) -> &str {
        &self.early_name
    }

    /// Returns the class name reported to the registry.
    pub fn class_name(&self) -> &'static str {
        "StorageDevice"
    }

    /// Returns the sector size in bytes.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Returns log2 of the sector size.
    pub fn block_size_log(&self) -> u32 {
        self.block_size_log
    }

    /// Returns the number of addressable blocks.
    pub fn max_addressable_block(&self) -> u64 {
        self.max_addressable_block
    }

    /// Returns the maximum number of blocks carried by a single request.
    pub fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    /// Returns the device capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.max_addressable_block << self.block_size_log
    }

    /// Returns the command set.
    pub fn command_set(&self) -> CommandSet {
        self.command_set
    }

    /// Returns the interface type.
    pub fn interface_type(&self) -> InterfaceType {
        self.interface_type
    }
}
