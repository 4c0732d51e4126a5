// ── Structure index ──
//
// Immutable lookup from record identifiers to device metadata. A new
// snapshot replaces the old one wholesale; nothing here is mutated after
// construction.

use std::collections::HashMap;

use crate::error::CoreError;

use super::device::{Device, SubField};

/// Source of structure snapshots. Called at startup and after every
/// reconnect.
pub trait StructureSource: Send + Sync + 'static {
    fn load(&self) -> Result<StructureIndex, CoreError>;
}

/// A record identifier resolved to its device.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub device: &'a Device,
    /// Set when the identifier named a sub-field rather than the device.
    pub sub_field: Option<&'a SubField>,
}

impl Resolved<'_> {
    /// The identifier the record carried.
    pub fn record_uuid(&self) -> &str {
        self.sub_field.map_or(&self.device.uuid, |s| &s.uuid)
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Device(usize),
    SubField(usize, usize),
}

#[derive(Debug, Default)]
pub struct StructureIndex {
    devices: Vec<Device>,
    by_uuid: HashMap<String, Slot>,
    last_modified: Option<String>,
}

impl StructureIndex {
    /// Build an index. Types are normalised to upper case; a later device
    /// with a duplicate identifier replaces the earlier one in lookups.
    pub fn new(mut devices: Vec<Device>, last_modified: Option<String>) -> Self {
        let mut by_uuid = HashMap::with_capacity(devices.len());

        for (i, device) in devices.iter_mut().enumerate() {
            device.kind = device.kind.to_uppercase();
            by_uuid.insert(device.uuid.clone(), Slot::Device(i));
            for (j, sub) in device.sub_fields.iter().enumerate() {
                by_uuid
                    .entry(sub.uuid.clone())
                    .or_insert(Slot::SubField(i, j));
            }
        }

        Self {
            devices,
            by_uuid,
            last_modified,
        }
    }

    pub fn resolve(&self, uuid: &str) -> Option<Resolved<'_>> {
        match *self.by_uuid.get(uuid)? {
            Slot::Device(i) => Some(Resolved {
                device: self.devices.get(i)?,
                sub_field: None,
            }),
            Slot::SubField(i, j) => {
                let device = self.devices.get(i)?;
                Some(Resolved {
                    device,
                    sub_field: Some(device.sub_fields.get(j)?),
                })
            }
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Snapshot version as reported by the Miniserver.
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }
}
