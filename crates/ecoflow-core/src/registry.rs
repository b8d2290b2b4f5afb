//! Immutable lookup of device tables

use crate::device::DeviceTable;
use std::collections::HashMap;
use std::sync::Arc;

/// Device tables keyed by type name and serial prefix
///
/// Built once through [`DeviceRegistry::builder`]; there is no way to add
/// tables afterwards.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    by_type: HashMap<&'static str, Arc<DeviceTable>>,
    /// (prefix, table), longest prefix first
    prefixes: Vec<(&'static str, Arc<DeviceTable>)>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn builder() -> DeviceRegistryBuilder {
        DeviceRegistryBuilder::default()
    }

    #[must_use]
    pub fn by_type(&self, type_name: &str) -> Option<Arc<DeviceTable>> {
        self.by_type.get(type_name).cloned()
    }

    /// Table whose longest serial prefix matches `serial`
    #[must_use]
    pub fn by_serial(&self, serial: &str) -> Option<Arc<DeviceTable>> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| serial.starts_with(prefix))
            .map(|(_, table)| Arc::clone(table))
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_type.keys().copied().collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistryBuilder {
    tables: Vec<DeviceTable>,
}

impl DeviceRegistryBuilder {
    #[must_use]
    pub fn table(mut self, table: DeviceTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Freeze the registry; a later table with the same type name wins
    #[must_use]
    pub fn build(self) -> DeviceRegistry {
        let mut registry = DeviceRegistry::default();
        for table in self.tables {
            let table = Arc::new(table);
            if registry
                .by_type
                .insert(table.type_name(), Arc::clone(&table))
                .is_some()
            {
                tracing::warn!("Device type {} registered twice", table.type_name());
                registry
                    .prefixes
                    .retain(|(_, existing)| existing.type_name() != table.type_name());
            }
            for prefix in table.serial_prefixes() {
                registry.prefixes.push((*prefix, Arc::clone(&table)));
            }
        }
        registry
            .prefixes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        registry
    }
}
