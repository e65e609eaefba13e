//! Driver Registry
//!
//! Central registry for all available database drivers.
//! Provides plugin-like architecture for adding new drivers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::drivers;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::Dialect;

/// Registry that holds all available database drivers
pub struct DriverRegistry {
    drivers: HashMap<Dialect, Arc<dyn DataEngine>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry with every driver compiled into this build
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(drivers::postgres::PostgresDriver::new()));
        registry.register(Arc::new(drivers::mysql::MySqlDriver::new()));
        registry.register(Arc::new(drivers::sqlite::SqliteDriver::new()));
        #[cfg(feature = "mssql")]
        registry.register(Arc::new(drivers::mssql::MssqlDriver::new()));
        #[cfg(feature = "oracle")]
        registry.register(Arc::new(drivers::oracle::OracleDriver::new()));
        registry
    }

    /// Registers a new driver
    ///
    /// The driver's `dialect()` is used as the key.
    pub fn register(&mut self, driver: Arc<dyn DataEngine>) {
        self.drivers.insert(driver.dialect(), driver);
    }

    /// Gets a driver by its dialect
    pub fn get(&self, dialect: Dialect) -> Option<Arc<dyn DataEngine>> {
        self.drivers.get(&dialect).cloned()
    }

    /// Like `get`, with an error naming the missing cargo feature
    pub fn require(&self, dialect: Dialect) -> EngineResult<Arc<dyn DataEngine>> {
        self.get(dialect).ok_or_else(|| match dialect {
            Dialect::MsSql | Dialect::Oracle => EngineError::driver_not_found(format!(
                "{} (build with the `{}` feature)",
                dialect, dialect
            )),
            _ => EngineError::driver_not_found(dialect.to_string()),
        })
    }

    /// Lists all registered dialects
    pub fn list(&self) -> Vec<Dialect> {
        let mut dialects: Vec<Dialect> = self.drivers.keys().copied().collect();
        dialects.sort();
        dialects
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin_drivers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = DriverRegistry::with_builtin_drivers();
        let dialects = registry.list();

        assert!(dialects.contains(&Dialect::Postgres));
        assert!(dialects.contains(&Dialect::MySql));
        assert!(dialects.contains(&Dialect::Sqlite));
        assert_eq!(registry.get(Dialect::MsSql).is_some(), cfg!(feature = "mssql"));
        assert_eq!(registry.get(Dialect::Oracle).is_some(), cfg!(feature = "oracle"));
    }

    #[test]
    fn register_replaces_driver_for_same_dialect() {
        let mut registry = DriverRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(MockEngine::new(Dialect::Postgres)));
        registry.register(Arc::new(MockEngine::new(Dialect::Postgres)));
        assert_eq!(registry.len(), 1);
    }

    #[cfg(not(feature = "oracle"))]
    #[test]
    fn missing_optional_driver_names_feature() {
        let registry = DriverRegistry::new();
        let err = registry.require(Dialect::Oracle).err().expect("oracle is not registered");
        assert_eq!(
            err.to_string(),
            "Driver not found: oracle (build with the `oracle` feature)"
        );
    }
}
