//! Process-wide `scheme -> driver` registry.
use std::{collections::HashMap, sync::Arc, sync::OnceLock, sync::RwLock};

use crate::{
    driver::Driver,
    error::{Error, ErrorKind},
};

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<dyn Driver>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<dyn Driver>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a driver under its scheme, making it reachable from
/// [`crate::database::open`]. Safe to call concurrently from multiple
/// threads; the last registration for a given scheme wins.
pub fn register(driver: Arc<dyn Driver>) {
    let scheme = driver.scheme();
    let mut guard = registry().write().expect("driver registry poisoned");
    guard.insert(scheme, driver);
    crate::common::trace!("registered driver for scheme \"{scheme}\"");
}

/// Look up the driver registered for `scheme`.
pub fn lookup(scheme: &str) -> Result<Arc<dyn Driver>, Error> {
    let guard = registry().read().expect("driver registry poisoned");
    guard
        .get(scheme)
        .cloned()
        .ok_or_else(|| Error::from(ErrorKind::UnknownScheme(scheme.to_owned())))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockDriver;

    #[test]
    fn registers_and_looks_up() {
        register(Arc::new(MockDriver::new("cistern-registry-test")));
        assert!(lookup("cistern-registry-test").is_ok());
        assert!(lookup("cistern-registry-test-nosuch").is_err());
    }
}
