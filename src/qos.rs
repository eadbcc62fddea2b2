//! Request admission priority.
//!
//! Requests against the catalog region (the first region of the catalog
//! table, which maps row-ranges to nodes) must never starve behind user
//! traffic, so they classify HIGH. A `Scan.next` carries only its scanner
//! id; the registry resolves it back to the region the scanner was opened
//! against. Everything else is NORMAL.
//!
//! The priority function runs after request decode and before enqueue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const HIGH_QOS: u32 = 200;
pub const NORMAL_QOS: u32 = 0;

/// Table name of the catalog table.
pub const CATALOG_TABLE: &str = "catalog";

/// How a request addresses its region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSpecifier {
    /// Full region name bytes: `<table>,<startKey>,<id>`.
    Name(Vec<u8>),
}

impl RegionSpecifier {
    /// True for the first region of the catalog table (empty start key).
    pub fn is_first_catalog_region(&self) -> bool {
        let RegionSpecifier::Name(name) = self;
        let mut parts = name.splitn(3, |b| *b == b',');
        let table = parts.next().unwrap_or_default();
        let start_key = parts.next();
        table == CATALOG_TABLE.as_bytes() && start_key.is_some_and(|s| s.is_empty())
    }
}

/// A decoded request, as far as classification cares.
#[derive(Debug, Clone)]
pub enum Request {
    Get { region: RegionSpecifier },
    MultiGet { regions: Vec<RegionSpecifier> },
    ScanOpen { region: RegionSpecifier },
    ScanNext { scanner_id: u64 },
    ScanClose { scanner_id: u64 },
    Mutate { region: RegionSpecifier },
    BatchMutate { region: RegionSpecifier },
    Admin { region: RegionSpecifier },
}

/// Maps open scanner ids to the region they scan.
#[derive(Default)]
pub struct ScannerRegistry {
    scanners: RwLock<HashMap<u64, Vec<u8>>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scanner_id: u64, region_name: Vec<u8>) {
        self.scanners
            .write()
            .expect("scanner registry lock")
            .insert(scanner_id, region_name);
    }

    pub fn unregister(&self, scanner_id: u64) {
        self.scanners
            .write()
            .expect("scanner registry lock")
            .remove(&scanner_id);
    }

    pub fn resolve(&self, scanner_id: u64) -> Option<Vec<u8>> {
        self.scanners
            .read()
            .expect("scanner registry lock")
            .get(&scanner_id)
            .cloned()
    }
}

/// The admission priority function.
pub struct PriorityFunction {
    registry: Arc<ScannerRegistry>,
}

impl PriorityFunction {
    pub fn new(registry: Arc<ScannerRegistry>) -> Self {
        Self { registry }
    }

    pub fn priority(&self, request: &Request) -> u32 {
        match request {
            Request::Get { region }
            | Request::ScanOpen { region }
            | Request::Mutate { region }
            | Request::BatchMutate { region }
            | Request::Admin { region } => {
                if region.is_first_catalog_region() {
                    HIGH_QOS
                } else {
                    NORMAL_QOS
                }
            }
            Request::MultiGet { regions } => {
                if regions.iter().any(RegionSpecifier::is_first_catalog_region) {
                    HIGH_QOS
                } else {
                    NORMAL_QOS
                }
            }
            Request::ScanNext { scanner_id } | Request::ScanClose { scanner_id } => {
                match self.registry.resolve(*scanner_id) {
                    Some(name)
                        if RegionSpecifier::Name(name.clone()).is_first_catalog_region() =>
                    {
                        HIGH_QOS
                    }
                    _ => NORMAL_QOS,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_region() -> RegionSpecifier {
        RegionSpecifier::Name(b"catalog,,1".to_vec())
    }

    fn user_region() -> RegionSpecifier {
        RegionSpecifier::Name(b"usertable,row500,99".to_vec())
    }

    #[test]
    fn test_get_on_catalog_is_high() {
        let priority = PriorityFunction::new(Arc::new(ScannerRegistry::new()));
        assert_eq!(
            priority.priority(&Request::Get {
                region: catalog_region()
            }),
            HIGH_QOS
        );
        assert_eq!(
            priority.priority(&Request::Get {
                region: user_region()
            }),
            NORMAL_QOS
        );
    }

    #[test]
    fn test_admin_on_catalog_is_high() {
        let priority = PriorityFunction::new(Arc::new(ScannerRegistry::new()));
        assert_eq!(
            priority.priority(&Request::Admin {
                region: catalog_region()
            }),
            HIGH_QOS
        );
    }

    #[test]
    fn test_scan_next_resolves_scanner_id() {
        let registry = Arc::new(ScannerRegistry::new());
        registry.register(7, b"catalog,,1".to_vec());
        registry.register(8, b"usertable,row500,99".to_vec());
        let priority = PriorityFunction::new(registry.clone());

        assert_eq!(
            priority.priority(&Request::ScanNext { scanner_id: 7 }),
            HIGH_QOS
        );
        assert_eq!(
            priority.priority(&Request::ScanNext { scanner_id: 8 }),
            NORMAL_QOS
        );
        // Unknown scanner ids never misclassify upward.
        assert_eq!(
            priority.priority(&Request::ScanNext { scanner_id: 99 }),
            NORMAL_QOS
        );

        registry.unregister(7);
        assert_eq!(
            priority.priority(&Request::ScanNext { scanner_id: 7 }),
            NORMAL_QOS
        );
    }

    #[test]
    fn test_non_first_catalog_region_is_normal() {
        // A catalog region with a non-empty start key is not the first one.
        let priority = PriorityFunction::new(Arc::new(ScannerRegistry::new()));
        assert_eq!(
            priority.priority(&Request::Get {
                region: RegionSpecifier::Name(b"catalog,split,2".to_vec())
            }),
            NORMAL_QOS
        );
    }
}
