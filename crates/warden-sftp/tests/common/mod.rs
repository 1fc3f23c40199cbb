//! Shared fixtures for the integration tests

#![allow(dead_code)]

use russh::keys::{Algorithm, PrivateKey};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use warden_sftp::{CustomerRecord, CustomerRegistry, MutationPolicy, SandboxFs};

/// A customer with its own home and a freshly generated key
pub struct TestCustomer {
    pub name: String,
    pub home: TempDir,
    pub keys: TempDir,
    pub key: PrivateKey,
}

impl TestCustomer {
    pub fn new(name: &str) -> Self {
        let home = TempDir::new().unwrap();
        let keys = TempDir::new().unwrap();
        let key = generate_key();
        let customer = Self {
            name: name.to_string(),
            home,
            keys,
            key,
        };
        let line = customer.key.public_key().to_openssh().unwrap();
        std::fs::write(customer.key_file(), format!("{line}\n")).unwrap();
        customer
    }

    pub fn key_file(&self) -> PathBuf {
        self.keys.path().join("id.pub")
    }

    pub fn record(&self) -> CustomerRecord {
        CustomerRecord::new(self.name.clone(), self.home.path(), self.key_file())
    }

    pub fn fs(&self, policy: MutationPolicy) -> SandboxFs {
        SandboxFs::new(Arc::new(self.record()), policy)
    }
}

pub fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
}

pub fn registry(customers: &[&TestCustomer]) -> Arc<CustomerRegistry> {
    Arc::new(
        customers
            .iter()
            .fold(CustomerRegistry::new(), |registry, customer| {
                registry.with_customer(customer.record())
            }),
    )
}
