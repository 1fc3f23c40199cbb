//! Customer registry
//!
//! NIST 800-53: AC-2 (Account Management)
//! Implementation: Fixed set of customers built once at startup and shared
//! read-only between all sessions.

use crate::config::Config;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A customer allowed to log in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRecord {
    /// Login name, unique within the registry
    pub username: String,
    /// Absolute path that the customer sees as `/`
    pub home_directory: PathBuf,
    /// File whose first line is the customer's `<type> <base64> [comment]` key
    pub authorized_key_file: PathBuf,
}

impl CustomerRecord {
    /// Record for `username` with its home and key file
    pub fn new(
        username: impl Into<String>,
        home_directory: impl Into<PathBuf>,
        authorized_key_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            username: username.into(),
            home_directory: home_directory.into(),
            authorized_key_file: authorized_key_file.into(),
        }
    }
}

/// Immutable username → customer mapping
#[derive(Debug, Default)]
pub struct CustomerRegistry {
    customers: HashMap<String, Arc<CustomerRecord>>,
}

impl CustomerRegistry {
    /// Registry with no customers
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `[customers]` tables of the configuration
    pub fn from_config(config: &Config) -> Self {
        config
            .customers
            .iter()
            .fold(Self::new(), |registry, (username, customer)| {
                registry.with_customer(CustomerRecord::new(
                    username.clone(),
                    customer.home.clone(),
                    customer.authorized_key_file.clone(),
                ))
            })
    }

    /// Add a customer, replacing any previous record with the same username
    #[must_use]
    pub fn with_customer(mut self, record: CustomerRecord) -> Self {
        self.customers
            .insert(record.username.clone(), Arc::new(record));
        self
    }

    /// Look up a customer by username
    ///
    /// # Errors
    ///
    /// Returns [`Error::CustomerNotFound`] for an unknown username.
    pub fn lookup(&self, username: &str) -> Result<Arc<CustomerRecord>> {
        self.customers
            .get(username)
            .cloned()
            .ok_or_else(|| Error::CustomerNotFound(username.to_string()))
    }

    /// Number of registered customers
    pub fn len(&self) -> usize {
        self.customers.len()
    }

    /// `true` when no customer is registered
    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    /// Registered usernames, sorted
    pub fn usernames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.customers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
