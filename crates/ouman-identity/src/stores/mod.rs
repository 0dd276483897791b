//! Directory store implementations

mod memory;
pub use memory::InMemoryDirectoryStore;

#[cfg(feature = "ldap")]
mod ldap;
#[cfg(feature = "ldap")]
pub use ldap::{LdapDirectoryStore, LdapStoreConfig};
