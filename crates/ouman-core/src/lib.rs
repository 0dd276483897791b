//! ouman core - domain types, naming paths and role resolution for
//! identities spread across several organizational units

pub mod error;
pub mod ids;
pub mod models;
pub mod naming;
pub mod role;
pub mod traits;
pub mod validation;


pub use error::*;
pub use ids::*;
pub use models::*;
pub use naming::{
    build_entry_path, build_ou_path, escape_value, has_risky_chars, is_valid_value,
    list_risky_chars, NamingPath, Rdn,
};
pub use role::{resolve_ou, resolve_role, Subject};
pub use traits::*;
