//! ouman LDIF - bulk import and export of directory identities
//!
//! Files are read into [`LdifBlock`]s, classified, and applied block by
//! block through the identity engine, so bulk loads obey the same
//! uniqueness and authorization rules as single calls.

pub mod generator;
pub mod import;
pub mod parser;
pub mod record;


pub use generator::{export_entries, LdifGenerator, PersonExport};
pub use import::{BlockResult, ImportReport, LdifImporter};
pub use parser::parse;
pub use record::{BlockKind, LdifBlock};
