mod document;
mod record;
mod retention;
mod run_type;

pub use document::StatusDocument;
pub use record::{BackupKind, BackupRecord, ConfigSnapshot};
pub use retention::plan_expiry;
pub use run_type::RunType;
