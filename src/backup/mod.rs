mod artifact;
mod compression;
mod gpg;
mod guard;
mod job;
mod keep_local;
mod modifier;
mod stream;

pub use artifact::{ArtifactName, Codec};
pub use guard::{RunGuard, RunScope};
pub use job::{
    backup_everything, backup_files, backup_mysql, stream_to_destination, BackupResult, RunState,
};
pub use modifier::{CallbackContext, ModifierChain, StreamModifier};
pub use stream::{BackupStream, CheckedStream, Process, ProcessLog, ProcessStream, TeeReader};
