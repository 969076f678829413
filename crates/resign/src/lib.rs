mod bundle;
mod codesign;
mod depgraph;
mod entitlements;
mod events;
mod macho;
mod options;
mod package;
mod provision;
mod session;

use std::path::PathBuf;

pub use bundle::{BinaryKind, BinaryRecord, Bundle}; // Bundle helper
pub use codesign::{find_identities, ToolOutput}; // External tool driver
pub use depgraph::{signing_plan, SigningPlan}; // Signing order
pub use events::{Event, EventReceiver}; // Progress stream
pub use macho::{is_encrypted, is_macho, linked_libraries, read_entitlements}; // Mach-O probe
pub use options::ResignOptions; // Session configuration
pub use provision::MobileProvision; // Provisioning profile helper
pub use session::Session; // Pipeline driver

use thiserror::Error as ThisError;
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Unable to read archive: {0}")]
    ArchiveUnreadable(String),
    #[error("Payload must contain exactly one .app directory")]
    InvalidBundleLayout,
    #[error("Main binary is FairPlay-encrypted")]
    Encrypted,
    #[error("Unable to locate entitlements in provisioning profile")]
    ProfileUnreadable,
    #[error("Failed to write entitlements: {0}")]
    EntitlementsWriteFailed(String),
    #[error("codesign failed on {path}: {stderr}")]
    SignFailed { path: PathBuf, stderr: String },
    #[error("Verification failed on {path}: {stderr}")]
    VerifyFailed { path: PathBuf, stderr: String },
    #[error("Failed to repack archive: {0}")]
    RepackFailed(String),
    #[error("Failed to remove working directory: {0}")]
    CleanupFailed(String),
    #[error("No Mach-O binaries found in bundle")]
    NoBinariesFound,
    #[error("No signing identity found in keychain")]
    IdentityNotFound,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
