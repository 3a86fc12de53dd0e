//! vmforge provisions virtual machines onto remote hypervisors.
//!
//! One build is a single sequential control flow: resolve addressing from
//! the range inventory, run the hypervisor-side pipeline (capacity checks,
//! storage, image, guest preparation, commit, boot wait), then the
//! guest-side postboot phase. Named hooks let callers inject auxiliary
//! behavior at defined points without modifying the pipeline.
//!
//! External collaborators are traits: [`inventory::Inventory`] for
//! server/range lookups, [`remote::RemoteTransport`] for command execution,
//! [`net::NetworkPrompt`] and [`policy::FailurePolicy`] for the interactive
//! surfaces.

pub mod bootwait;
pub mod build;
pub mod errors;
pub mod guest;
pub mod hooks;
pub mod hypervisor;
pub mod image;
pub mod inventory;
pub mod net;
pub mod pipeline;
pub mod policy;
pub mod remote;
pub mod storage;

pub use build::{BuildConfig, BuildOptions, Builder};
pub use errors::{VmforgeError, VmforgeResult};
pub use hooks::{HookArgs, HookRegistry, HookStage, HookValue};
