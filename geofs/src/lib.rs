//! Preservation-first storage core.
//!
//! The defining invariant, enforced at every layer, is that no data may
//! be destroyed. Three coupled subsystems implement it:
//!
//! - **GeoFS** ([`Volume`]): a versioned, content-addressed, append-only
//!   storage engine. Every write lands in a deduplicated blob store and
//!   an unsealed working view; `snapshot` seals the working view into an
//!   immutable named stratum. Deletion is [`Volume::hide`]: a new view in
//!   which the path is absent, while every prior view still resolves it.
//! - **VFS** ([`vfs::Vfs`]): mounts GeoFS alongside the `/dev` and
//!   `/proc` pseudo-filesystems and dispatches through per-filesystem
//!   operation tables. There is no `unlink`; operation tables that name
//!   destructive operations are refused at registration.
//! - **Governor** ([`governor::Governor`]): evaluates every executable
//!   payload against the constitution (capability screening plus
//!   destructive-pattern scanning) and writes each decision into the
//!   geology as an immutable audit record.
//!
//! [`Kernel::bootstrap`](kernel::Kernel::bootstrap) assembles the three
//! into one explicit context.

pub mod codec;
pub mod deadline;
pub mod digest;
pub mod errors;
pub mod governor;
pub mod kernel;
pub mod logging;
pub mod path;
pub mod refs;
pub mod store;
pub mod vfs;
pub mod views;
pub mod volume;

pub use deadline::Deadline;
pub use digest::ContentDigest;
pub use errors::{GeofsError, GeofsResult};
pub use kernel::{Kernel, KernelOptions};
pub use refs::{RefEntry, RefFlags, RefKind};
pub use views::{ViewId, ViewRecord};
pub use volume::{Volume, VolumeOptions, VolumeStats};
