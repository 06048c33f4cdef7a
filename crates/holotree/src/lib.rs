#![deny(missing_docs)]

//! The holotree storage engine: a content-addressed library of environment
//! files, catalogs binding blueprint hashes to those files, spaces projected
//! from catalogs by hardlink, and the builder that records new catalogs.
//!
//! All state lives under a single product home directory:
//!
//! ```text
//! <home>/
//!   hololib/
//!     catalogs/                     # catalog files, <hash>v<ver>.<platform>
//!     library/<aa>/<bb>/<digest>    # blob store, sharded by digest prefix
//!     shared.marker                 # presence enables shared-mode layout
//!   spaces/
//!     <controllerHash>/<spaceHash>/ # materialized projections
//!     <identity>.use                # last-use marker (mtime = last use)
//!   locks/                          # advisory lock files + pid markers
//!   tmp/                            # tempfiles, swept by age
//! ```

pub mod build;
mod cancel;
pub mod catalog;
pub mod cleanup;
mod codec;
mod context;
pub mod library;
mod scorecard;
pub mod space;

pub use cancel::{CancelToken, Cancelled};
pub use codec::BlobReader;
pub use context::{HolotreeContext, HolotreeOptions};
pub use scorecard::{Scorecard, ScorecardEvent, ScorecardPhase, StepStatus};
