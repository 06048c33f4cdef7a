//! Options and helpers shared by every subcommand.

use std::{path::PathBuf, sync::Arc, time::Duration};

use holotree::{library::Library, HolotreeContext, HolotreeOptions};
use miette::IntoDiagnostic;

/// Options controlling the product home and storage behavior.
#[derive(Debug, clap::Args)]
pub struct StoreOpts {
    /// Product home directory (defaults to $HOLOTREE_HOME or the platform
    /// data dir)
    #[clap(long)]
    pub home: Option<PathBuf>,

    /// Store blobs raw instead of compressed
    #[clap(long)]
    pub no_compress: bool,

    /// Use a shared, group-writable holotree layout
    #[clap(long)]
    pub shared: bool,

    /// Include dev-dependencies blocks in blueprint composition
    #[clap(long)]
    pub dev: bool,

    /// Rebuild even when the blueprint is already recorded
    #[clap(long)]
    pub force: bool,

    /// Age threshold in days for cleanup
    #[clap(long, default_value_t = 30)]
    pub cleanup_days: u32,

    /// Seconds to wait for a lock before giving up
    #[clap(long, default_value_t = 60)]
    pub lock_timeout: u64,
}

impl StoreOpts {
    pub fn context(&self) -> miette::Result<Arc<HolotreeContext>> {
        let options = HolotreeOptions {
            no_compress: self.no_compress,
            shared_holotree: self.shared,
            dev_dependencies: self.dev,
            force_build: self.force,
            cleanup_days: self.cleanup_days,
            lock_timeout: Duration::from_secs(self.lock_timeout),
        };
        let context = match &self.home {
            Some(home) => HolotreeContext::new(home.clone(), options),
            None => HolotreeContext::discover(options).into_diagnostic()?,
        };
        Ok(Arc::new(context))
    }

    pub fn library(&self) -> miette::Result<Library> {
        Library::disk(self.context()?).into_diagnostic()
    }
}
