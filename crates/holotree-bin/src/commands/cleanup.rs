//! Age-based collection of spaces, tempfiles and quarantined blobs.

use clap::Parser;
use holotree::{
    cleanup::{cleanup, CleanupOptions},
    CancelToken,
};
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// Report what would be removed without deleting anything
    #[clap(long)]
    dry_run: bool,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    let stats = cleanup(
        &context,
        &CleanupOptions {
            limit_days: context.options().cleanup_days,
            dry_run: opt.dry_run,
        },
        &CancelToken::new(),
    )
    .into_diagnostic()?;

    let verb = if opt.dry_run { "would remove" } else { "removed" };
    println!(
        "{verb} {} spaces, {} tempfiles, {} quarantined blobs, {} lock files ({} bytes)",
        stats.spaces_removed,
        stats.tempfiles_removed,
        stats.quarantined_removed,
        stats.lock_files_removed,
        stats.bytes_freed
    );
    for (path, error) in &stats.failures {
        tracing::warn!("could not remove '{}': {error}", path.display());
    }
    Ok(())
}
