//! Re-hashes every blob referenced by every catalog.

use clap::Parser;
use holotree::CancelToken;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let library = opt.store.library()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("verification needs an on-disk library"));
    };
    let stats = disk.verify(&CancelToken::new()).into_diagnostic()?;
    println!(
        "checked {} catalogs and {} blobs",
        stats.catalogs_checked, stats.blobs_checked
    );
    if stats.failures.is_empty() {
        println!("library is consistent");
        return Ok(());
    }
    for failure in &stats.failures {
        match &failure.quarantined {
            Some(path) => println!(
                "corrupt blob {} quarantined at {} (referenced by {})",
                failure.digest,
                path.display(),
                failure.catalogs.join(", ")
            ),
            None => println!(
                "missing blob {} (referenced by {})",
                failure.digest,
                failure.catalogs.join(", ")
            ),
        }
    }
    Err(miette::miette!(
        "{} blobs failed verification",
        stats.failures.len()
    ))
}
