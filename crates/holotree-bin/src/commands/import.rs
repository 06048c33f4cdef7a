//! Imports a bundle archive into the library.

use std::path::PathBuf;

use clap::Parser;
use holotree::CancelToken;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The bundle to import (plain or appended ZIP)
    bundle: PathBuf,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let library = opt.store.library()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("import needs an on-disk library"));
    };
    let stats = holotree_bundle::import::import(disk, &opt.bundle, &CancelToken::new())
        .into_diagnostic()?;
    println!(
        "imported {} blobs and {} catalogs from {}",
        stats.blobs,
        stats.catalogs,
        opt.bundle.display()
    );
    Ok(())
}
