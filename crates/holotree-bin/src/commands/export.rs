//! Exports catalogs and their blobs into a bundle archive.

use std::path::PathBuf;

use clap::Parser;
use holotree::CancelToken;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The archive to write
    output: PathBuf,

    /// Catalog file names to export
    #[clap(required = true)]
    catalogs: Vec<String>,

    /// Catalogs the receiver already holds; their blobs are skipped
    #[clap(long)]
    known: Vec<String>,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let library = opt.store.library()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("export needs an on-disk library"));
    };
    let stats = holotree_bundle::export::export(
        disk,
        &opt.catalogs,
        &opt.known,
        &opt.output,
        &CancelToken::new(),
    )
    .into_diagnostic()?;
    println!(
        "wrote {} catalogs and {} blobs to {}",
        stats.catalogs,
        stats.blobs,
        opt.output.display()
    );
    Ok(())
}
