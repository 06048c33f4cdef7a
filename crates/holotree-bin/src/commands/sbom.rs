//! Emits a CycloneDX or SPDX document for a recorded catalog or a bundle.

use std::path::PathBuf;

use clap::Parser;
use holotree::CancelToken;
use holotree_sbom::SbomFormat;
use holotree_types::BlueprintHash;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The blueprint hash to describe
    #[clap(conflicts_with = "bundle")]
    hash: Option<BlueprintHash>,

    /// Describe the environments of a bundle instead, importing its
    /// embedded library into a temporary holotree first
    #[clap(long)]
    bundle: Option<PathBuf>,

    /// Output format: cyclonedx or spdx
    #[clap(long, default_value = "cyclonedx")]
    format: String,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let format: SbomFormat = opt.format.parse().into_diagnostic()?;

    if let Some(bundle) = &opt.bundle {
        return bundle_sbom(bundle, format);
    }

    let Some(hash) = &opt.hash else {
        return Err(miette::miette!("pass a blueprint hash or --bundle"));
    };
    let library = opt.store.library()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("sbom extraction needs an on-disk library"));
    };
    let catalog = library.load_catalog(hash).into_diagnostic()?;
    let document = holotree_sbom::generate(disk, &catalog, format).into_diagnostic()?;
    print!("{document}");
    Ok(())
}

/// Imports the bundle's embedded hololib into a throwaway home and emits
/// one document per catalog it carries.
fn bundle_sbom(bundle: &PathBuf, format: SbomFormat) -> miette::Result<()> {
    let scratch = tempfile::tempdir().into_diagnostic()?;
    let context = std::sync::Arc::new(holotree::HolotreeContext::new(
        scratch.path(),
        holotree::HolotreeOptions::default(),
    ));
    let library = holotree::library::Library::disk(context).into_diagnostic()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("sbom extraction needs an on-disk library"));
    };
    holotree_bundle::import::import(disk, bundle, &CancelToken::new()).into_diagnostic()?;

    for name in library.catalog_names().into_diagnostic()? {
        let catalog = disk.load_catalog_by_name(&name).into_diagnostic()?;
        let document = holotree_sbom::generate(disk, &catalog, format).into_diagnostic()?;
        print!("{document}");
    }
    Ok(())
}
