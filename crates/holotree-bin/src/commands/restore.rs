//! Projects a recorded catalog into a space.

use clap::Parser;
use holotree::{space::SpaceManager, CancelToken, Scorecard};
use holotree_types::BlueprintHash;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The blueprint hash to restore
    hash: BlueprintHash,

    /// The controller requesting the space
    #[clap(long, default_value = "user")]
    controller: String,

    /// The space name within the controller
    #[clap(long, default_value = "main")]
    space: String,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    let library = holotree::library::Library::disk(context.clone()).into_diagnostic()?;
    let Some(disk) = library.as_disk() else {
        return Err(miette::miette!("spaces need an on-disk library"));
    };
    let path = SpaceManager::new(context)
        .restore(
            disk,
            &opt.hash,
            &opt.controller,
            &opt.space,
            &Scorecard::disabled(),
            &CancelToken::new(),
        )
        .into_diagnostic()?;
    println!("{}", path.display());
    Ok(())
}
