//! Deletes a space, or drops a catalog from the index.

use clap::Parser;
use holotree::space::SpaceManager;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The controller owning the space
    #[clap(long, conflicts_with = "catalog")]
    controller: Option<String>,

    /// The space name to delete
    #[clap(long, requires = "controller")]
    space: Option<String>,

    /// A catalog file name to drop from the index instead
    #[clap(long)]
    catalog: Option<String>,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    if let Some(name) = &opt.catalog {
        let library = holotree::library::Library::disk(context).into_diagnostic()?;
        let Some(disk) = library.as_disk() else {
            return Err(miette::miette!("catalog removal needs an on-disk library"));
        };
        disk.remove_catalog(name).into_diagnostic()?;
        println!("dropped catalog {name}");
        return Ok(());
    }

    let (Some(controller), Some(space)) = (&opt.controller, &opt.space) else {
        return Err(miette::miette!(
            "pass either --catalog, or --controller with --space"
        ));
    };
    SpaceManager::new(context)
        .delete(controller, space)
        .into_diagnostic()?;
    println!("deleted space {controller}/{space}");
    Ok(())
}
