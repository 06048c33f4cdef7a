//! Lists recorded catalogs and materialized spaces.

use clap::Parser;
use holotree::space::SpaceManager;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// Emit machine readable JSON instead of text
    #[clap(long)]
    json: bool,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    let library = holotree::library::Library::disk(context.clone()).into_diagnostic()?;
    let catalogs = library.catalog_names().into_diagnostic()?;
    let spaces = SpaceManager::new(context).spaces().into_diagnostic()?;

    if opt.json {
        let value = serde_json::json!({
            "catalogs": catalogs,
            "spaces": spaces,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).into_diagnostic()?
        );
        return Ok(());
    }

    println!("catalogs:");
    for name in &catalogs {
        println!("  {name}");
    }
    println!("spaces:");
    for space in &spaces {
        println!(
            "  {}/{} -> {} (blueprint {}, last used {})",
            space.controller,
            space.space,
            space.path.display(),
            space.blueprint,
            space.last_use.to_rfc3339()
        );
    }
    Ok(())
}
