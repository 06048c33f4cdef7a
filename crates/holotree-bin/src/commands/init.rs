//! Initializes the product home layout.

use clap::Parser;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    holotree::library::Library::disk(context.clone()).into_diagnostic()?;
    println!("initialized holotree at {}", context.home().display());
    if context.is_shared() {
        println!("shared mode is enabled");
    }
    Ok(())
}
