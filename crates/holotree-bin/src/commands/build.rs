//! Builds (or reuses) an environment from one or more recipe files.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use holotree::{
    build::{EnvironmentBuilder, ProcessDriver},
    space::SpaceManager,
    CancelToken, Scorecard,
};
use holotree_types::RecipeFile;
use miette::IntoDiagnostic;

use super::common::StoreOpts;

#[derive(Debug, Parser)]
pub struct Opt {
    /// Recipe files (conda.yaml), composed in order
    #[clap(required = true)]
    recipes: Vec<PathBuf>,

    /// The micromamba executable to drive
    #[clap(long, default_value = "micromamba")]
    micromamba: PathBuf,

    /// Also project the result into a space for this controller
    #[clap(long)]
    controller: Option<String>,

    /// Space name used together with --controller
    #[clap(long, default_value = "main")]
    space: String,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = opt.store.context()?;
    let library = holotree::library::Library::disk(context.clone()).into_diagnostic()?;

    let recipes: Vec<RecipeFile> = opt
        .recipes
        .iter()
        .map(|path| RecipeFile::load(path))
        .collect::<Result<_, _>>()
        .into_diagnostic()?;

    let driver = Arc::new(ProcessDriver::new(&opt.micromamba));
    let builder = EnvironmentBuilder::new(context.clone(), &library, driver);
    let cancel = CancelToken::new();

    let (scorecard, events) = Scorecard::bounded(256);
    let progress = std::thread::spawn(move || {
        for event in events {
            tracing::info!(
                "{:?} step {} {:?}: {}",
                event.phase,
                event.step_index,
                event.status,
                event.message
            );
        }
    });

    let outcome = builder.build(&recipes, &scorecard, &cancel).into_diagnostic()?;
    if outcome.rebuilt {
        println!("recorded blueprint {}", outcome.hash);
    } else {
        println!("blueprint {} was already recorded", outcome.hash);
    }

    if let Some(controller) = &opt.controller {
        let Some(disk) = library.as_disk() else {
            return Err(miette::miette!("spaces need an on-disk library"));
        };
        let spaces = SpaceManager::new(context);
        let path = spaces
            .restore(
                disk,
                &outcome.hash,
                controller,
                &opt.space,
                &scorecard,
                &cancel,
            )
            .into_diagnostic()?;
        println!("space ready at {}", path.display());
    }

    drop(scorecard);
    let _ = progress.join();
    Ok(())
}
