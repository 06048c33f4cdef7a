//! Builds every environment declared in a bundle, optionally materializing
//! spaces, with the exit codes downstream tooling depends on.

use std::{path::PathBuf, process::exit, sync::Arc};

use clap::Parser;
use holotree::{
    build::ProcessDriver,
    CancelToken, Scorecard,
};
use holotree_bundle::{reader::open_bundle, run::build_from_bundle};

use super::common::StoreOpts;

/// Exit codes preserved for compatibility with existing automation.
const EXIT_INVALID_INPUT: i32 = 1;
const EXIT_CANNOT_OPEN_BUNDLE: i32 = 2;
const EXIT_NO_ENVIRONMENTS: i32 = 3;
const EXIT_BUILDS_FAILED: i32 = 4;
const EXIT_JSON_FAILURE: i32 = 5;

#[derive(Debug, Parser)]
pub struct Opt {
    /// The bundle to run (plain or appended ZIP)
    bundle: PathBuf,

    /// The controller the spaces are created for
    #[clap(long, default_value = "bundle")]
    controller: String,

    /// Only record catalogs, do not materialize spaces
    #[clap(long)]
    no_spaces: bool,

    /// The micromamba executable to drive
    #[clap(long, default_value = "micromamba")]
    micromamba: PathBuf,

    /// Emit per-environment results as JSON on stdout
    #[clap(long)]
    json: bool,

    #[clap(flatten)]
    store: StoreOpts,
}

pub fn execute(opt: Opt) -> miette::Result<()> {
    let context = match opt.store.context() {
        Ok(context) => context,
        Err(err) => {
            eprintln!("invalid input: {err}");
            exit(EXIT_INVALID_INPUT);
        }
    };
    let library = match holotree::library::Library::disk(context.clone()) {
        Ok(library) => library,
        Err(err) => {
            eprintln!("invalid input: {err}");
            exit(EXIT_INVALID_INPUT);
        }
    };

    // Probe the archive up front so "not a bundle" gets its own exit code.
    let mut bundle = match open_bundle(&opt.bundle) {
        Ok(bundle) => bundle,
        Err(err) => {
            eprintln!("cannot open bundle '{}': {err}", opt.bundle.display());
            exit(EXIT_CANNOT_OPEN_BUNDLE);
        }
    };
    match holotree_bundle::run::environments(&mut bundle) {
        Ok(environments) if environments.is_empty() => {
            eprintln!("bundle '{}' declares no environments", opt.bundle.display());
            exit(EXIT_NO_ENVIRONMENTS);
        }
        Ok(_) => {}
        Err(err) => {
            eprintln!("cannot open bundle '{}': {err}", opt.bundle.display());
            exit(EXIT_CANNOT_OPEN_BUNDLE);
        }
    }
    drop(bundle);

    let driver = Arc::new(ProcessDriver::new(&opt.micromamba));
    let results = match build_from_bundle(
        &opt.bundle,
        context,
        &library,
        driver,
        &opt.controller,
        !opt.no_spaces,
        &Scorecard::disabled(),
        &CancelToken::new(),
    ) {
        Ok(results) => results,
        Err(err) => {
            eprintln!("cannot process bundle '{}': {err}", opt.bundle.display());
            exit(EXIT_CANNOT_OPEN_BUNDLE);
        }
    };

    if opt.json {
        match serde_json::to_string_pretty(&results) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                eprintln!("failed to encode results: {err}");
                exit(EXIT_JSON_FAILURE);
            }
        }
    } else {
        for result in &results {
            match (result.success, &result.error) {
                (true, _) => println!(
                    "{}: ok ({})",
                    result.name,
                    result.hash.as_deref().unwrap_or("-")
                ),
                (false, Some(error)) => println!("{}: failed: {error}", result.name),
                (false, None) => println!("{}: failed", result.name),
            }
        }
    }

    if results.iter().any(|result| !result.success) {
        exit(EXIT_BUILDS_FAILED);
    }
    Ok(())
}
