// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod validate;
pub mod watch;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::{cluster::Cluster, config::Config, manager::WatchContext};

use watch::WatchArgs;

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` inentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(long, global = true)]
    pub socket: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll every host of the cluster and report status changes until interrupted.
    Watch(WatchArgs),
    /// Check the config file and print a summary of the cluster it describes.
    Validate,
}

impl Cli {
    pub fn config_path(&self) -> String {
        match &self.config {
            Some(path) => path.clone(),
            None => crate::default_config_path(),
        }
    }
}

/// Load the config file named on the command line and build the cluster it describes.
fn load_cluster(cli: &Cli) -> HandledResult<Cluster> {
    let path = cli.config_path();
    let config = Config::from_file(&path)?;
    let context = Arc::new(WatchContext::new(&config, cli.verbose));
    Cluster::from_config(&config, context)
        .handle_err(|e| eprintln!("Invalid config file \"{path}\": {e}"))
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Watch(args) => watch::watch(cli, args),
        Commands::Validate => validate::validate(cli),
    }
}
