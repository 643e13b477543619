// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use clusterwatch_lib::commands::{self, Cli};

/// The clusterwatch binary polls a cluster's hosts and reports cluster and DRBD status.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("CLUSTERWATCH_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
