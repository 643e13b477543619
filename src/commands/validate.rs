// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::{load_cluster, Cli, HandledResult};

pub fn validate(cli: &Cli) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;

    for line in cluster.summary() {
        println!("{line}");
    }

    Ok(())
}
