// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{load_cluster, Cli, HandledResult},
    manager,
};

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Don't serve status queries on the unix socket.
    #[arg(long)]
    no_socket: bool,
}

pub fn watch(cli: &Cli, args: &WatchArgs) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;

    let socket = match (&cli.socket, args.no_socket) {
        (_, true) => None,
        (Some(socket), false) => Some(socket.clone()),
        (None, false) => Some(crate::default_socket()),
    };

    manager::main(cluster, socket)
}
