use clap::{Parser, Subcommand};
use std::{net::IpAddr, path::PathBuf};

#[derive(Clone, Debug, Parser)]
#[command(
    name = "tunup",
    version,
    about = "Profile server, config merger and refresh scheduler for the TunUp plugin",
    long_about = "tunup keeps proxy profiles (<name>.yml + <name>.meta.yml) in one directory, \
serves a small page for downloading or uploading them, merges the selected profile into the \
tunnel's config.yml and restarts the tunnel service. Output of the query commands is JSON in a \
{\"code\": 0, \"data\": ...} envelope for the plugin front-end."
)]
pub struct Cli {
    /// JSON configuration file; every field has a default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Run the profile HTTP server in the foreground.
    Serve {
        #[arg(long)]
        bind: Option<IpAddr>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        profiles_dir: Option<PathBuf>,
    },
    /// Host loop: supervise the server and refresh due profiles until signalled.
    Host,
    /// List profiles with their metadata.
    List,
    /// Merge a profile into the active configuration and restart the tunnel.
    Select { name: String },
    /// Re-download one profile from its recorded URL.
    Refresh { name: String },
    /// Refresh every profile whose update interval has elapsed.
    RefreshDue,
    StartServer,
    StopServer,
    Status,
    /// Deploy the tunnel binary, assets and unit, then start it with the selected profile.
    Install,
    Uninstall,
}
