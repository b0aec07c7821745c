use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use serde_json::{json, Value};
use std::{net::IpAddr, path::PathBuf, sync::Arc};

use tunup::{
    cli::{Cli, Command},
    config::Config,
    daemon, fetch,
    host::Host,
    logging,
    merge::MergeReport,
    scheduler::unix_now,
    server::{self, ServerContext},
    store::ProfileStore,
    supervisor::{StartOutcome, StopOutcome},
};

fn merge_json(r: &MergeReport) -> Value {
    json!({
        "profile": r.profile,
        "config": r.config_path,
        "proxies": r.proxies,
        "proxy_groups": r.proxy_groups,
        "rules": r.rules,
        "preview": r.preview,
    })
}

fn start_json(o: &StartOutcome) -> Value {
    match o {
        StartOutcome::Started { pid } => json!({"started": true, "pid": pid}),
        StartOutcome::AlreadyRunning { pid } => json!({"started": false, "pid": pid}),
    }
}

fn stop_json(o: &StopOutcome) -> Value {
    match o {
        StopOutcome::Stopped { pid, forced } => json!({"stopped": pid, "forced": forced}),
        StopOutcome::ReclaimedPort { pids } => json!({"killed": pids}),
        StopOutcome::NotRunning => json!({"stopped": null}),
    }
}

fn serve(mut cfg: Config, bind: Option<IpAddr>, port: Option<u16>, dir: Option<PathBuf>) -> Result<()> {
    if let Some(b) = bind {
        cfg.server.bind = b;
    }
    if let Some(p) = port {
        cfg.server.port = p;
    }
    if let Some(d) = dir {
        cfg.paths.profiles_dir = d;
    }
    let ctx = ServerContext {
        store: ProfileStore::new(&cfg.paths.profiles_dir),
        fetcher: Arc::from(fetch::from_config(&cfg.fetch)?),
        max_body: cfg.server.max_body_bytes,
    };
    server::bind_and_serve(cfg.server.addr(), ctx)
}

fn dispatch(cli: Cli, cfg: Config) -> Result<Value> {
    let mut host = Host::new(cfg, cli.config.clone())?;
    let now = unix_now();
    Ok(match cli.command {
        Command::Serve { .. } => bail!("`serve` runs in the foreground without a host"),
        Command::Host => {
            daemon::run(&mut host)?;
            Value::Null
        }
        Command::List => serde_json::to_value(host.profiles(now)?)?,
        Command::Select { name } => merge_json(&host.select(&name)?),
        Command::Refresh { name } => {
            let out = host.refresh(&name, now)?;
            json!({
                "profile": out.acquired.name,
                "bytes": out.acquired.bytes,
                "sha256": out.acquired.digest,
                "changed": out.acquired.changed,
                "merged": out.merged.as_ref().map(merge_json),
            })
        }
        Command::RefreshDue => {
            let run = host.refresh_due(now)?;
            json!({
                "refreshed": run.refreshed.iter().map(|a| &a.name).collect::<Vec<_>>(),
                "failed": run.failed.iter().map(|(n, e)| json!({"profile": n, "error": e})).collect::<Vec<_>>(),
            })
        }
        Command::StartServer => start_json(&host.ensure_server()?),
        Command::StopServer => stop_json(&host.stop_server()?),
        Command::Status => serde_json::to_value(host.status()?)?,
        Command::Install => merge_json(&host.install()?),
        Command::Uninstall => {
            host.uninstall()?;
            Value::Null
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load_or_default(cli.config.as_deref())?;
    logging::init(&cfg.log)?;

    if let Command::Serve {
        bind,
        port,
        profiles_dir,
    } = cli.command.clone()
    {
        info!("tunup {} serving profiles", env!("CARGO_PKG_VERSION"));
        return serve(cfg, bind, port, profiles_dir);
    }

    match dispatch(cli, cfg) {
        Ok(data) => {
            println!("{}", json!({"code": 0, "data": data}));
            Ok(())
        }
        Err(e) => {
            error!("{e:#}");
            println!("{}", json!({"code": 1, "message": format!("{e:#}")}));
            std::process::exit(1);
        }
    }
}
