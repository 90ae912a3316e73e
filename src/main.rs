use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use nsmount::{EntryPlan, JoinOrder, MountApi, MountSpec, NamespaceSpec};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// A namespace to create (`net`) or join (`net=/proc/42/ns/net`)
    #[arg(long = "ns", value_name = "KIND[=PATH]")]
    namespaces: Vec<NamespaceSpec>,

    /// A mount to make before the command runs
    #[arg(long = "mount", value_name = "SOURCE:TARGET:FSTYPE[:OPTIONS]")]
    mounts: Vec<MountSpec>,

    /// Pivot into this directory once everything is mounted
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// A JSON plan that the other flags are added to
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Seconds each handshake stage may take
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Use mount(2) even where the detached mount API is available
    #[arg(long)]
    classic: bool,

    /// Join an existing user namespace only after mounting
    #[arg(long)]
    defer_user: bool,

    /// Drop all capabilities before executing the command
    #[arg(long)]
    drop_caps: bool,

    /// An environment variable for the command
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// The actual program to execute
    #[arg(trailing_var_arg = true, required_unless_present = "plan")]
    cmd: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

impl Args {
    /// Layers the command line on top of the plan file, if there is one.
    fn into_plan(self) -> Result<EntryPlan> {
        let mut plan = match &self.plan {
            Some(path) => EntryPlan::from_file(path)
                .with_context(|| format!("failed to load plan from {path:?}"))?,
            None => EntryPlan::default(),
        };

        plan.namespaces.extend(self.namespaces);
        plan.mounts.extend(self.mounts);
        plan.env.extend(self.env);
        if self.rootfs.is_some() {
            plan.rootfs = self.rootfs;
        }
        if let Some(secs) = self.timeout {
            plan.stage_timeout_ms = secs.saturating_mul(1000);
        }
        if self.classic {
            plan.mount_api = MountApi::Classic;
        }
        if self.defer_user {
            plan.join_order = JoinOrder::DeferUser;
        }
        plan.drop_capabilities |= self.drop_caps;
        if !self.cmd.is_empty() {
            plan.command = self.cmd;
        }

        Ok(plan)
    }
}

fn main() -> Result<ExitCode> {
    // Initialize the application.
    env_logger::init();
    let plan = Args::parse().into_plan()?;
    debug!("{plan:?}");

    let entered = nsmount::attempt(&plan).context("failed to enter namespaces")?;
    info!("process {} is ready, starting {:?}", entered.pid(), plan.command);

    let running = entered.start().context("failed to start command")?;
    let code = running.wait().context("failed to wait for command")?;
    debug!("command exited with {code}");

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
