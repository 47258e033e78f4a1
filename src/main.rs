use std::process::ExitCode;

use clap::Parser;
use colored::*;

use fanout_ssh::config::Action;
use fanout_ssh::logging::init_logging;
use fanout_ssh::session::backend;
use fanout_ssh::{
    dispatch, get_hosts, parse_host_list, Config, Console, CopySpec, DispatchError,
    DispatchOptions, Payload, TargetList,
};

fn targets(cli: &Config) -> Result<TargetList, DispatchError> {
    let mut targets = TargetList::default();
    if let Some(hosts_file) = &cli.hosts_file {
        targets.extend(get_hosts(hosts_file)?);
    }
    for list in &cli.hosts {
        targets.extend(parse_host_list(list));
    }
    let excluded: Vec<String> = cli
        .exclude
        .iter()
        .flat_map(|list| parse_host_list(list))
        .map(|host| host.hostname)
        .collect();
    targets.exclude(&excluded);
    if targets.is_empty() {
        return Err(DispatchError::NoHosts);
    }
    Ok(targets)
}

async fn run(cli: Config) -> Result<i32, DispatchError> {
    let mut targets = targets(&cli)?;
    let options = DispatchOptions::from(&cli);
    let backend = backend(cli.rcmd, &cli.exec_template, cli.lockstep)?;
    let payload = match cli.action {
        Action::Exec { command } => Payload::Command(command.join(" ")),
        Action::Copy {
            preserve,
            recursive,
            sources,
            destination,
        } => Payload::Copy(CopySpec {
            sources,
            destination,
            preserve,
            recursive,
        }),
    };
    let console = Console::stdio();

    let mut exit_code = 0;
    for pass in 1..=cli.passes.max(1) {
        if targets.is_empty() {
            console.diagnostic("[Fanout] No hosts left to run on.");
            break;
        }
        tracing::info!(pass, hosts = targets.len(), "starting pass");
        let outcome = dispatch(
            &mut targets,
            &payload,
            backend.clone(),
            &options,
            &console,
        )
        .await?;
        let failed: Vec<&str> = outcome.failed().map(|h| h.hostname.as_str()).collect();
        if !failed.is_empty() {
            tracing::info!("{} host(s) failed: {}", failed.len(), failed.join(","));
        }
        exit_code = outcome.exit_code;
    }
    Ok(exit_code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
        Err(e) => {
            eprintln!("{} {}", "[Fanout]".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
