//! webmgr - Entry Point
//!
//! Deploys and manages web applications on a single host behind nginx,
//! each application process supervised by its own systemd unit.

mod cli;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use webmgr::app::options::AppOptions;
use webmgr::app::run::{build_orchestrator, load_settings, run_cancellable};
use webmgr::deploy::cancel::CancelToken;
use webmgr::deploy::deployer::detect_app_type;
use webmgr::deploy::diagnose::diagnose;
use webmgr::deploy::orchestrator::{AppReport, RemoveOptions};
use webmgr::errors::{ErrorKind, ManagerError};
use webmgr::filesys::dir::Dir;
use webmgr::filesys::file::File;
use webmgr::logs::init_logging;
use webmgr::models::app::{AppType, RunState};
use webmgr::models::deployment::DeploySummary;
use webmgr::services::systemd::SystemdService;
use webmgr::storage::records::RecordExport;
use webmgr::utils::version_info;

use crate::cli::{Cli, Commands};

const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Commands that need neither settings nor logging
    match &cli.command {
        Commands::Version => {
            let version = version_info();
            println!("webmgr {} ({}, built {})", version.version, version.git_hash, version.build_time);
            return ExitCode::SUCCESS;
        }
        Commands::Types => {
            for app_type in AppType::ALL {
                println!("{:<10} {}", app_type.as_str().bold(), app_type.description());
            }
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let mut options = match &cli.root {
        Some(root) => AppOptions::under(root),
        None => AppOptions::default(),
    };
    options.verbose = cli.verbose;
    options.json_logs = cli.json_logs;

    if let Err(e) = load_settings(&mut options).await {
        eprintln!("{} unable to read settings: {}", "error:".red().bold(), e);
        return ExitCode::FAILURE;
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = match init_logging(options.log_options()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match execute(cli.command, &options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}

async fn execute(command: Commands, options: &AppOptions) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(options);
    let cancel = CancelToken::new();

    match command {
        Commands::Add(args) => {
            let spec = args.into_spec();
            info!("Adding {} ({}) from {}", spec.domain, spec.app_type, spec.source);
            let summary =
                run_cancellable(orchestrator.add(spec, &cancel), cancel.clone(), await_shutdown_signal()).await?;
            print_summary("deployed", &summary);
        }
        Commands::Update { domain, branch } => {
            let summary = run_cancellable(
                orchestrator.update(&domain, branch.as_deref(), &cancel),
                cancel.clone(),
                await_shutdown_signal(),
            )
            .await?;
            print_summary("updated", &summary);
        }
        Commands::Repair { domain } => {
            let summary =
                run_cancellable(orchestrator.repair(&domain, &cancel), cancel.clone(), await_shutdown_signal())
                    .await?;
            print_summary("repaired", &summary);
        }
        Commands::Restart { domain } => {
            let summary =
                run_cancellable(orchestrator.restart(&domain, &cancel), cancel.clone(), await_shutdown_signal())
                    .await?;
            print_summary("restarted", &summary);
        }
        Commands::Remove {
            domain,
            keep_source,
            no_backup,
        } => {
            let remove = RemoveOptions {
                keep_source,
                backup: !no_backup,
            };
            let summary = run_cancellable(
                orchestrator.remove(&domain, remove, &cancel),
                cancel.clone(),
                await_shutdown_signal(),
            )
            .await?;
            println!("{} {} removed", "ok".green().bold(), domain.bold());
            print_warnings(summary.warnings());
        }
        Commands::Status { domain, json } => {
            let reports = match domain {
                Some(domain) => vec![orchestrator.status(&domain).await?],
                None => orchestrator.list().await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
            }
        }
        Commands::List { json } => {
            let reports = orchestrator.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_table(&reports);
            }
        }
        Commands::Logs { domain, lines, follow } => {
            if follow {
                orchestrator.status(&domain).await?;
                let mut command = SystemdService::follow_command(&domain, lines);
                if options.settings.use_sudo {
                    command = format!("sudo {}", command);
                }
                let status = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .status()
                    .await
                    .with_context(|| format!("unable to run `{}`", command))?;
                if !status.success() {
                    anyhow::bail!("`{}` exited with {}", command, status);
                }
            } else {
                print!("{}", orchestrator.logs(&domain, lines).await?);
            }
        }
        Commands::Detect { directory } => {
            let dir = Dir::new(&directory);
            match detect_app_type(&dir).await? {
                Some(app_type) => println!("{} ({})", app_type.as_str().bold(), app_type.description()),
                None => anyhow::bail!("could not detect an application type in {}", directory.display()),
            }
        }
        Commands::Setup => {
            let written = orchestrator.setup().await?;
            println!("{} layout ready, apps in {}", "ok".green().bold(), options.paths.apps_dir.display());
            for page in written {
                println!("  wrote {}", page.display());
            }
        }
        Commands::ApplyMaintenance => {
            let report = orchestrator.apply_maintenance().await?;
            for domain in &report.updated {
                println!("{} {}", "updated".green(), domain);
            }
            for domain in &report.unchanged {
                println!("{} {}", "unchanged".dimmed(), domain);
            }
            for (domain, reason) in &report.failed {
                println!("{} {}: {}", "failed".red(), domain, reason);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} site(s) could not be updated", report.failed.len());
            }
        }
        Commands::Maintenance { domain, enable, disable } => {
            let enable = enable && !disable;
            orchestrator.set_maintenance(&domain, enable).await?;
            let state = if enable { "on".yellow() } else { "off".green() };
            println!("{} maintenance {} for {}", "ok".green().bold(), state, domain.bold());
        }
        Commands::Ssl { domain, email } => {
            let record = orchestrator.setup_ssl(&domain, email.as_deref()).await?;
            println!("{} certificate installed, {} is live at {}", "ok".green().bold(), domain.bold(), record.url());
        }
        Commands::Export { output } => {
            let export = orchestrator.export_records().await?;
            match output {
                Some(path) => {
                    let file = File::new(&path);
                    file.write_json(&export).await?;
                    // Records carry application secrets
                    file.set_permissions_600().await?;
                    println!("{} exported {} application(s) to {}", "ok".green().bold(), export.apps.len(), path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&export)?),
            }
        }
        Commands::Import { file, replace } => {
            let export: RecordExport = File::new(&file).read_json().await?;
            let report = orchestrator.import_records(export, replace).await?;
            for domain in &report.imported {
                println!("{} {}", "imported".green(), domain);
            }
            for domain in &report.skipped {
                println!("{} {} (exists, use --replace)", "skipped".dimmed(), domain);
            }
            for (domain, reason) in &report.failed {
                println!("{} {}: {}", "failed".red(), domain, reason);
            }
            if !report.imported.is_empty() {
                println!("Run `webmgr update --domain <domain>` to deploy imported applications");
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} record(s) could not be imported", report.failed.len());
            }
        }
        Commands::Diagnose { domain } => {
            let findings = diagnose(&orchestrator, domain.as_deref()).await?;
            let failed = findings.iter().filter(|f| !f.ok).count();
            for finding in &findings {
                let mark = if finding.ok { "ok".green() } else { "!!".red() };
                println!("{} {:<20} {}", mark, finding.check, finding.detail);
                if let Some(hint) = &finding.hint {
                    println!("   {} {}", "hint:".dimmed(), hint);
                }
            }
            if failed > 0 {
                anyhow::bail!("{} check(s) failed", failed);
            }
        }
        Commands::Version | Commands::Types => {}
    }
    Ok(())
}

fn print_summary(verb: &str, summary: &DeploySummary) {
    let Some(record) = &summary.record else {
        return;
    };
    println!("{} {} {}", "ok".green().bold(), record.domain.bold(), verb);
    println!("  url:    {}", record.url());
    println!("  type:   {}", record.app_type);
    println!("  port:   {}", record.port);
    match &record.commit {
        Some(commit) => println!("  branch: {} ({})", record.deployed_branch(), commit),
        None => println!("  branch: {}", record.deployed_branch()),
    }
    println!("  path:   {}", record.working_dir.display());
    print_warnings(summary.warnings());
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
}

fn print_report(report: &AppReport) {
    let record = &report.record;
    println!("{} ({})", record.domain.bold(), record.app_type);
    println!("  state:       {}", colored_state(report.run_state));
    println!("  status:      {}", record.status);
    println!("  port:        {}", record.port);
    println!("  branch:      {}", record.deployed_branch());
    println!("  path:        {}", record.working_dir.display());
    if record.ssl {
        println!("  tls:         {}", "on".green());
    }
    println!(
        "  site:        {}",
        match (report.site_installed, report.site_enabled) {
            (true, true) => "enabled",
            (true, false) => "installed, not enabled",
            _ => "missing",
        }
    );
    if report.in_maintenance {
        println!("  maintenance: {}", "on".yellow());
    }
    println!("  updated:     {}", record.last_updated.format("%Y-%m-%d %H:%M:%S"));
}

fn print_table(reports: &[AppReport]) {
    if reports.is_empty() {
        println!("No applications");
        return;
    }
    println!("{:<32} {:<8} {:<6} {:<10} {}", "DOMAIN", "TYPE", "PORT", "STATE", "BRANCH");
    for report in reports {
        let record = &report.record;
        let state = if report.in_maintenance {
            "maint".yellow()
        } else {
            colored_state(report.run_state)
        };
        println!(
            "{:<32} {:<8} {:<6} {:<10} {}",
            record.domain,
            record.app_type.as_str(),
            record.port,
            state,
            record.deployed_branch()
        );
    }
}

fn colored_state(state: RunState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        RunState::Active => text.green(),
        RunState::Activating => text.yellow(),
        RunState::Failed => text.red(),
        RunState::Inactive | RunState::Unknown => text.dimmed(),
    }
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    let Some(manager) = err.downcast_ref::<ManagerError>() else {
        error!("{:#}", err);
        eprintln!("{} {:#}", "error:".red().bold(), err);
        return ExitCode::FAILURE;
    };
    error!("{}", manager);

    match manager.as_deploy_failure() {
        Some(failure) => {
            eprintln!(
                "{} {} failed at step {} ({:?})",
                "error:".red().bold(),
                failure.domain.bold(),
                failure.step.to_string().bold(),
                failure.error.kind()
            );
            eprintln!("  {}", failure.error);
            if let Some(rollback) = &failure.rollback_error {
                eprintln!("  {} {}", "rollback:".red(), rollback);
            }
        }
        None => eprintln!("{} {}", "error:".red().bold(), manager),
    }

    if let Some(tail) = manager.output_tail().filter(|t| !t.is_empty()) {
        eprintln!("{}", "--- output ---".dimmed());
        for line in tail.lines() {
            eprintln!("  {}", line.dimmed());
        }
    }

    if manager.kind() == ErrorKind::Cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::FAILURE
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, cancelling...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, cancelling...");
                    }
                }
                return;
            }
            _ => warn!("Unable to install signal handlers, falling back to Ctrl+C"),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        // No signal source left; let the work run to completion
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, cancelling...");
}
