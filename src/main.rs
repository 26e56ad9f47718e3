use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dockmon::cli::{Cli, Commands};
use dockmon::core::{Container, Diagnostics, DockerCommand, Service};
use dockmon::utils::{
    format_bytes, format_duration, format_percent, seconds_since, truncate_string, AppConfig,
    UserConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    init_logging(&config.log_level);

    match cli.command {
        None => {
            handle_ps(&config, cli.project_dir, false, false).await?;
        }
        Some(Commands::Ps { all, exited }) => {
            handle_ps(&config, cli.project_dir, all, exited).await?;
        }
        Some(Commands::Stats { duration }) => {
            handle_stats(&config, cli.project_dir, duration).await?;
        }
        Some(Commands::ComposeConfig) => {
            handle_compose_config(&config, cli.project_dir).await?;
        }
        Some(Commands::Config { path, init }) => {
            handle_config(&config, path, init)?;
        }
    }

    Ok(())
}

/// Log to stderr; RUST_LOG wins over the configured level
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn connect(config: &UserConfig, project_dir: Option<PathBuf>, diagnostics: Diagnostics) -> Result<DockerCommand> {
    DockerCommand::connect(config, project_dir, diagnostics)
        .await
        .context("Failed to connect to Docker daemon. Is Docker running?")
}

async fn handle_ps(config: &UserConfig, project_dir: Option<PathBuf>, all: bool, exited: bool) -> Result<()> {
    let docker = connect(config, project_dir, Diagnostics::log_only()).await?;
    if all {
        docker.set_show_all_containers(true);
    }
    if exited {
        docker.set_show_exited(true);
    }

    let (containers, services) = docker.refresh(None).await?;
    docker.update_details().await;

    if !services.is_empty() {
        println!("{}\n", "Services".bold());
        println!("{:<25} {:<30} {:<12}", "Service", "Container", "State");
        println!("{}", "-".repeat(70));
        for service in &services {
            print_service(service);
        }
        println!();
    }

    println!("{}\n", "Containers".bold());
    println!(
        "{:<30} {:<12} {:<20} {:<30}",
        "Name", "State", "Project", "Image"
    );
    println!("{}", "-".repeat(95));
    for container in &containers {
        let image = container
            .details()
            .and_then(|d| d.config)
            .and_then(|c| c.image)
            .unwrap_or_else(|| "-".to_string());
        let state = container.state();
        println!(
            "{:<30} {:<12} {:<20} {:<30}",
            truncate_string(&container.name(), 30),
            state.as_str().color(state.color()),
            truncate_string(&container.project_name(), 20),
            truncate_string(&image, 30)
        );
    }

    if containers.is_empty() {
        println!("{}", "No containers to show".dimmed());
    }

    Ok(())
}

fn print_service(service: &Service) {
    match service.container() {
        Some(container) => {
            let state = container.state();
            println!(
                "{:<25} {:<30} {:<12}",
                truncate_string(service.name(), 25),
                truncate_string(&container.name(), 30),
                state.as_str().color(state.color())
            );
        }
        None => println!(
            "{:<25} {:<30} {:<12}",
            truncate_string(service.name(), 25),
            "-",
            "not created".dimmed()
        ),
    }
}

async fn handle_stats(config: &UserConfig, project_dir: Option<PathBuf>, duration: Option<u64>) -> Result<()> {
    let (diagnostics, mut errors) = Diagnostics::channel();
    let docker = Arc::new(connect(config, project_dir, diagnostics).await?);
    docker.refresh(None).await?;

    let cancel = CancellationToken::new();
    let monitoring = docker.start_monitoring(cancel.clone());

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(config.refresh_interval());
    let mut error_count = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = &mut deadline => break,
            Some(_) = errors.recv() => error_count += 1,
            _ = ticker.tick() => {
                if let Err(e) = docker.refresh(None).await {
                    eprintln!("{} {}", "Refresh failed:".red(), e);
                }
                print_stats(&docker.containers().await, error_count);
            }
        }
    }

    cancel.cancel();
    monitoring.await.context("Stats monitoring task failed")?;
    Ok(())
}

fn print_stats(containers: &[Arc<Container>], error_count: usize) {
    println!(
        "\n{:<30} {:>9} {:>9} {:>22} {:>22} {:>8} {:>10}",
        "Name", "CPU", "Memory", "Usage / Limit", "Net RX / TX", "Samples", "Updated"
    );
    println!("{}", "-".repeat(118));

    for container in containers.iter().filter(|c| c.state().is_running()) {
        let history = container.stats();
        let Some(latest) = history.latest() else {
            println!("{:<30} {:>9}", truncate_string(&container.name(), 30), "-".dimmed());
            continue;
        };

        let memory = &latest.client_stats.memory_stats;
        let (rx, tx) = latest.client_stats.network_totals();
        println!(
            "{:<30} {:>9} {:>9} {:>22} {:>22} {:>8} {:>10}",
            truncate_string(&container.name(), 30),
            format_percent(latest.derived_stats.cpu_percentage),
            format_percent(latest.derived_stats.memory_percentage),
            format!("{} / {}", format_bytes(memory.usage), format_bytes(memory.limit)),
            format!("{} / {}", format_bytes(rx), format_bytes(tx)),
            history.len(),
            format!("{} ago", format_duration(seconds_since(latest.recorded_at)))
        );
    }

    if error_count > 0 {
        println!("{}", format!("{} stats errors (see log)", error_count).yellow());
    }
}

async fn handle_compose_config(config: &UserConfig, project_dir: Option<PathBuf>) -> Result<()> {
    let docker = connect(config, project_dir, Diagnostics::log_only()).await?;
    print!("{}", docker.docker_compose_config().await);
    Ok(())
}

fn handle_config(config: &UserConfig, path: bool, init: bool) -> Result<()> {
    let config_path = AppConfig::config_path()?;

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        AppConfig::save_to(config, &config_path)?;
        println!("{} {}", "Config written to".green(), config_path.display());
        return Ok(());
    }

    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    println!("# {}\n", config_path.display().to_string().dimmed());
    println!("{}", contents);
    Ok(())
}
