use anyhow::{anyhow, Context, Result};
use apmanager::bus::Detached;
use apmanager::claims::InterfaceClaimManager;
use apmanager::config::{default_config_path, load_config, DaemonConfig};
use apmanager::dhcp::DnsmasqServerFactory;
use apmanager::firewall::FirewallManager;
use apmanager::manager::Manager;
use apmanager::process::{OsProcessFactory, ProcessFactory};
use apmanager::resource_guard::PidFileGuard;
use apmanager::service::{Resources, ServiceEnv};
use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "apmanager", about = "Access point manager daemon")]
struct Args {
    #[arg(long, env = "APMANAGER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    run_dir: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    if let Some(run_dir) = args.run_dir {
        config.run_dir = run_dir;
    }
    info!(config = %config_path.display(), "configuration loaded");

    run_daemon(config).await
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        return;
    }

    let _ = tokio::signal::ctrl_c().await;
}

fn build_manager(config: &DaemonConfig) -> Manager {
    let paths = config.paths();
    let process_factory: Rc<dyn ProcessFactory> = Rc::new(OsProcessFactory);
    let dhcp_factory = DnsmasqServerFactory {
        paths: paths.clone(),
        dnsmasq_path: config.dnsmasq_path.clone(),
        ip_path: config.ip_path.clone(),
        termination_timeout: config.termination_timeout(),
        process_factory: Rc::clone(&process_factory),
    };
    let env = ServiceEnv {
        paths,
        hostapd_path: config.hostapd_path.clone(),
        termination_timeout: config.termination_timeout(),
        process_factory,
        dhcp_factory: Rc::new(dhcp_factory),
    };
    // No bus transport is wired into this binary; both remote services
    // report as absent, which leaves local bookkeeping fully functional.
    let resources = Resources {
        firewall: FirewallManager::new(Box::new(Detached)),
        claims: InterfaceClaimManager::new(Box::new(Detached)),
    };
    Manager::new(resources, env)
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let pid_path = config.pid_file();
    let _pid_guard = PidFileGuard::acquire(&pid_path)?.ok_or_else(|| {
        anyhow!(
            "another apmanager instance is running (pid file {})",
            pid_path.display()
        )
    })?;

    let mut manager = build_manager(&config);
    for ap in &config.access_points {
        let autostart = ap.autostart;
        let interface = ap.interface.clone();
        let id = manager.create_service(ap.clone());
        if !autostart {
            continue;
        }
        if let Err(err) = manager
            .start_service(id)
            .with_context(|| format!("failed to start access point on {}", interface))
        {
            error!("{:#}", err);
        }
    }

    info!(services = config.access_points.len(), "daemon running");
    let mut shutdown = Box::pin(wait_for_shutdown_signal());
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping daemon");
                break;
            }
            _ = ticker.tick() => {
                // A hostapd exit triggers a bounded, blocking teardown.
                tokio::task::block_in_place(|| manager.poll());
            }
        }
    }

    tokio::task::block_in_place(|| manager.stop_all());
    if manager.services().any(|service| service.holds_resources()) {
        warn!("some services still hold resources at exit");
    }
    info!("daemon stopped");
    Ok(())
}
