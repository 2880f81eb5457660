use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use waydroid_container::lxc::AttachOptions;
use waydroid_container::{ContainerManager, dbus, lxc};
use waydroid_core::{Config, Paths};
use waydroid_init::initializer::InitOptions;
use waydroid_init::{CancelToken, initializer, upgrader};
use waydroid_sandbox::drivers;
use waydroid_session::ipc::ContainerManagerProxy;
use waydroid_session::{SessionManager, SessionOptions};

#[derive(Parser)]
#[command(name = "waydroid")]
#[command(about = "Android in a container", long_about = None)]
struct Cli {
    /// Work directory holding images, configs and the rootfs mount point
    #[arg(short, long, default_value = waydroid_core::config::DEFAULT_WORK_DIR)]
    work: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download images and set up the configuration
    Init {
        /// Re-run even when already initialized
        #[arg(short, long)]
        force: bool,
        /// Use images from this directory instead of downloading
        #[arg(short, long)]
        images_path: Option<PathBuf>,
        #[arg(short, long)]
        system_channel: Option<String>,
        #[arg(short, long)]
        vendor_channel: Option<String>,
        #[arg(short, long)]
        rom_type: Option<String>,
        #[arg(short = 't', long)]
        system_type: Option<String>,
    },
    /// Fetch new images and rewrite the synthesized configuration
    Upgrade {
        /// Skip image downloads, only rewrite configuration
        #[arg(short, long)]
        offline: bool,
    },
    /// Container lifecycle (privileged daemon and controls)
    #[command(subcommand)]
    Container(ContainerCommands),
    /// Per-user session
    #[command(subcommand)]
    Session(SessionCommands),
    /// Show container and session state
    Status,
    /// Run a shell (or a command) inside the container
    Shell {
        #[arg(short, long)]
        uid: Option<u32>,
        #[arg(short, long)]
        gid: Option<u32>,
        command: Vec<String>,
    },
    /// Follow the Android log
    Logcat,
    /// Android property access through the container manager
    #[command(subcommand)]
    Prop(PropCommands),
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Run the privileged container-manager service (foreground)
    Start,
    /// Stop the container and quit the tracked session
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start a session and wait for it to end (foreground)
    Start {
        /// Boot Android without bringing up the UI
        #[arg(short, long)]
        background: bool,
        /// Stop the session after this many seconds of inactivity
        #[arg(long)]
        idle_timeout: Option<u64>,
    },
    Stop,
}

#[derive(Subcommand)]
enum PropCommands {
    Get { key: String },
    Set { key: String, value: String },
}

fn require_root(action: &str) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("waydroid {action} must run as root");
    }
    Ok(())
}

/// The privileged daemon: claim the bus name, export the container manager
/// and the remote initializer, run the hardware service, serve until
/// signalled.
async fn serve_container(paths: Paths) -> Result<()> {
    require_root("container start")?;

    let status = lxc::status(&paths);
    if status != waydroid_core::ContainerStatus::Stopped {
        bail!("container is {status}");
    }

    let cfg = Config::load(&paths)?;
    if cfg.waydroid.vendor_type == "MAINLINE" {
        if let Err(err) = drivers::probe_binder_driver() {
            tracing::error!("failed to load binder driver: {err:#}");
        }
        drivers::probe_ashmem_driver();
    }
    let selection = waydroid_sandbox::DriverSelection::from_config(&cfg)?;

    let manager = Arc::new(Mutex::new(ContainerManager::new(paths.clone())));
    manager.lock().await.apply_device_permissions(&selection);

    let connection = dbus::connect(manager.clone()).await?;
    waydroid_init::remote::register(&connection, paths.clone()).await?;

    let hw_stop = Arc::new(AtomicBool::new(false));
    let hw_manager = manager.clone();
    let hw_flag = hw_stop.clone();
    let hardware = std::thread::Builder::new()
        .name("hardware".into())
        .spawn(move || waydroid_container::hardware::run(hw_manager, hw_flag))
        .context("failed to spawn hardware service")?;

    tracing::info!("container manager ready");
    let result = dbus::run(manager, connection).await;

    hw_stop.store(true, Ordering::Relaxed);
    if hardware.join().is_err() {
        tracing::warn!("hardware service thread panicked");
    }
    result
}

async fn container_proxy() -> Result<ContainerManagerProxy<'static>> {
    let connection = zbus::Connection::system()
        .await
        .context("failed to connect to the system bus")?;
    ContainerManagerProxy::new(&connection)
        .await
        .context("container manager is not listening")
}

async fn show_status(paths: &Paths) -> Result<()> {
    match container_proxy().await {
        Ok(proxy) => {
            let session = proxy.get_session().await.unwrap_or_default();
            match session.get("state") {
                Some(state) => {
                    println!("Session:\tRUNNING");
                    println!("Container:\t{state}");
                    if let Some(user) = session.get("user_name") {
                        println!("User:\t\t{user}");
                    }
                }
                None => {
                    println!("Session:\tSTOPPED");
                    println!("Container:\t{}", lxc::status(paths));
                }
            }
        }
        Err(_) => {
            println!("Session:\tSTOPPED");
            println!("Container:\t{}", lxc::status(paths));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let paths = Paths::new(cli.work);

    match cli.command {
        Commands::Init {
            force,
            images_path,
            system_channel,
            vendor_channel,
            rom_type,
            system_type,
        } => {
            require_root("init")?;
            let options = InitOptions {
                force,
                images_path,
                system_channel,
                vendor_channel,
                rom_type,
                system_type,
            };
            tokio::task::spawn_blocking(move || {
                initializer::init(&paths, &options, &CancelToken::new(), None)
            })
            .await??;
        }
        Commands::Upgrade { offline } => {
            require_root("upgrade")?;
            tokio::task::spawn_blocking(move || {
                upgrader::upgrade(&paths, offline, &CancelToken::new())
            })
            .await??;
        }
        Commands::Container(command) => match command {
            ContainerCommands::Start => serve_container(paths).await?,
            ContainerCommands::Stop => container_proxy().await?.stop(true).await?,
            ContainerCommands::Restart => container_proxy().await?.restart().await?,
            ContainerCommands::Freeze => container_proxy().await?.freeze().await?,
            ContainerCommands::Unfreeze => container_proxy().await?.unfreeze().await?,
        },
        Commands::Session(command) => match command {
            SessionCommands::Start { background, idle_timeout } => {
                let options = SessionOptions {
                    background,
                    idle_timeout: idle_timeout.map(Duration::from_secs),
                    unlocked_hook: None,
                };
                SessionManager::run(paths, options).await?;
            }
            SessionCommands::Stop => SessionManager::stop_remote().await?,
        },
        Commands::Status => show_status(&paths).await?,
        Commands::Shell { uid, gid, command } => {
            require_root("shell")?;
            let options = AttachOptions { uid, gid, ..Default::default() };
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            let argv = if argv.is_empty() { None } else { Some(argv.as_slice()) };
            lxc::shell(&paths, &options, argv)?;
        }
        Commands::Logcat => {
            require_root("logcat")?;
            lxc::logcat(&paths)?;
        }
        Commands::Prop(command) => match command {
            PropCommands::Get { key } => {
                println!("{}", container_proxy().await?.getprop(&key).await?);
            }
            PropCommands::Set { key, value } => {
                container_proxy().await?.setprop(&key, &value).await?;
            }
        },
    }
    Ok(())
}
