//! Yurt CLI

use std::path::PathBuf;
use std::process::Command;

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use yurt_lxd::config::{default_config_dir, port_value};
use yurt_lxd::images::list_remote_images;
use yurt_lxd::{
    CancelToken, ClientHandle, Error, JsonConfigStore, Key, Orchestrator, Remote,
    ResourceBootstrap, SshShell, TerminalAttach, VmShell, YurtConfig,
};

#[derive(Parser)]
#[command(name = "yurt")]
#[command(about = "Manage LXD containers running in the yurt VM", long_about = None)]
struct Cli {
    /// Directory holding the VM's provisioning assets
    #[arg(long, default_value = "provision")]
    provision_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List instances
    List,
    /// Show an instance's details
    Info { name: String },
    /// Launch an instance from `<remote>:<image>`
    Launch {
        /// e.g. images:alpine/3.12 or ubuntu:20.04
        image: String,
        name: String,
    },
    /// Start instances
    Start {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Stop instances
    Stop {
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(short, long)]
        force: bool,
    },
    /// Delete instances
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
        /// Stop running instances first
        #[arg(short, long)]
        force: bool,
    },
    /// Run a command in an instance
    Exec {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Open a root shell in an instance
    Shell { name: String },
    /// List images
    Images {
        /// Remote to list instead of the local cache
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// List image remotes
    Remotes,
}

/// Bridges the exec websocket to this terminal with `websocat`
struct WebsocatTerminal;

impl TerminalAttach for WebsocatTerminal {
    fn attach(&self, stream_url: &str, _control_url: &str) -> yurt_lxd::Result<()> {
        let status = Command::new("websocat")
            .args(["--binary", "--exit-on-eof", stream_url])
            .status()
            .map_err(|e| Error::Command(format!("could not run websocat: {}", e)))?;
        if !status.success() {
            return Err(Error::Command(format!("websocat exited with {:?}", status.code())));
        }
        Ok(())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("yurt=info,yurt_lxd=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();

    let config = YurtConfig::builder()
        .provision_dir(cli.provision_dir)
        .build_validated()?;
    let store = JsonConfigStore::in_dir(default_config_dir()?);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if !handler_token.interrupt() {
            std::process::exit(130);
        }
    })?;

    let port = port_value(&store, Key::LxdPort)?;
    let api = ClientHandle::new(port);

    if let Commands::Images { remote: Some(remote) } = &cli.command {
        let remote: Remote = remote.parse()?;
        let shell = ssh_shell(&store, &config)?;
        return cmd_remote_images(&shell, remote);
    }

    let shell = ssh_shell(&store, &config)?;
    ResourceBootstrap::new(&shell, &store, &config).configure(&api)?;

    let orchestrator = Orchestrator::new(&api, port)
        .profile(config.profile_name.clone())
        .cancel_token(cancel);

    match cli.command {
        Commands::List => {
            let records = orchestrator.list()?;
            println!("{:<20} {:<10} {:<16} {}", "NAME", "STATUS", "IP ADDRESS", "IMAGE");
            for r in records {
                println!("{:<20} {:<10} {:<16} {}", r.name, r.status, r.ip_address, r.image);
            }
        }
        Commands::Info { name } => {
            let instance = orchestrator.info(&name)?;
            let record = yurt_lxd::InstanceRecord::from(&instance);
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Launch { image, name } => {
            let (remote, alias) = image.split_once(':').ok_or_else(|| {
                Error::Configuration(format!("expected <remote>:<image>, got '{}'", image))
            })?;
            orchestrator.launch(remote, alias, &name)?;
        }
        Commands::Start { names } => orchestrator.start(&names)?,
        Commands::Stop { names, force } => orchestrator.stop(&names, force)?,
        Commands::Delete { names, force } => orchestrator.delete(&names, force)?,
        Commands::Exec { name, command } => orchestrator.exec(&name, &command, &WebsocatTerminal)?,
        Commands::Shell { name } => orchestrator.shell(&name, &WebsocatTerminal)?,
        Commands::Images { .. } => {
            print_images(&orchestrator.cached_images()?);
        }
        Commands::Remotes => {
            println!("{:<10} {}", "NAME", "URL");
            for remote in orchestrator.remotes() {
                println!("{:<10} {}", remote.name(), remote.url());
            }
        }
    }

    Ok(())
}

fn ssh_shell(store: &JsonConfigStore, config: &YurtConfig) -> yurt_lxd::Result<SshShell> {
    let port = port_value(store, Key::SshPort)?;
    let known_hosts = store
        .path()
        .parent()
        .map(|dir| dir.join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from("known_hosts"));
    Ok(SshShell::new(port, config.vm_user.clone())
        .identity(config.ssh_key_path())
        .known_hosts(known_hosts))
}

/// Remote catalogs are listed from inside the VM, which has the `lxc` client
fn cmd_remote_images(shell: &dyn VmShell, remote: Remote) -> Result<(), Box<dyn std::error::Error>> {
    let output = shell.run(
        &format!("lxc image list {}: --format json", remote.name()),
        None,
        true,
    )?;
    print_images(&list_remote_images(remote, &output.stdout)?);
    Ok(())
}

fn print_images(images: &[yurt_lxd::ImageRecord]) {
    println!("{:<28} {}", "ALIAS", "DESCRIPTION");
    for image in images {
        println!("{:<28} {}", image.alias, image.description);
    }
}
