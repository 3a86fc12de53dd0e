use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vmforge::hooks::HookRegistry;
use vmforge::inventory::JsonInventory;
use vmforge::net::{InquirePrompt, NetworkPrompt, StrictPrompt};
use vmforge::policy::{self, FailurePolicy, InteractivePolicy, StrictPolicy};
use vmforge::remote::SshTransport;
use vmforge::{BuildOptions, Builder};

#[derive(Parser)]
#[command(name = "vmforge", version, about = "Provision virtual machines onto hypervisors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a virtual machine on its assigned hypervisor.
    Build(BuildArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Hostname of the guest to build.
    hostname: String,

    /// Base image to deploy instead of the OS-family default.
    #[arg(long)]
    image: Option<String>,

    /// Skip the configuration-management run in the staged tree.
    #[arg(long)]
    no_config_management: bool,

    /// Script to install into the guest and run after first boot.
    #[arg(long)]
    postboot: Option<PathBuf>,

    /// Inventory snapshot to resolve servers and ranges from.
    #[arg(long, env = "VMFORGE_INVENTORY", default_value = "/etc/vmforge/inventory.json")]
    inventory: PathBuf,

    /// DNS resolvers written into the guest.
    #[arg(long = "dns")]
    dns_servers: Vec<Ipv4Addr>,

    /// Base URL images are downloaded from.
    #[arg(long, env = "VMFORGE_IMAGE_URL", default_value = "http://images.vmforge.local/base")]
    image_url: String,

    /// Seconds to wait for the guest to come up after start.
    #[arg(long, default_value_t = 300)]
    boot_timeout: u64,

    /// Never prompt: decline fallbacks and abort on failure.
    #[arg(long)]
    non_interactive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Build(args) => build(args).await,
    }
}

async fn build(args: BuildArgs) -> anyhow::Result<()> {
    let inventory = JsonInventory::load(&args.inventory)
        .await
        .context("loading inventory snapshot")?;

    let mut options = BuildOptions::new(args.hostname);
    options.image = args.image;
    options.run_config_management = !args.no_config_management;
    options.postboot_script = args.postboot;
    options.dns_servers = args.dns_servers;
    options.image_base_url = args.image_url;
    options.boot_timeout = Duration::from_secs(args.boot_timeout);

    let prompt: Arc<dyn NetworkPrompt> = if args.non_interactive {
        Arc::new(StrictPrompt)
    } else {
        Arc::new(InquirePrompt::new())
    };
    let policy: Box<dyn FailurePolicy> = if args.non_interactive {
        Box::new(StrictPolicy)
    } else {
        Box::new(InteractivePolicy)
    };

    // Hooks are registered here, before the build starts; the registry is
    // read-only while the pipeline runs.
    let hooks = Arc::new(HookRegistry::new());

    let builder = Builder::new(
        Arc::new(inventory),
        Arc::new(SshTransport::new()),
        hooks,
        prompt,
        options,
    );

    let result = builder.build().await.map(|_| ());
    policy::guard_build(policy.as_ref(), result).await?;
    Ok(())
}
