//! trustd - Trust broker daemons
//!
//! `trustd stub` relays caller requests, `trustd skeleton` decides them.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trustd_core::Paths;

use trustd::config::{BusScope, DaemonConfig, Endpoint, LocalAgentKind, RemoteAgentKind, SkeletonConfig, StubConfig};
use trustd::daemon::{ShutdownSignal, Skeleton, Stub};
use trustd::request::TrustRequest;
use trustd::store::StoreClient;
use trustd::transport::UnixChannel;

/// How long blocked I/O (a stdin read) may hold up process exit
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// trustd - Trust broker daemons
#[derive(Parser)]
#[command(name = "trustd")]
#[command(version)]
#[command(about = "Relays permission requests from untrusted callers to a trusted decider")]
#[command(long_about = "Relays permission requests from untrusted callers to a trusted decider.\n\n\
    A stub reads \"<pid> <uid> <feature>\" lines and answers each with\n\
    \"granted\" or \"denied\". It forwards every request to a skeleton, which\n\
    answers from its trust store or asks a local agent.")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Selection of the stub <-> skeleton binding
#[derive(Args)]
struct RemoteArgs {
    /// Service the requests are about
    #[arg(long = "for-service")]
    service: String,

    /// Transport between stub and skeleton
    #[arg(long, value_enum)]
    remote_agent: RemoteAgentKind,

    /// Socket path (local-socket binding)
    #[arg(long)]
    endpoint: Option<PathBuf>,

    /// Bus to use (bus binding)
    #[arg(long, value_enum)]
    bus: Option<BusScope>,

    /// Well-known name of the stub (bus binding)
    #[arg(long)]
    bus_name: Option<String>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl RemoteArgs {
    fn load(&self, paths: &Paths) -> Result<(DaemonConfig, Endpoint)> {
        let config = match &self.config {
            Some(path) => DaemonConfig::load_from(path)?,
            None => DaemonConfig::load(paths)?,
        };

        let endpoint = Endpoint::resolve(
            self.remote_agent,
            &self.service,
            self.endpoint.clone(),
            self.bus,
            self.bus_name.clone(),
            paths,
        );

        Ok((config, endpoint))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Accept caller requests and relay them to a skeleton
    Stub {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Also accept callers on this socket
        #[arg(long)]
        caller_endpoint: Option<PathBuf>,

        /// Restrict socket endpoints to the owning user
        #[arg(long)]
        private_endpoint: bool,

        /// Do not treat stdin/stdout as a caller
        #[arg(long)]
        no_stdio: bool,

        /// How long to wait for a skeleton's answer
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Decide relayed requests from the store or a local agent
    Skeleton {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Policy consulted when the store has no verdict
        #[arg(long, value_enum)]
        local_agent: LocalAgentKind,

        /// Prompt command for the interactive agent
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        prompt_command: Option<Vec<String>>,

        /// How long the prompt may take
        #[arg(long)]
        prompt_timeout_ms: Option<u64>,

        /// Expose the trust store on this bus
        #[arg(long, value_enum)]
        store_bus: Option<BusScope>,

        /// Trust store database
        #[arg(long, conflicts_with = "memory_store")]
        store_path: Option<PathBuf>,

        /// Keep verdicts in memory only
        #[arg(long)]
        memory_store: bool,

        /// How long to keep trying to reach the stub at startup
        #[arg(long)]
        connect_timeout_ms: Option<u64>,
    },

    /// Send one request to a stub's caller socket and print the answer
    Ask {
        pid: u32,
        uid: u32,
        feature: u64,

        /// The stub's caller socket
        #[arg(long)]
        endpoint: PathBuf,
    },

    /// Inspect a skeleton's trust store
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List every verdict of a service
    List {
        #[command(flatten)]
        target: StoreArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Look up one verdict
    Lookup {
        #[command(flatten)]
        target: StoreArgs,

        uid: u32,
        feature: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct StoreArgs {
    /// Service whose store to query
    #[arg(long = "for-service")]
    service: String,

    /// Bus the store is exposed on
    #[arg(long, value_enum, default_value = "session")]
    store_bus: BusScope,
}

fn main() -> Result<()> {
    // stdout may be a caller channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    let result = runtime.block_on(run(cli));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Stub {
            remote,
            caller_endpoint,
            private_endpoint,
            no_stdio,
            timeout_ms,
        } => cmd_stub(remote, caller_endpoint, private_endpoint, no_stdio, timeout_ms).await,
        Commands::Skeleton {
            remote,
            local_agent,
            prompt_command,
            prompt_timeout_ms,
            store_bus,
            store_path,
            memory_store,
            connect_timeout_ms,
        } => {
            cmd_skeleton(
                remote,
                local_agent,
                prompt_command,
                prompt_timeout_ms,
                store_bus,
                store_path,
                memory_store,
                connect_timeout_ms,
            )
            .await
        }
        Commands::Ask {
            pid,
            uid,
            feature,
            endpoint,
        } => cmd_ask(TrustRequest::new(pid, uid, feature), endpoint).await,
        Commands::Store { command } => match command {
            StoreCommands::List { target, json } => cmd_store_list(target, json).await,
            StoreCommands::Lookup {
                target,
                uid,
                feature,
                json,
            } => cmd_store_lookup(target, uid, feature, json).await,
        },
    }
}

async fn cmd_stub(
    remote: RemoteArgs,
    caller_endpoint: Option<PathBuf>,
    private_endpoint: bool,
    no_stdio: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let shutdown = ShutdownSignal::install()
        .context("Failed to install signal handlers")?
        .into_token();

    let paths = Paths::new();
    let (config, endpoint) = remote.load(&paths)?;

    let mut stub_config = StubConfig::new(remote.service, endpoint, &config);
    stub_config.caller_endpoint = caller_endpoint;
    stub_config.private_endpoints = private_endpoint;
    stub_config.stdio_caller = !no_stdio;
    if let Some(ms) = timeout_ms {
        stub_config.request_timeout = Duration::from_millis(ms);
    }

    Stub::bind(stub_config).await?.run(shutdown).await
}

#[allow(clippy::too_many_arguments)]
async fn cmd_skeleton(
    remote: RemoteArgs,
    local_agent: LocalAgentKind,
    prompt_command: Option<Vec<String>>,
    prompt_timeout_ms: Option<u64>,
    store_bus: Option<BusScope>,
    store_path: Option<PathBuf>,
    memory_store: bool,
    connect_timeout_ms: Option<u64>,
) -> Result<()> {
    let shutdown = ShutdownSignal::install()
        .context("Failed to install signal handlers")?
        .into_token();

    let paths = Paths::new();
    let (config, endpoint) = remote.load(&paths)?;

    let mut skeleton_config = SkeletonConfig::new(remote.service.clone(), endpoint, local_agent, &config);
    if let Some(command) = prompt_command {
        skeleton_config.prompt.command = command;
    }
    if let Some(ms) = prompt_timeout_ms {
        skeleton_config.prompt.timeout_ms = ms;
    }
    if let Some(ms) = connect_timeout_ms {
        skeleton_config.connect_timeout = Duration::from_millis(ms);
    }
    skeleton_config.store_bus = store_bus;
    skeleton_config.store_path = if memory_store {
        None
    } else {
        Some(store_path.unwrap_or_else(|| config.store.path_for(&remote.service, &paths)))
    };

    Skeleton::start(skeleton_config).await?.run(shutdown).await
}

async fn cmd_ask(request: TrustRequest, endpoint: PathBuf) -> Result<()> {
    let mut channel = UnixChannel::connect(&endpoint, 64)
        .await
        .with_context(|| format!("Failed to reach the stub at {}", endpoint.display()))?;

    channel.send(&request.to_string()).await?;
    let answer = channel.receive().await.context("No answer from the stub")?;

    println!("{}", answer);
    Ok(())
}

async fn cmd_store_list(target: StoreArgs, json: bool) -> Result<()> {
    let client = StoreClient::connect(target.store_bus, &target.service).await?;
    let records = client
        .records()
        .await
        .with_context(|| format!("Failed to list the trust store of {}", target.service))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No verdicts stored for {}", target.service);
        return Ok(());
    }

    println!("{:<10} {:<20} {:<8} DECIDED", "UID", "FEATURE", "ANSWER");
    println!("{}", "-".repeat(70));
    for record in &records {
        println!(
            "{:<10} {:<20} {:<8} {}",
            record.uid,
            record.feature,
            record.answer,
            record.decided_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("{} verdicts", records.len());

    Ok(())
}

async fn cmd_store_lookup(target: StoreArgs, uid: u32, feature: u64, json: bool) -> Result<()> {
    let client = StoreClient::connect(target.store_bus, &target.service).await?;
    let answer = client
        .lookup(uid, feature)
        .await
        .with_context(|| format!("Failed to query the trust store of {}", target.service))?;

    if json {
        let output = serde_json::json!({
            "service": target.service,
            "uid": uid,
            "feature": feature,
            "answer": answer,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match answer {
        Some(answer) => println!("{}", answer),
        None => println!("unknown"),
    }

    Ok(())
}
