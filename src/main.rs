//! CloudNet - Cluster communication node
//!
//! Runs a node, or connects to one to send messages, queries and files.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloudnet::chunk::{AssembledData, ChunkSessionInformation, ChunkedPacketSender, TransferCallback};
use cloudnet::config::{self, Config};
use cloudnet::messaging::{ChannelMessage, ChannelMessageListener, ChannelMessageTarget};
use cloudnet::network::NetworkChannel;
use cloudnet::node::Node;
use cloudnet::protocol;

/// Transfer channel used for file deployment
const DEPLOY_FILE_TRANSFER: &str = "deploy_file";

/// CloudNet - Cluster communication node
#[derive(Parser)]
#[command(name = "cloudnet")]
#[command(author = "CloudNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run a cluster node or talk to one", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Node {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Node name to announce
        #[arg(short, long)]
        name: Option<String>,

        /// Directory for received files
        #[arg(short, long, default_value = "received")]
        output: PathBuf,

        /// Disable TLS
        #[arg(long)]
        no_tls: bool,
    },

    /// Send a channel message
    Send {
        #[command(flatten)]
        remote: RemoteArgs,

        #[command(flatten)]
        message: MessageArgs,
    },

    /// Send a channel message as query and print the replies
    Query {
        #[command(flatten)]
        remote: RemoteArgs,

        #[command(flatten)]
        message: MessageArgs,

        /// Return after the first reply
        #[arg(long)]
        single: bool,

        /// Reply timeout in ms (default from configuration)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send a file as chunked transfer
    SendFile {
        #[command(flatten)]
        remote: RemoteArgs,

        /// File to send
        path: PathBuf,

        /// Chunk size in bytes (default from configuration)
        #[arg(long)]
        chunk_size: Option<u32>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Node to connect to (host or host:port)
    #[arg(short, long)]
    server: String,

    /// Port used when the server has none
    #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
    port: u16,
}

#[derive(clap::Args)]
struct MessageArgs {
    /// Targets: all, node[:name], service[:name], task:name, group:name, environment:name
    #[arg(short, long = "target", default_value = "all")]
    targets: Vec<ChannelMessageTarget>,

    /// Message channel name
    #[arg(long)]
    channel: String,

    /// Message verb
    #[arg(short, long)]
    message: String,

    /// Message content as text
    #[arg(long, default_value = "")]
    content: String,

    /// Send ahead of bulk traffic
    #[arg(long)]
    prioritized: bool,
}

impl MessageArgs {
    fn build(&self, node: &Node) -> anyhow::Result<ChannelMessage> {
        let message = node.messenger().build(
            ChannelMessage::builder()
                .channel(&self.channel)
                .message(&self.message)
                .content(Bytes::from(self.content.clone()))
                .targets(self.targets.iter().cloned())
                .prioritized(self.prioritized),
        )?;
        Ok(message)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose || config.general.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    match cli.command {
        Commands::Node {
            port,
            name,
            output,
            no_tls,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(name) = name {
                config.general.node_name = name;
            }
            if no_tls {
                config.security.use_tls = false;
            }
            run_node(config, output).await?;
        }
        Commands::Send { remote, message } => {
            let (mut node, _channel) = connect(&config, &remote).await?;
            let message = message.build(&node)?;
            let delivered = node.messenger().send(&message).await?;
            println!("Message sent to {} destination(s)", delivered);
            node.stop().await;
        }
        Commands::Query {
            remote,
            message,
            single,
            timeout,
        } => {
            let (mut node, _channel) = connect(&config, &remote).await?;
            let timeout = timeout.map(Duration::from_millis).unwrap_or_else(|| node.query_timeout());
            let message = message.build(&node)?;

            let replies = if single {
                node.messenger()
                    .send_single_query(&message, timeout)
                    .await?
                    .into_iter()
                    .collect()
            } else {
                node.messenger().send_query(&message, timeout).await?
            };

            if replies.is_empty() {
                println!("No replies within {:?}", timeout);
            }
            for reply in replies {
                println!("{}: {}", reply.sender(), String::from_utf8_lossy(reply.content()));
            }
            node.stop().await;
        }
        Commands::SendFile {
            remote,
            path,
            chunk_size,
        } => {
            let (mut node, channel) = connect(&config, &remote).await?;
            send_file(&config, &channel, &path, chunk_size).await?;
            node.stop().await;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Prints inbound messages and answers `ping`
struct ConsoleListener {
    name: String,
}

#[async_trait]
impl ChannelMessageListener for ConsoleListener {
    async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<Option<Bytes>> {
        println!(
            "[{}] {} {}: {}",
            message.sender(),
            message.channel(),
            message.message(),
            String::from_utf8_lossy(message.content())
        );
        if message.message() == "ping" {
            return Ok(Some(Bytes::from(format!("pong from {}", self.name))));
        }
        Ok(None)
    }
}

/// Stores deployed files in a directory
struct FileStore {
    directory: PathBuf,
}

#[async_trait]
impl TransferCallback for FileStore {
    async fn on_complete(&self, info: &ChunkSessionInformation, mut data: AssembledData) -> anyhow::Result<()> {
        let requested = String::from_utf8_lossy(&info.extra_data).to_string();
        // Only the final path component is trusted
        let name = Path::new(&requested)
            .file_name()
            .map(|name| name.to_owned())
            .unwrap_or_else(|| info.session_id.to_string().into());
        let path = self.directory.join(name);

        tokio::fs::create_dir_all(&self.directory).await?;
        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut data, &mut file).await?;
        tracing::info!(path = %path.display(), bytes = written, "file received");
        println!("Received {} ({} bytes)", path.display(), written);
        Ok(())
    }
}

/// Run a node until Ctrl+C
async fn run_node(config: Config, output: PathBuf) -> anyhow::Result<()> {
    let mut node = Node::new(&config)?;
    node.messenger().add_listener(Arc::new(ConsoleListener {
        name: config.general.node_name.clone(),
    }));
    node.transfers()
        .register_callback(DEPLOY_FILE_TRANSFER, Arc::new(FileStore { directory: output.clone() }));

    let addr = node.start().await?;

    println!("\n========================================");
    println!("  CloudNet Node Running");
    println!("========================================");
    println!("  Name: {}", config.general.node_name);
    println!("  Address: {}", addr);
    println!("  TLS: {}", config.security.use_tls);
    println!("  Files: {}", output.display());
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    node.stop().await;

    Ok(())
}

/// Start a client-only node and connect it to a remote node
async fn connect(config: &Config, remote: &RemoteArgs) -> anyhow::Result<(Node, NetworkChannel)> {
    // A distinct name keeps the remote node from mistaking us for itself
    let mut config = config.clone();
    config.general.node_name = format!("{}-cli-{}", config.general.node_name, std::process::id());
    let node = Node::new(&config)?;

    let (channel, peer) = if remote.server.contains(':') {
        let addr: SocketAddr = remote.server.parse()?;
        node.connect(addr).await?
    } else {
        node.connect_hostname(&remote.server, remote.port).await?
    };
    tracing::info!(peer = %peer.name(), remote = %channel.remote_addr(), "connected");

    Ok((node, channel))
}

/// Send a file and wait until the peer has read every chunk
async fn send_file(
    config: &Config,
    channel: &NetworkChannel,
    path: &Path,
    chunk_size: Option<u32>,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let summary = ChunkedPacketSender::for_channel(DEPLOY_FILE_TRANSFER)
        .chunk_size(chunk_size.unwrap_or(config.transfer.chunk_size))
        .extra_data(Bytes::from(name))
        .source(file)
        .transfer(std::slice::from_ref(channel))
        .await?;

    channel.flush(config.network_config().query_timeout).await?;
    println!(
        "Sent {} ({} bytes in {} chunks, session {})",
        path.display(),
        summary.bytes,
        summary.chunks,
        summary.session_id
    );
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("CloudNet Protocol Information");
    println!("=============================\n");

    println!("Node name: {}", config.general.node_name);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("Max frame size: {} bytes", protocol::MAX_FRAME_SIZE);
    println!("Chunk size: {} bytes", config.transfer.chunk_size);

    println!("\nReserved transport channels:");
    println!("  {:>3}  query responses", protocol::QUERY_RESPONSE_CHANNEL);
    println!("  {:>3}  channel messages", protocol::CHANNEL_MESSAGE_CHANNEL);
    println!("  {:>3}  chunked transfers", protocol::CHUNKED_TRANSFER_CHANNEL);
    println!("  {:>3}  keepalive", protocol::KEEPALIVE_CHANNEL);
    println!("  {:>3}  identity", protocol::IDENTITY_CHANNEL);
    println!("  first user channel: {}", protocol::FIRST_USER_CHANNEL);

    if let Some(dir) = dirs::config_dir() {
        println!("\nConfig file: {}", dir.join("cloudnet/config.toml").display());
    }
}
