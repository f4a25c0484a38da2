use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "opal")]
#[command(about = "Opal CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and an empty user store).
    Init {
        /// Config file path (default: OPAL_CONFIG_PATH or ~/.opal/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bot on every configured channel (Slack, Messenger, web) behind one HTTP port.
    Run {
        /// Config file path (default: OPAL_CONFIG_PATH or ~/.opal/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 4000)
        #[arg(long, short)]
        port: Option<u16>,

        /// Enable the browser chat at /chat/messages
        #[arg(long)]
        web: bool,

        /// Also chat on this terminal
        #[arg(long)]
        terminal: bool,
    },

    /// Chat with the bot on this terminal only (no server).
    Terminal {
        /// Config file path (default: OPAL_CONFIG_PATH or ~/.opal/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("opal {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            port,
            web,
            terminal,
        }) => {
            if let Err(e) = run_server(config, port, web, terminal).await {
                log::error!("server failed: {:#}", e);
                std::process::exit(1);
            }
            // A pending stdin read would otherwise hold the runtime open.
            std::process::exit(0);
        }
        Some(Commands::Terminal { config }) => {
            if let Err(e) = run_terminal(config).await {
                log::error!("terminal failed: {:#}", e);
                std::process::exit(1);
            }
            std::process::exit(0);
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(opal::config::default_config_path);
    let dir = opal::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_server(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    web: bool,
    terminal: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = opal::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    if web {
        config.channels.web.enabled = true;
    }
    if terminal {
        config.channels.terminal.enabled = true;
    }
    log::info!(
        "starting server on {}:{}",
        config.server.bind,
        config.server.port
    );
    opal::gateway::run_server(config, path).await
}

async fn run_terminal(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = opal::config::load_config(config_path)?;
    opal::gateway::run_terminal(config, path).await
}
