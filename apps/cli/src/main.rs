use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use prop_core::host::discovery::{self, DEFAULT_DISCOVER_TIMEOUT_MS};
use prop_core::protocol::LoadType;
use prop_core::session::{LoadSession, SessionConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Propeller network loader", long_about = None)]
struct Cli {
    /// Bridge host name or IP address
    #[arg(short = 'i', long, global = true, default_value = "192.168.4.1")]
    host: String,

    /// Session config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bridge GPIO connected to the target's reset line
    #[arg(short = 'r', long, global = true)]
    reset_pin: Option<u8>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a program onto the target
    Load(LoadArgs),
    /// Pulse the target's reset line
    Reset,
    /// Change the bridge's serial baud rate
    SetBaud {
        baud_rate: u32,
    },
    /// Open a terminal on the target's serial port (ESC exits)
    Terminal {
        /// Serial baud rate for the session
        #[arg(long)]
        terminal_baud: Option<u32>,
    },
    /// List bridges that answer a UDP broadcast
    Discover {
        /// How long to wait for answers, in milliseconds
        #[arg(long, default_value_t = DEFAULT_DISCOVER_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Program image (.binary)
    file: PathBuf,

    /// Write the program to EEPROM
    #[arg(short = 'e', long)]
    eeprom: bool,

    /// Do not run the program after loading
    #[arg(long)]
    no_run: bool,

    /// Loader bundle manifest
    #[arg(long)]
    loader: Option<PathBuf>,

    /// Baud rate for the second-stage loader download
    #[arg(long)]
    initial_baud: Option<u32>,

    /// Baud rate for the packet protocol
    #[arg(long)]
    final_baud: Option<u32>,

    /// Target clock speed in Hz
    #[arg(long)]
    clock_speed: Option<u32>,

    /// Enter terminal mode after loading
    #[arg(short = 't', long)]
    terminal: bool,

    /// Serial baud rate for terminal mode
    #[arg(long)]
    terminal_baud: Option<u32>,
}

impl LoadArgs {
    fn load_type(&self) -> LoadType {
        let mut load_type = LoadType::SHUTDOWN;
        if !self.no_run {
            load_type = load_type | LoadType::RUN;
        }
        if self.eeprom {
            load_type = load_type | LoadType::PROGRAM;
        }
        load_type
    }

    fn apply(&self, config: &mut SessionConfig) {
        if let Some(path) = &self.loader {
            config.loader_bundle = Some(path.clone());
        }
        if let Some(rate) = self.initial_baud {
            config.initial_baud_rate = rate;
        }
        if let Some(rate) = self.final_baud {
            config.final_baud_rate = rate;
        }
        if let Some(clock) = self.clock_speed {
            config.clock_speed = clock;
        }
        if let Some(rate) = self.terminal_baud {
            config.terminal_baud_rate = rate;
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(pin) = cli.reset_pin {
        config.reset_pin = pin;
    }

    match &cli.command {
        Commands::Load(args) => {
            args.apply(&mut config);
            let load_type = args.load_type();
            if load_type == LoadType::SHUTDOWN {
                anyhow::bail!("Nothing to do: --no-run without --eeprom");
            }
            info!(host = %cli.host, file = %args.file.display(), load_type = %load_type, "Loading");
            let session = LoadSession::new(&cli.host, config);
            session.load(&args.file, load_type)?;
            info!("Done");
            if args.terminal {
                session.terminal()?;
            }
        }
        Commands::Reset => {
            LoadSession::new(&cli.host, config).reset()?;
            info!("Target reset");
        }
        Commands::SetBaud { baud_rate } => {
            LoadSession::new(&cli.host, config).set_baud_rate(*baud_rate)?;
            info!(baud_rate, "Baud rate set");
        }
        Commands::Terminal { terminal_baud } => {
            if let Some(rate) = terminal_baud {
                config.terminal_baud_rate = *rate;
            }
            LoadSession::new(&cli.host, config).terminal()?;
        }
        Commands::Discover { timeout_ms } => {
            let modules = discovery::discover(Duration::from_millis(*timeout_ms))?;
            if modules.is_empty() {
                info!("No bridges answered");
            }
            for module in modules {
                println!("from {} got: {}", module.addr, module.reply);
            }
        }
    }
    Ok(())
}
