//! Pair a DUT with a simulated peer from the command line
//!
//! Run with: cargo run --bin bluet -- run --program ./build/zephyr/zephyr.exe --peer passkey

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use bluet::config::HarnessConfig;
use bluet::device::{dut_device, ManagedDevice};
use bluet::link::LinkBus;
use bluet::markers::classify;
use bluet::pairing::{
    AcceptAll, FixedPasskey, IoCapability, RelayDelegate, Rejecting, StdinPasskeyDelegate,
};
use bluet::scenario::{with_deadline, MarkerWatch, Outcome, ScenarioError};
use bluet::sim::{SimPeer, SimPeerConfig};

#[derive(Parser, Debug)]
#[command(name = "bluet", about = "Drive a BLE device-under-test against a simulated peer")]
struct Cli {
    /// JSON harness configuration. `BLUET_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the DUT, pair it with a simulated peer and report the outcome.
    Run {
        /// DUT executable.
        #[arg(long)]
        program: Option<PathBuf>,

        /// Host transport port. 0 picks one.
        #[arg(long)]
        port: Option<u16>,

        /// How the simulated peer behaves.
        #[arg(long, value_enum, default_value_t = PeerMode::JustWorks)]
        peer: PeerMode,

        /// Which side the DUT plays.
        #[arg(long, value_enum, default_value_t = DutRole::Central)]
        role: DutRole,

        /// Extra arguments passed to the DUT after `--bt-dev`.
        #[arg(last = true)]
        dut_args: Vec<String>,
    },
    /// Print the markers found in a captured DUT log.
    Classify { log: PathBuf },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PeerMode {
    /// Accepts with no input or output.
    JustWorks,
    /// Enters the passkey the DUT prints.
    Passkey,
    /// Enters a passkey that cannot match.
    WrongPasskey,
    /// Refuses to pair.
    Insecure,
    /// Displays a passkey by typing it into the DUT.
    NoInput,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DutRole {
    /// The DUT scans for and connects to the peer.
    Central,
    /// The DUT advertises and the peer connects to it.
    Peripheral,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bluet::logging::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    match cli.command {
        Command::Classify { log } => classify_log(log).await,
        Command::Run {
            program,
            port,
            peer,
            role,
            dut_args,
        } => {
            if let Some(program) = program {
                config.dut_program = Some(program);
            }
            if let Some(port) = port {
                config.hci_port = port;
            }
            if !dut_args.is_empty() {
                config.dut_args = dut_args;
            }
            run(config, peer, role).await
        }
    }
}

async fn classify_log(path: PathBuf) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if let Some(marker) = classify(&line) {
            println!("{}: {:?}", line_no, marker);
        }
    }
    Ok(())
}

async fn run(config: HarnessConfig, mode: PeerMode, role: DutRole) -> anyhow::Result<()> {
    let program = config.program()?.to_path_buf();
    let bus = LinkBus::new();
    let device = dut_device(
        &config.controller_name,
        config.hci_port,
        &bus,
        &program,
        config.dut_args.clone(),
    );
    log::info!("Starting {} as {:?} against a {:?} peer", program.display(), role, mode);

    let scenario = device.scope(|device| drive(device, config, mode, role));
    let outcome = tokio::select! {
        outcome = scenario => outcome?,
        _ = signal::ctrl_c() => {
            log::info!("Interrupted");
            device.close().await;
            return Ok(());
        }
    };

    match outcome {
        Outcome::Bonded => println!("bonded"),
        Outcome::Disconnected { reason } => match reason {
            Some(reason) => println!("disconnected (reason {})", reason),
            None => println!("disconnected"),
        },
    }
    Ok(())
}

async fn drive(
    device: Arc<ManagedDevice>,
    config: HarnessConfig,
    mode: PeerMode,
    role: DutRole,
) -> Result<Outcome, ScenarioError> {
    let watch = MarkerWatch::new(config.relay_queue_capacity);
    let stdout = device
        .take_stdout()
        .await
        .ok_or_else(|| ScenarioError::Setup("DUT stdout unavailable".to_string()))?;
    let _monitor = watch.attach("dut", stdout);

    let peer_config = SimPeerConfig::new(config.peer_name.clone())
        .with_pairing_timeout(config.pairing_timeout());
    let peer_config = match mode {
        PeerMode::JustWorks => peer_config.with_delegate(AcceptAll::default()),
        PeerMode::Passkey => peer_config.with_delegate(
            RelayDelegate::new(watch.passkey()).with_io_capability(IoCapability::KeyboardInputOnly),
        ),
        PeerMode::WrongPasskey => peer_config.with_delegate(FixedPasskey { value: 111_111 }),
        PeerMode::Insecure => peer_config.with_delegate(Rejecting::default()),
        PeerMode::NoInput => {
            let stdin = device
                .stdin()
                .await
                .ok_or_else(|| ScenarioError::Setup("DUT stdin unavailable".to_string()))?;
            peer_config.with_delegate(StdinPasskeyDelegate::new(stdin))
        }
    };
    let peer = SimPeer::power_on(peer_config, device.bus());

    let pairing = async {
        match role {
            DutRole::Central => {
                peer.advertise_until_connected().await?;
            }
            DutRole::Peripheral => {
                peer.scan_and_connect(&config.controller_name, true).await?;
            }
        }
        peer.pair().await
    };
    let pairing = with_deadline(pairing, config.pairing_timeout(), "pairing with the DUT");

    let (paired, outcome) = tokio::join!(pairing, watch.outcome(config.marker_timeout()));
    match paired {
        Ok(Ok(result)) => log::info!("Peer paired: {:?}", result),
        Ok(Err(e)) => log::info!("Peer pairing failed: {}", e),
        Err(e) => log::warn!("{}", e),
    }
    let outcome = outcome?;
    if let Err(e) = peer.disconnect().await {
        log::debug!("Peer disconnect: {}", e);
    }
    Ok(outcome)
}
