/* ddcctl CLI: clap-driven front end over the ddcci library to detect
 * monitors, read and write VCP features, fetch capabilities, and watch
 * connection events. */

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ddcci::{
    DisplayIdentifier, DisplayRef, DisplayStatusEvent, ErrorInfo, InitOptions, OpenOptions,
    WatchMode,
};

/// ddcctl — query and control monitors over DDC/CI.
#[derive(Parser)]
#[command(name = "ddcctl", version, about)]
struct Cli {
    /// Select the display by detection-assigned number.
    #[arg(short, long, global = true)]
    display: Option<i32>,

    /// Select the display by I2C bus number (/dev/i2c-N).
    #[arg(short, long, global = true)]
    bus: Option<u8>,

    /// Scale every DDC-mandated sleep by this factor (0.1..=10.0).
    #[arg(long, global = true)]
    sleep_multiplier: Option<f64>,

    /// Retry caps as write-only,write-read,multi-part (each 1..=15).
    #[arg(long, global = true, value_name = "W,R,M")]
    max_tries: Option<String>,

    /// I2C transport strategy.
    #[arg(long, global = true, value_enum)]
    ddc_io: Option<IoStrategyArg>,

    /// Skip the initial monitor probe and assume the DDC-flag policy.
    #[arg(long, global = true)]
    skip_ddc_checks: bool,

    /// Disable the per-display dynamic sleep adjustment.
    #[arg(long, global = true)]
    disable_dynamic_sleep: bool,

    /// EDID read size: 128 or 256 bytes.
    #[arg(long, global = true)]
    edid_read_size: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected displays.
    Detect,

    /// Read a VCP feature value.
    Getvcp {
        /// Feature code (hex: 0x10, x10 or 10h).
        feature: String,
    },

    /// Write a VCP feature value.
    Setvcp {
        /// Feature code (hex: 0x10, x10 or 10h).
        feature: String,
        /// New value.
        value: u16,
        /// Read the value back and report a mismatch.
        #[arg(long)]
        verify: bool,
    },

    /// Fetch and print the monitor's capabilities string.
    Capabilities,

    /// Ask the monitor to save its current settings.
    SaveSettings,

    /// Stream display status events until interrupted.
    Watch {
        #[arg(long, value_enum, default_value_t = WatchModeArg::Dynamic)]
        mode: WatchModeArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum IoStrategyArg {
    Ioctl,
    Fileio,
}

#[derive(Clone, Copy, ValueEnum)]
enum WatchModeArg {
    Poll,
    Udev,
    Xevent,
    Dynamic,
}

impl From<WatchModeArg> for WatchMode {
    fn from(arg: WatchModeArg) -> Self {
        match arg {
            WatchModeArg::Poll => WatchMode::Poll,
            WatchModeArg::Udev => WatchMode::Udev,
            WatchModeArg::Xevent => WatchMode::Xevent,
            WatchModeArg::Dynamic => WatchMode::Dynamic,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    apply_settings(&cli)?;
    ddcci::init(InitOptions::default()).map_err(report)?;

    match &cli.command {
        Commands::Detect => cmd_detect(),
        Commands::Getvcp { feature } => cmd_getvcp(&cli, feature),
        Commands::Setvcp { feature, value, verify } => cmd_setvcp(&cli, feature, *value, *verify),
        Commands::Capabilities => cmd_capabilities(&cli),
        Commands::SaveSettings => cmd_save_settings(&cli),
        Commands::Watch { mode } => cmd_watch((*mode).into()),
    }
}

/* Render the full causal tree; a bare summary hides the per-attempt
 * detail that makes DDC failures diagnosable. */
fn report(e: ErrorInfo) -> anyhow::Error {
    anyhow!("{}", e.report().trim_end().to_string())
}

fn apply_settings(cli: &Cli) -> Result<()> {
    if let Some(multiplier) = cli.sleep_multiplier {
        ddcci::set_sleep_multiplier(multiplier).map_err(report)?;
    }
    if let Some(spec) = &cli.max_tries {
        let parts: Vec<&str> = spec.split(',').collect();
        if parts.len() != 3 {
            bail!("--max-tries wants three comma-separated counts, e.g. 4,4,8");
        }
        let classes =
            [ddcci::RetryClass::WriteOnly, ddcci::RetryClass::WriteRead, ddcci::RetryClass::MultiPart];
        for (class, part) in classes.into_iter().zip(parts) {
            let tries: u8 =
                part.trim().parse().with_context(|| format!("bad retry count '{part}'"))?;
            ddcci::set_max_tries(class, tries).map_err(report)?;
        }
    }
    if let Some(strategy) = cli.ddc_io {
        ddcci::set_i2c_io_strategy(match strategy {
            IoStrategyArg::Ioctl => ddcci::I2cIoStrategy::Ioctl,
            IoStrategyArg::Fileio => ddcci::I2cIoStrategy::Fileio,
        });
    }
    if let Some(size) = cli.edid_read_size {
        ddcci::edid::set_edid_read_size(size).map_err(report)?;
    }
    ddcci::set_skip_ddc_checks(cli.skip_ddc_checks);
    if cli.disable_dynamic_sleep {
        ddcci::set_dynamic_sleep_enabled(false);
    }
    Ok(())
}

/* Pick the target display from --bus / --display, or the sole detected
 * display when neither is given. */
fn resolve_target(cli: &Cli) -> Result<Arc<DisplayRef>> {
    if let Some(bus) = cli.bus {
        return ddcci::resolve_display_identifier(&DisplayIdentifier::BusNo(bus)).map_err(report);
    }

    let count = ddcci::detect_displays();
    if let Some(display) = cli.display {
        return ddcci::resolve_display_identifier(&DisplayIdentifier::DispNo(display))
            .map_err(report);
    }

    let live: Vec<_> =
        ddcci::all_display_refs().into_iter().filter(|d| !d.is_removed()).collect();
    match live.len() {
        1 => Ok(live.into_iter().next().expect("len checked")),
        0 => bail!("no DDC-capable displays detected"),
        _ => bail!("{count} displays detected; select one with --display or --bus"),
    }
}

fn parse_feature(s: &str) -> Result<u8> {
    if let Some(byte) = ddcci::dynamic_features::parse_hex_byte(s) {
        return Ok(byte);
    }
    /* Bare hex digits are common enough on the command line. */
    u8::from_str_radix(s.trim(), 16).with_context(|| format!("'{s}' is not a feature code"))
}

fn cmd_detect() -> Result<()> {
    ddcci::detect_displays();
    let drefs = ddcci::all_display_refs();
    if drefs.is_empty() {
        println!("No DDC-capable displays detected.");
        return Ok(());
    }

    for dref in drefs {
        if dref.is_removed() {
            continue;
        }
        println!("Display {}", dref.dispno());
        println!("   I2C bus:       {}", dref.io_path);
        if let Some(connector) = dref.drm_connector() {
            println!("   DRM connector: {connector}");
        }
        if let Some(edid) = dref.edid() {
            println!("   Mfg id:        {}", edid.mfg_id);
            println!("   Model:         {}", edid.model_name);
            if !edid.serial_ascii.is_empty() {
                println!("   Serial number: {}", edid.serial_ascii);
            }
            println!("   Product code:  {}", edid.product_code);
        }
        if let Some(summary) = dref.comm_error_summary() {
            println!("   Last errors:   {summary}");
        }
        println!();
    }
    Ok(())
}

fn cmd_getvcp(cli: &Cli, feature: &str) -> Result<()> {
    let code = parse_feature(feature)?;
    let dref = resolve_target(cli)?;
    let mut dh = ddcci::open_display(&dref, OpenOptions::default()).map_err(report)?;

    match ddcci::get_vcp(&mut dh, code) {
        Ok(v) => {
            let kind = match v.value_type {
                ddcci::packet::VCP_TYPE_CONTINUOUS => "C",
                ddcci::packet::VCP_TYPE_NON_CONTINUOUS => "NC",
                _ => "?",
            };
            println!("VCP {code:#04x} ({kind}): current value = {}, max value = {}", v.cur(), v.max());
        }
        Err(e) if ddcci::status_is_not_error(e.status) => {
            println!("VCP {code:#04x}: feature is not supported ({})", ddcci::status_name(e.status));
        }
        Err(e) => return Err(report(e)),
    }

    dh.close().map_err(report)
}

fn cmd_setvcp(cli: &Cli, feature: &str, value: u16, verify: bool) -> Result<()> {
    let code = parse_feature(feature)?;
    let dref = resolve_target(cli)?;
    ddcci::set_verify_setvcp(verify);
    let mut dh = ddcci::open_display(&dref, OpenOptions::default()).map_err(report)?;

    ddcci::set_vcp(&mut dh, code, value).map_err(report)?;
    println!("VCP {code:#04x} set to {value}");
    dh.close().map_err(report)
}

fn cmd_capabilities(cli: &Cli) -> Result<()> {
    let dref = resolve_target(cli)?;
    let mut dh = ddcci::open_display(&dref, OpenOptions::default()).map_err(report)?;

    let bytes = ddcci::get_capabilities_string(&mut dh).map_err(report)?;
    println!("{}", String::from_utf8_lossy(&bytes));
    dh.close().map_err(report)
}

fn cmd_save_settings(cli: &Cli) -> Result<()> {
    let dref = resolve_target(cli)?;
    let mut dh = ddcci::open_display(&dref, OpenOptions::default()).map_err(report)?;

    ddcci::save_current_settings(&mut dh).map_err(report)?;
    println!("Settings saved.");
    dh.close().map_err(report)
}

fn cmd_watch(mode: WatchMode) -> Result<()> {
    ddcci::detect_displays();
    ddcci::register_status_callback(Arc::new(|event: DisplayStatusEvent| {
        let what = match event.event_type {
            ddcci::DisplayEventType::Connected => "connected",
            ddcci::DisplayEventType::Disconnected => "disconnected",
            ddcci::DisplayEventType::DpmsAwake => "DPMS awake",
            ddcci::DisplayEventType::DpmsAsleep => "DPMS asleep",
            ddcci::DisplayEventType::DdcEnabled => "DDC enabled",
        };
        let path = event
            .io_path
            .map(|p| format!(" ({p})"))
            .unwrap_or_default();
        println!("[{}] {} {}{}", event.timestamp_ns, event.connector_name, what, path);
    }));

    ddcci::init(InitOptions { watch_mode: Some(mode), detect: false }).map_err(report)?;
    println!("Watching for display changes; press Ctrl-C to stop.");
    loop {
        std::thread::park();
    }
}
