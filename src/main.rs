//! soloist - live audio/MIDI host for a single instrument plugin

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use soloist::audio::{list_host_apis, list_midi_inputs, list_output_devices, AudioEngine};
use soloist::settings::{AudioSettings, EngineSettings, MidiSettings};

#[derive(Parser)]
#[command(name = "soloist")]
#[command(about = "Live audio/MIDI host for a single instrument plugin")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio and MIDI devices
    Devices,

    /// Load a plugin and run the engine
    Run {
        /// Path to the plugin bundle (.clap)
        plugin: PathBuf,

        /// Plugin index within the bundle
        #[arg(long, default_value = "0")]
        index: u32,

        /// Audio API name (use 'devices' to see what is compiled in)
        #[arg(long)]
        audio_api: Option<String>,

        /// Output device index (default: system default device)
        #[arg(long)]
        audio_device: Option<usize>,

        /// MIDI input port index (default: first available port)
        #[arg(long)]
        midi_port: Option<usize>,

        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Block size in samples
        #[arg(long, default_value = "256")]
        buffer_size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Run {
            plugin,
            index,
            audio_api,
            audio_device,
            midi_port,
            sample_rate,
            buffer_size,
        } => {
            let settings = EngineSettings {
                audio: AudioSettings {
                    api: audio_api,
                    device: audio_device,
                    sample_rate,
                    buffer_size,
                },
                midi: MidiSettings { port: midi_port },
            };
            run_engine(settings, plugin, index).await
        }
    }
}

fn list_devices() -> Result<()> {
    println!("Audio APIs:");
    for api in list_host_apis() {
        println!("  {}", api);
    }

    println!("\nOutput devices:");
    for device in list_output_devices() {
        let default = if device.is_default { " (default)" } else { "" };
        println!(
            "  [{}] {} — {} Hz{}",
            device.index,
            device.name,
            device
                .supported_sample_rates
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("/"),
            default
        );
    }

    println!("\nMIDI input ports:");
    match list_midi_inputs() {
        Ok(ports) if ports.is_empty() => println!("  (none)"),
        Ok(ports) => {
            for port in ports {
                println!("  [{}] {}", port.index, port.name);
            }
        }
        Err(e) => println!("  unavailable: {}", e),
    }

    Ok(())
}

async fn run_engine(settings: EngineSettings, plugin: PathBuf, index: u32) -> Result<()> {
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid settings: {}", e))?;

    let mut engine = AudioEngine::new(settings);
    engine.load_plugin(&plugin, index)?;
    if let Some(info) = engine.plugin_info() {
        info!(name = %info.name, vendor = %info.vendor, "hosting plugin");
    }

    engine.start();
    if !engine.is_running() {
        anyhow::bail!("engine failed to start (check device settings with 'soloist devices')");
    }

    println!("Running. Press 'q' + Enter or Ctrl-C to quit.");

    // The plugin's non-real-time housekeeping runs at ~30 Hz
    let mut idle = tokio::time::interval(Duration::from_millis(1000 / 30));
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = idle.tick() => {
                engine.idle();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(cmd)) if cmd.trim() == "q" => break,
                    Ok(Some(cmd)) if cmd.trim() == "t" => {
                        println!("steady time: {} samples", engine.steady_time());
                    }
                    Ok(Some(_)) => {}
                    // stdin closed
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    engine.stop();
    engine.unload_plugin();
    info!("engine shut down");
    Ok(())
}
