use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use clonr_core::operation::{Controller, Event, Mode, RunResult, State};
use clonr_core::{Device, image, platform};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "clonr")]
#[command(about = "Back up removable block devices to image files, and restore them", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a device to an image file
    Backup {
        /// Destination image file
        #[arg(required = true)]
        image: PathBuf,

        /// Source device path, bypassing interactive selection
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Keep the image exactly as copied; skip the shrink stage
        #[arg(long = "no-shrink")]
        no_shrink: bool,
    },
    /// Write an image file back to a device
    Restore {
        /// Source image file (.img, .iso, .dmg, .gz, .zip)
        #[arg(required = true)]
        image: PathBuf,

        /// Destination device path, bypassing interactive selection
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// List detected removable devices
    List,
}

/// Interactive device selection. Picking the detection-failure placeholder
/// falls back to typing a path by hand.
fn select_device(devices: &[Device], prompt: &str) -> Result<PathBuf> {
    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    let chosen = &devices[selection];
    if chosen.is_placeholder {
        let path: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Device path (e.g. /dev/rdisk4)")
            .interact_text()?;
        Ok(PathBuf::from(path.trim()))
    } else {
        Ok(chosen.raw_path.clone())
    }
}

/// Shared cancellation state between the Ctrl-C handler and the recovery
/// loop. `running` is the flag the controller polls; `warned` tracks the
/// two-press confirmation.
#[derive(Clone)]
struct CancelFlags {
    running: Arc<AtomicBool>,
    warned: Arc<AtomicBool>,
}

impl CancelFlags {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-arms both flags before a pipeline attempt. A run cancelled with
    /// Ctrl-C leaves `running` false, and without a reset every retry would
    /// cancel itself at its first stage.
    fn arm(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.warned.store(false, Ordering::SeqCst);
    }
}

fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Runs one pipeline attempt, rendering controller events on a spinner.
fn run_once(
    controller: &Controller,
    mode: Mode,
    source: PathBuf,
    destination: PathBuf,
) -> Result<RunResult> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] [{spinner}] {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut on_event = |event: Event| match event {
        Event::State(state) => {
            let prefix = match state {
                State::Idle => "Idle",
                State::Validating => "Validating",
                State::Unmounting => "Unmounting",
                State::Copying => "Copying",
                State::Shrinking => "Shrinking",
                State::Completed => "Completed",
                State::Errored => "Failed",
            };
            pb.set_prefix(prefix);
        }
        Event::Metrics(m) => {
            if m.rate_text.is_empty() {
                pb.set_message(format!("{:.1} MB", m.megabytes_copied()));
            } else {
                pb.set_message(format!("{:.1} MB ({})", m.megabytes_copied(), m.rate_text));
            }
        }
        Event::Log(line) => {
            if line.starts_with("warning:") {
                pb.println(style(&line).yellow().to_string());
            }
        }
        Event::Terminal(_) => {}
    };

    let result = controller.start(mode, source, destination, &mut on_event)?;

    match &result {
        RunResult::Success { final_path } => {
            pb.finish_with_message("done");
            println!(
                "\n✨ Finished: {}",
                style(final_path.display()).cyan()
            );
        }
        RunResult::Failure { reason } => {
            pb.finish_and_clear();
            eprintln!("{} {}", style("Operation failed:").red().bold(), reason);
        }
    }

    Ok(result)
}

/// The recovery loop around one operation: on failure the user picks retry,
/// reselect the device, or quit; never a dead end.
fn run_with_recovery(
    controller: &Controller,
    flags: &CancelFlags,
    mode: Mode,
    image: &PathBuf,
    mut device: PathBuf,
    select_prompt: &str,
) -> Result<()> {
    loop {
        flags.arm();
        let (source, destination) = match mode {
            Mode::Backup => (device.clone(), image.clone()),
            Mode::Restore => (image.clone(), device.clone()),
        };

        match run_once(controller, mode, source, destination)? {
            RunResult::Success { .. } => return Ok(()),
            RunResult::Failure { .. } => {
                let choice = Select::with_theme(&ColorfulTheme::default())
                    .with_prompt("What next?")
                    .items(&["Retry", "Choose another device", "Quit"])
                    .default(0)
                    .interact()?;

                match choice {
                    0 => continue,
                    1 => {
                        let devices = platform::list_devices();
                        device = select_device(&devices, select_prompt)?;
                    }
                    // The failure was already printed; exit without
                    // wrapping it in a second error message.
                    _ => std::process::exit(1),
                }
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Cancellation is advisory and destructive mid-write, so the first
    // Ctrl-C only warns; the second confirms and arms the shared flag the
    // controller polls.
    let flags = CancelFlags::new();
    {
        let flags = flags.clone();
        ctrlc::set_handler(move || {
            if flags.warned.swap(true, Ordering::SeqCst) {
                flags.running.store(false, Ordering::SeqCst);
                eprintln!("\nCancelling: terminating the copy tool.");
            } else {
                eprintln!(
                    "\n{} interrupting mid-write can leave the destination inconsistent. Press Ctrl-C again to cancel anyway.",
                    style("WARNING:").red().bold()
                );
            }
        })?;
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            image,
            device,
            no_shrink,
        } => {
            let device = match device {
                Some(path) => path,
                None => {
                    let devices = platform::list_devices();
                    select_device(&devices, "Select the device to back up")?
                }
            };

            println!(
                "This will read {} into {}.",
                style(device.display()).cyan(),
                style(image.display()).cyan()
            );
            if !confirm_operation("Proceed?")? {
                println!("Backup cancelled.");
                return Ok(());
            }
            println!();

            let controller = if no_shrink {
                Controller::new(flags.running.clone()).without_shrink()
            } else {
                Controller::new(flags.running.clone())
            };
            run_with_recovery(
                &controller,
                &flags,
                Mode::Backup,
                &image,
                device,
                "Select the device to back up",
            )?;
        }
        Commands::Restore { image, device } => {
            if !image.is_file() {
                return Err(anyhow!("image not found: {}", image.display()));
            }
            if !image::is_image(&image) {
                return Err(anyhow!(
                    "unrecognized image suffix: {} (expected .img, .iso, .dmg, .gz or .zip)",
                    image.display()
                ));
            }

            let device = match device {
                Some(path) => path,
                None => {
                    let devices = platform::list_devices();
                    select_device(&devices, "Select the device to restore onto")?
                }
            };

            println!(
                "{} This will erase all data on {}.",
                style("WARNING:").red().bold(),
                style(device.display()).cyan()
            );
            println!("  Image:  {}", style(image.display()).cyan());
            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Restore cancelled.");
                return Ok(());
            }
            println!();

            let controller = Controller::new(flags.running.clone());
            run_with_recovery(
                &controller,
                &flags,
                Mode::Restore,
                &image,
                device,
                "Select the device to restore onto",
            )?;
        }
        Commands::List => {
            let devices = platform::list_devices();
            if devices.len() == 1 && devices[0].is_placeholder {
                println!("No removable devices detected.");
                return Ok(());
            }

            println!("Found {} removable device(s):\n", devices.len());
            for device in devices {
                println!("  {device}");
            }
        }
    }

    Ok(())
}
