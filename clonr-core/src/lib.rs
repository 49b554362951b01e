//! The core, UI-agnostic library for the `clonr` device imaging utility.
//!
//! `clonr-core` is designed to be used as a library by any front-end,
//! whether a command-line interface (like `clonr`) or a graphical one. It
//! owns the operation controller: a sequential state machine that validates
//! preconditions, unmounts the target device, supervises the external copy
//! and shrink tools, and turns their unstructured output into structured
//! progress.
//!
//! The library is structured into several key modules:
//! - [`device`]: the cross-platform `Device` value object.
//! - [`platform`]: the capability table and per-OS device discovery.
//! - [`process`]: spawning and supervising the external tools.
//! - [`progress`]: parsing copy-tool chatter into metrics.
//! - [`operation`]: the `Operation` state machine and its `Controller`.
//! - [`image`]: recognized image suffixes and the compressed-restore
//!   pipeline decision.
//! - [`shrink`]: locating (and on first use, fetching) the shrink tool.
//!
//! The primary entry point is [`operation::Controller::start`], which runs
//! one full backup or restore pipeline and reports progress through a
//! single event sink, allowing the calling application to display it any
//! way it chooses.
//!
//! ## Example: backing a device up with progress reporting
//!
//! ```rust,no_run
//! use clonr_core::operation::{Controller, Event, Mode};
//! use std::path::PathBuf;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> clonr_core::Result<()> {
//!     // Stays true until the front-end confirms a cancel.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let controller = Controller::new(running);
//!     let mut on_event = |event: Event| {
//!         if let Event::Metrics(m) = event {
//!             println!("{:.1} MB copied ({})", m.megabytes_copied(), m.rate_text);
//!         }
//!     };
//!
//!     let result = controller.start(
//!         Mode::Backup,
//!         PathBuf::from("/dev/rdisk4"),
//!         PathBuf::from("/tmp/backup.img"),
//!         &mut on_event,
//!     )?;
//!
//!     println!("finished: {result:?}");
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod error;
pub mod image;
pub mod operation;
pub mod platform;
pub mod process;
pub mod progress;
pub mod shrink;

pub use device::Device;
pub use error::{Error, Result};
pub use operation::{Controller, Event, Metrics, Mode, Operation, RunResult, State};
