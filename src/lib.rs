//! # netfleet - Network Device Fleet Automation over SSH
//!
//! `netfleet` runs commands and file transfers against many network devices
//! at once. Every device endpoint gets a supervised SSH session with an
//! explicit connection state machine, optional jump-host chaining and a
//! keepalive watchdog. Shared resource pools bound how many connections,
//! commands and transfers are in flight for the whole run.
//!
//! ## Features
//!
//! - **Session State Machine**: connect, retry and keepalive with observable states
//! - **Jump Hosts**: sessions tunnelled through another device's session
//! - **Resource Pools**: per-run limits on connections, commands, downloads and uploads
//! - **Device Dialects**: Junos command framing and in-band error detection
//! - **XML Parsing**: device replies turned into nested, index-keyed maps
//! - **File Transfers**: recursive SFTP copies with progress and partial results
//! - **Fleet Runs**: one routine per device, failures isolated per device
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netfleet::config::SessionOptions;
//! use netfleet::device::Device;
//! use netfleet::fleet::Fleet;
//! use netfleet::session::{ConnectionSecurityOptions, Credentials, SessionContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = SessionContext::ssh(
//!         ConnectionSecurityOptions::balanced(),
//!         SessionOptions::default(),
//!     );
//!     let mut fleet = Fleet::new(context);
//!     fleet.add(
//!         Device::builder("r1")
//!             .endpoint("192.0.2.10")
//!             .credentials(Credentials::new("admin", "secret")),
//!     )?;
//!
//!     let report = fleet
//!         .gather(
//!             |device| async move {
//!                 let cli = device.cli().ok_or_else(|| anyhow::anyhow!("no endpoint"))?;
//!                 Ok(cli.run_cmd("show version").await?)
//!             },
//!             |_| true,
//!         )
//!         .await;
//!
//!     for (id, outcome) in report.iter() {
//!         println!("{id}: {:?}", outcome.value());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::Session`] - supervised connection to one endpoint
//! - [`pools::ResourcePools`] - concurrency limits of one run
//! - [`protocol::Cli`] - dialect-aware command verbs
//! - [`parser::XmlParser`] - XML to nested maps
//! - [`transfer::TransferManager`] - recursive uploads and downloads
//! - [`fleet::Fleet`] - devices of one run and the gather operation
//! - [`error`] - error types of every layer
//! - [`config`] - SSH algorithm tables and defaults

pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod parser;
pub mod pools;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use device::{Device, DeviceBuilder, EndpointSpec};
pub use error::{DeviceError, FleetError, ParseError, SessionError, TransportError};
pub use fleet::{DeviceOutcome, Fleet, GatherReport};
pub use session::{Credentials, Session, SessionContext, SessionState};
