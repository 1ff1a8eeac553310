//! # FCR — Fleet Command Runner
//!
//! Core of a long-running RPC service that executes interactive CLI and
//! NETCONF operations against a fleet of network devices over SSH and
//! returns their textual output. Vendor differences — prompts, setup
//! sequences, transport subsystems, address selection — are hidden behind a
//! small request/response surface that multiplexes thousands of sessions
//! concurrently.
//!
//! ## Layers
//!
//! - [`transport`]: SSH connections (shell or NETCONF subsystem) behind the
//!   `Transport` trait
//! - [`channel`]: prompt matching over the byte stream, NETCONF framing
//! - [`session`]: the per-device state machine and the session registry
//! - [`vendor`] / [`device`]: vendor profiles and connection-target
//!   resolution
//! - [`dispatch`]: the externally visible operations (`run`, `bulk_run`,
//!   session APIs)
//!
//! The RPC transport itself and the device inventory backend are external
//! collaborators: the first drives [`dispatch::Dispatcher`], the second
//! implements [`device::db::DeviceSource`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fcr::config::ServiceConfig;
//! use fcr::counters::Counters;
//! use fcr::device::db::{DeviceDb, JsonFileSource};
//! use fcr::device::Device;
//! use fcr::dispatch::Dispatcher;
//! use fcr::session::registry::SessionRegistry;
//! use fcr::session::ClientId;
//! use fcr::transport::SshTransportFactory;
//! use fcr::vendor::VendorRegistry;
//!
//! # async fn example() -> fcr::Result<()> {
//! let counters = Arc::new(Counters::new());
//! let dispatcher = Arc::new(Dispatcher::new(
//!     Arc::new(VendorRegistry::builtin()?),
//!     Arc::new(DeviceDb::new(Arc::new(JsonFileSource::new("devices.json")), None)),
//!     Arc::new(SessionRegistry::new(counters.clone())),
//!     counters,
//!     Arc::new(SshTransportFactory),
//!     ServiceConfig::default(),
//! ));
//!
//! let device = Device {
//!     hostname: "rsw001.lab".into(),
//!     username: "admin".into(),
//!     password: "secret".into(),
//!     ..Default::default()
//! };
//! let result = dispatcher
//!     .run(
//!         "show version",
//!         &device,
//!         Duration::from_secs(30),
//!         Duration::from_secs(30),
//!         &ClientId::new("127.0.0.1", 0),
//!         "req-1",
//!     )
//!     .await?;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod counters;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod transport;
pub mod vendor;

// Re-export main types for convenience
pub use config::ServiceConfig;
pub use counters::Counters;
pub use device::{Device, DeviceInfo};
pub use dispatch::{BulkResponse, CommandResult, Dispatcher, PeerClient, PeerPool};
pub use error::{Error, FcrErrorCode, Result};
pub use session::registry::SessionRegistry;
pub use session::{ClientId, Session, SessionHandle, SessionState};
pub use vendor::{SessionKind, VendorProfile, VendorRegistry};
