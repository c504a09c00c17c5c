//! Orchestration for the NFe monitor: configuration, the company registry, the
//! poll scheduler, the notification dispatcher and the service loop that drives
//! them.

mod config;
mod dispatcher;
mod registry;
mod scheduler;
mod service;
#[cfg(test)]
mod testing;

pub use config::{MonitorConfig, NotifySettings, PollSettings};
pub use dispatcher::{DigestSummary, Dispatcher, DrainSummary};
pub use registry::{CompanyRegistry, RegistrySyncSummary};
pub use scheduler::{PollOutcome, PollScheduler, TickSummary};
pub use service::{shutdown_on_ctrl_c, Monitor, PumpSummary};

pub const CRATE_NAME: &str = "nfe-sync";
