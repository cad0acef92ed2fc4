//! Self-organizing trading hive: adaptive signal generators, a shared
//! context ledger, an evolving agent population and a risk guardian.

pub mod agent;
pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod evolver;
pub mod feed;
pub mod fingerprint;
pub mod guardian;
pub mod hive;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod peer;
pub mod population;
pub mod signals;
pub mod storage;

pub use error::{HiveError, Result};
pub use hive::{Collaborators, Hive, RunSummary, ShutdownHandle};
