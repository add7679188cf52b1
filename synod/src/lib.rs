#![doc = include_str!("../README.md")]

use std::time::Duration;

use biometrics::Collector;
use tatl::HeyListen;

mod acceptor;
mod log;
mod proposer;

pub use acceptor::{Acceptor, Learner};
pub use log::{DurableLog, LogRecord};
pub use proposer::{Breakpoint, Proposer};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long the proposer waits for any one acceptor before counting it as a no.
pub const PHASE_TIMEOUT: Duration = Duration::from_millis(1_000);

/// The inclusive bounds of the randomized delay ahead of a proposal, to keep duelling proposers
/// from starving each other indefinitely.
pub const MIN_JITTER_MS: u64 = 10;
pub const MAX_JITTER_MS: u64 = 20;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    acceptor::register_biometrics(collector);
    log::register_biometrics(collector);
    proposer::register_biometrics(collector);
}

/// Register the monitors for this crate.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    log::register_monitors(hey_listen);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();
