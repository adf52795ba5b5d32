//! Property Verification Toolkit - shared library
//!
//! Drives an external control-system server through its command-line
//! clients and observes its internal state over a strictly alternating
//! rendezvous channel.

pub mod address;
pub mod config;
pub mod controller;
pub mod error;
pub mod exec;
pub mod expectation;
pub mod journal;
pub mod logging;
pub mod mutator;
pub mod polling;
pub mod rendezvous;
pub mod suite;
pub mod testing;
pub mod wire;

pub use address::{CALLBACK_SUFFIX, PropertyAddress};
pub use config::{
    ArrayScenarioConfig, ClientConfig, ConfigSource, EnvError, EnvParser, PollCheckConfig,
    PollConfig, RendezvousConfig, ResolvedConfig, ScalarScenarioConfig, ScenarioConfig,
    ServerConfig, Sourced, SuiteConfig, ValueType,
};
pub use controller::{ServerController, ServerSession};
pub use error::{HarnessError, HarnessResult};
pub use exec::{CommandOutput, CommandRunner};
pub use expectation::{
    CallbackAccess, CounterDelta, CounterLedger, CounterState, ExpectationEngine, Exercise,
    ProbeKind, ScenarioExpectation, ScenarioReport, StepRecord, plan, values_match,
};
pub use journal::{JournalEvent, RunJournal, RunPhase};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use mutator::{ClientCommand, PropertyAccess, PropertyMutator};
pub use polling::{PollOutcome, PollPolicy, await_eventual_value};
pub use rendezvous::{ChannelState, RendezvousChannel, RendezvousPeer};
pub use suite::{PollCheckReport, RunOutcome, SuiteReport, SuiteRunner};

#[cfg(test)]
#[ctor::ctor]
fn init_unit_test_logging() {
    testing::init_test_logging();
}
