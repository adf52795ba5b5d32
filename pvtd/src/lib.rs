//! Property Verification Toolkit - mock instrumented server
//!
//! A stand-in control-system server: a typed property store with
//! callback-wrapped properties, a Unix socket control API used by
//! `pvtd-client`, and an instrumentation thread that reports internal state
//! to the driver over the rendezvous channel.

pub mod observer;
pub mod protocol;
pub mod server;
pub mod store;
pub mod updater;

pub use observer::{MESSAGE_WIDTH, Observer, ObserverConfig};
pub use protocol::{DEFAULT_SOCKET, Request, Response, StatusInfo};
pub use server::{ServerState, handle_connection, serve};
pub use store::{
    Access, CallbackCounters, Observation, PropertyKind, PropertyStore, PropertyValue, StoreError,
};
pub use updater::{DEFAULT_UPDATE_INTERVAL, spawn_updater};

#[cfg(test)]
#[ctor::ctor]
fn init_unit_test_logging() {
    pvt_common::testing::init_test_logging();
}
