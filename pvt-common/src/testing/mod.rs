//! Helpers shared by unit and integration tests.

mod log;

pub use log::init_test_logging;

use std::net::TcpListener;

/// A loopback address with a port that was free a moment ago.
pub fn free_local_address() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}
