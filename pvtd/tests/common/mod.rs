use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use pvt_common::{PollCheckConfig, SuiteConfig};

pub use pvt_common::testing::init_test_logging;

pub const LOCATION: &str = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION";

pub fn server_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pvtd"))
}

pub fn client_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pvtd-client"))
}

pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

pub fn address(property: &str) -> String {
    format!("{LOCATION}/{property}")
}

#[allow(dead_code)]
/// The default suite wired to the mock server with a socket under `dir`.
pub fn suite_config(dir: &Path) -> SuiteConfig {
    let socket = dir.join("pvtd.sock").display().to_string();
    let client = client_exe().display().to_string();

    let mut config = SuiteConfig::default();
    config.journal_dir = Some(dir.join("journal"));
    config.rendezvous.address = "127.0.0.1:0".to_string();
    config.rendezvous.message_timeout = Duration::from_secs(10);
    config.server.executable = server_exe();
    config.server.args = vec![
        "--rendezvous".to_string(),
        "{rendezvous}".to_string(),
        "--socket".to_string(),
        socket.clone(),
        "--fixtures-dir".to_string(),
        fixtures_dir().display().to_string(),
        "--update-interval".to_string(),
        "200ms".to_string(),
    ];
    config.server.settling_delay = Duration::from_millis(100);
    config.server.ready_timeout = Duration::from_secs(15);
    config.client.put = vec![
        client.clone(),
        "--socket".to_string(),
        socket.clone(),
        "put".to_string(),
    ];
    config.client.get = vec![client, "--socket".to_string(), socket, "get".to_string()];
    config
}

#[allow(dead_code)]
pub fn voltage_check(expected: &str) -> PollCheckConfig {
    PollCheckConfig {
        name: "voltage".to_string(),
        write: address("TARGET_VOLTAGE").parse().unwrap(),
        value: expected.to_string(),
        read: address("MONITOR_VOLTAGE").parse().unwrap(),
        expected: None,
    }
}

/// A standalone pvtd without a driver, killed on drop.
#[allow(dead_code)]
pub struct StandaloneServer {
    child: Child,
    pub socket: PathBuf,
}

#[allow(dead_code)]
impl StandaloneServer {
    pub fn start(dir: &Path, update_interval: &str) -> Self {
        let socket = dir.join("pvtd.sock");
        let child = Command::new(server_exe())
            .args(["--no-rendezvous", "--update-interval", update_interval])
            .arg("--socket")
            .arg(&socket)
            .arg("--fixtures-dir")
            .arg(fixtures_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn pvtd");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !socket.exists() {
            assert!(Instant::now() < deadline, "pvtd did not create {socket:?}");
            std::thread::sleep(Duration::from_millis(20));
        }
        Self { child, socket }
    }

    pub fn client(&self, args: &[&str]) -> Output {
        Command::new(client_exe())
            .arg("--socket")
            .arg(&self.socket)
            .args(args)
            .output()
            .expect("run pvtd-client")
    }
}

impl Drop for StandaloneServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
