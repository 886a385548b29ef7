// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SECRET: &str = "s3cr3t";
pub const VERSION: &str = "0.1";

/// Handle to a running procmgrd process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _reader_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

fn collect_lines<R: Read + Send + 'static>(
    stream: R,
    tag: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(l) => {
                    eprintln!("[{tag}] {l}");
                    lines.lock().unwrap().push(l);
                }
                Err(_) => break,
            }
        }
    })
}

impl DaemonHandle {
    /// Start the manager with `PROCMGR_CONFIG_PATH` pointing to `config_path`.
    pub fn start(config_path: &Path) -> Self {
        Self::start_with_env(config_path, &[])
    }

    pub fn start_with_env(config_path: &Path, env: &[(&str, &str)]) -> Self {
        let bin = env!("CARGO_BIN_EXE_procmgrd");
        let mut child = Command::new(bin)
            .env("PROCMGR_CONFIG_PATH", config_path)
            .envs(env.iter().copied())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start procmgrd");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));

        // The manager echoes its INFO lines to stdout, startup failures go to stderr.
        let reader_thread = collect_lines(stdout, "manager", log_lines.clone());
        let stderr_thread = collect_lines(stderr, "manager:err", log_lines.clone());

        Self {
            child,
            log_lines,
            _reader_thread: reader_thread,
            _stderr_thread: stderr_thread,
        }
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        self.wait_for_log_count(pattern, 1, timeout)
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    /// Wait until the count of log lines matching `pattern` reaches at least `n`.
    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        wait_until(|| self.count_log_matches(pattern) >= n, timeout)
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to procmgrd");
    }

    /// Send SIGTERM and wait for the manager to exit.
    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Wait for the manager to exit, killing it once `timeout` is over.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("failed to check procmgrd status") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed procmgrd");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// PIDs from "spawned (pid=NNN)" log lines.
    pub fn spawned_pids(&self) -> Vec<u32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter_map(|l| {
                let marker = "spawned (pid=";
                let start = l.find(marker)? + marker.len();
                let end = l[start..].find(|c: char| !c.is_ascii_digit())? + start;
                l[start..end].parse().ok()
            })
            .collect()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Manager configuration with the test secret, listening on `port`.
pub fn manager_config(port: u16, auto_start: bool, services: Value) -> Value {
    json!({
        "name": "PM test",
        "description": "integration testing",
        "port": port,
        "secret": SECRET,
        "autoStartServices": auto_start,
        "services": services,
    })
}

/// Write `procmgr.json` into `dir` and return its path.
pub fn write_config(dir: &Path, config: &Value) -> PathBuf {
    let path = dir.join("procmgr.json");
    std::fs::write(&path, serde_json::to_string_pretty(config).unwrap())
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    path
}

/// Raw protocol request over a fresh connection; returns the HTTP status and
/// the JSON body.
pub fn query(port: u16, secret: &str, action: &str, options: Value) -> (u16, Value) {
    let body = json!({
        "action": action,
        "options": options,
        "secret": secret,
        "version": VERSION,
    })
    .to_string();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to manager");
    stream.set_read_timeout(Some(DEFAULT_TIMEOUT)).unwrap();
    write!(
        stream,
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    let (head, payload) = response.split_once("\r\n\r\n").expect("malformed HTTP response");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("missing HTTP status");
    (status, serde_json::from_str(payload).expect("response is not JSON"))
}

/// Wait until the manager on `port` answers a ping.
pub fn wait_for_ping(port: u16, timeout: Duration) -> bool {
    wait_until(
        || {
            TcpStream::connect(("127.0.0.1", port)).is_ok()
                && query(port, SECRET, "ping", Value::Null).0 == 200
        },
        timeout,
    )
}

/// Run the `procmgr` client against `config_path`.
pub fn run_client(config_path: &Path, args: &[&str]) -> Output {
    let bin = env!("CARGO_BIN_EXE_procmgr");
    let output = Command::new(bin)
        .env("PROCMGR_CONFIG_PATH", config_path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run procmgr");
    eprintln!(
        "[client {args:?}] {}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(|| !pid_is_alive(pid), timeout)
}
