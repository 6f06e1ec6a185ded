//! Helpers for driving the trustd binary

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const BINARY: &str = env!("CARGO_BIN_EXE_trustd");

pub fn uid() -> u32 {
    unsafe { libc::getuid() }
}

/// A trustd process with its stderr collected line by line
pub struct Daemon {
    child: Child,
    log: mpsc::Receiver<String>,
}

impl Daemon {
    pub fn spawn(args: &[&str], envs: &[(&str, &str)]) -> Self {
        let mut child = Command::new(BINARY)
            .args(args)
            .envs(envs.iter().copied())
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let stderr = child.stderr.take().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                eprintln!("[trustd] {}", line);
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self { child, log: rx }
    }

    /// Block until a log line containing `needle` shows up
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.log.recv_timeout(left) {
                Ok(line) if line.contains(needle) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    }

    pub fn stdin(&mut self) -> ChildStdin {
        self.child.stdin.take().unwrap()
    }

    pub fn stdout(&mut self) -> ChildStdout {
        self.child.stdout.take().unwrap()
    }

    /// SIGTERM, then wait for the exit status
    pub fn terminate(mut self) -> ExitStatus {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }

        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("trustd did not stop after SIGTERM");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// SIGKILL: no chance to detach or clean up
    pub fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Feed `count` requests for distinct features to a stub over its stdin and
/// collect the answers from its stdout
pub fn ask_over_stdio(stub: &mut Daemon, count: u64) -> Vec<String> {
    let mut stdin = stub.stdin();
    let stdout = stub.stdout();

    for feature in 0..count {
        writeln!(stdin, "{} {} {}", 1000 + feature, uid(), feature).unwrap();
    }
    stdin.flush().unwrap();

    let mut answers = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    for _ in 0..count {
        answers.push(lines.next().unwrap().unwrap());
    }

    // Keep stdin open: the stub must stop because of the signal, not EOF
    std::mem::forget(stdin);
    answers
}
