//! Process description utilities

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// What we can learn about a requesting process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    /// Look up a process by pid. Returns `None` if it is gone.
    pub fn lookup(pid: u32) -> Option<Self> {
        let mut sys = System::new();
        let pids = [Pid::from_u32(pid)];
        sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        sys.process(Pid::from_u32(pid)).map(|p| Self {
            pid,
            name: p.name().to_string_lossy().to_string(),
            exe: p.exe().map(|e| e.to_path_buf()),
        })
    }

    /// Human readable application label, falling back to the bare pid
    pub fn describe(pid: u32) -> String {
        match Self::lookup(pid) {
            Some(info) => info.to_string(),
            None => format!("pid {}", pid),
        }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exe {
            Some(exe) => write!(f, "{} ({}, pid {})", self.name, exe.display(), self.pid),
            None => write!(f, "{} (pid {})", self.name, self.pid),
        }
    }
}
