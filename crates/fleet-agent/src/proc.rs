//! `/proc` reader.
//!
//! The root is configurable so tests can point it at a fixture tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{AgentError, AgentResult};

/// What the scanner needs to identify a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: i32,
    pub ppid: i32,
    /// Resolved executable path, or `argv[0]` when unreadable.
    pub exe: String,
    pub cmdline: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ProcInfo {
    /// File name of the executable.
    pub fn exe_name(&self) -> &str {
        self.exe.rsplit('/').next().unwrap_or(&self.exe)
    }

    /// Value of `-D{name}=…` / `--{name}=…` style arguments.
    pub fn arg_value(&self, prefix: &str) -> Option<&str> {
        self.cmdline.iter().find_map(|arg| arg.strip_prefix(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    /// `kill(pid, 0)`.
    Signal,
    /// The pid directory still exists under the root.
    ProcDir,
}

#[derive(Debug, Clone)]
pub struct ProcReader {
    root: PathBuf,
    liveness: Liveness,
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new("/proc")
    }
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

impl ProcReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let liveness = if root == Path::new("/proc") {
            Liveness::Signal
        } else {
            Liveness::ProcDir
        };
        Self { root, liveness }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_path(&self, pid: i32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    fn read(&self, path: &Path) -> AgentResult<Vec<u8>> {
        std::fs::read(path).map_err(|e| AgentError::io(path, e))
    }

    /// Numeric entries of the root, ascending.
    pub fn pids(&self) -> AgentResult<Vec<i32>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| AgentError::io(&self.root, e))?;
        let mut pids: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn is_alive(&self, pid: i32) -> bool {
        match self.liveness {
            Liveness::Signal => match kill(Pid::from_raw(pid), None) {
                Ok(()) => true,
                Err(Errno::EPERM) => true,
                Err(_) => false,
            },
            Liveness::ProcDir => self.root.join(pid.to_string()).is_dir(),
        }
    }

    pub fn info(&self, pid: i32) -> AgentResult<ProcInfo> {
        let cmdline = split_nul(&self.read(&self.pid_path(pid, "cmdline"))?);
        if cmdline.is_empty() {
            return Err(AgentError::Process {
                pid,
                reason: "empty cmdline (kernel thread or zombie)".into(),
            });
        }
        let env = split_nul(&self.read(&self.pid_path(pid, "environ"))?)
            .into_iter()
            .filter_map(|kv| {
                let (k, v) = kv.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();
        let exe = std::fs::read_link(self.pid_path(pid, "exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| cmdline[0].clone());
        Ok(ProcInfo {
            pid,
            ppid: self.ppid(pid)?,
            exe,
            cmdline,
            env,
        })
    }

    /// Parent pid from `stat`; the command name may itself contain spaces.
    pub fn ppid(&self, pid: i32) -> AgentResult<i32> {
        let raw = self.read(&self.pid_path(pid, "stat"))?;
        let stat = String::from_utf8_lossy(&raw);
        let after_comm = stat
            .rfind(')')
            .map(|i| &stat[i + 1..])
            .ok_or_else(|| AgentError::Process {
                pid,
                reason: "malformed stat".into(),
            })?;
        after_comm
            .split_whitespace()
            .nth(1)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| AgentError::Process {
                pid,
                reason: "stat has no ppid".into(),
            })
    }

    pub fn threads(&self, pid: i32) -> AgentResult<i64> {
        let raw = self.read(&self.pid_path(pid, "status"))?;
        String::from_utf8_lossy(&raw)
            .lines()
            .find_map(|line| line.strip_prefix("Threads:"))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| AgentError::Process {
                pid,
                reason: "status has no Threads".into(),
            })
    }

    pub fn fd_count(&self, pid: i32) -> AgentResult<i64> {
        let dir = self.pid_path(pid, "fd");
        let entries = std::fs::read_dir(&dir).map_err(|e| AgentError::io(&dir, e))?;
        Ok(entries.count() as i64)
    }

    /// Inodes of the sockets a process holds open.
    pub fn socket_inodes(&self, pid: i32) -> AgentResult<BTreeSet<u64>> {
        let dir = self.pid_path(pid, "fd");
        let entries = std::fs::read_dir(&dir).map_err(|e| AgentError::io(&dir, e))?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter_map(|target| {
                target
                    .to_str()?
                    .strip_prefix("socket:[")?
                    .strip_suffix(']')?
                    .parse()
                    .ok()
            })
            .collect())
    }

    /// Contents of a host-wide file such as `net/tcp`.
    pub fn read_host_file(&self, name: &str) -> AgentResult<String> {
        let raw = self.read(&self.root.join(name))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::os::unix::fs::symlink;
    use std::path::Path;

    /// Lay out `/proc/{pid}` files for one fake process.
    pub fn process(root: &Path, pid: i32, ppid: i32, exe: &str, argv: &[&str], env: &[(&str, &str)]) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(dir.join("fd")).unwrap();
        std::fs::write(dir.join("cmdline"), argv.join("\0") + "\0").unwrap();
        let environ: String = env.iter().map(|(k, v)| format!("{k}={v}\0")).collect();
        std::fs::write(dir.join("environ"), environ).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} (my proc) S {ppid} {pid} {pid} 0 -1 4194560"),
        )
        .unwrap();
        std::fs::write(dir.join("status"), "Name:\tjava\nThreads:\t42\n").unwrap();
        symlink(exe, dir.join("exe")).unwrap();
    }

    pub fn socket(root: &Path, pid: i32, fd: u32, inode: u64) {
        let link = root.join(pid.to_string()).join("fd").join(fd.to_string());
        symlink(format!("socket:[{inode}]"), link).unwrap();
    }
}
