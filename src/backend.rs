use std::fmt;
use std::io;

pub mod recorder;
pub mod system;

pub use recorder::Recorder;
pub use system::{DetectError, System, detect_dialect};

/// Kernel tool family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tool {
    /// `ipset` and `ipset restore`
    IpSet,
    /// `iptables` and `iptables-restore` on the filter table
    IpTables,
}
impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IpSet => "ipset",
            Self::IpTables => "iptables",
        })
    }
}

/// iptables flavor in use on the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Nft,
    Legacy,
}

/// Result of a tool invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}
impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Error text as reported by the tool. ipset reports on stdout in some versions.
    pub fn message(&self) -> String {
        match (self.stderr.trim(), self.stdout.trim()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{err}\n{out}"),
        }
    }
}
impl From<std::process::Output> for Output {
    fn from(out: std::process::Output) -> Self {
        Self {
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

/// Capability to program the kernel packet filter.
pub trait KernelBackend: Send + Sync {
    /// Feed a batch file to the tool's restore command.
    fn restore(&self, tool: Tool, batch: &str) -> io::Result<Output>;

    /// Run a single command of the tool.
    fn exec(&self, tool: Tool, args: &[&str]) -> io::Result<Output>;
}
