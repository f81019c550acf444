use log::{debug, info, warn};
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;

use super::{Dialect, KernelBackend, Output, Tool};

/// Runs the real kernel tools.
pub struct System {
    dialect: Dialect,
    lock_wait: String,
}

impl System {
    pub fn new(dialect: Dialect, lock_wait: u32) -> Self {
        Self {
            dialect,
            lock_wait: lock_wait.to_string(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn iptables(&self) -> &'static str {
        match self.dialect {
            Dialect::Nft => "iptables-nft",
            Dialect::Legacy => "iptables-legacy",
        }
    }

    fn iptables_restore(&self) -> &'static str {
        match self.dialect {
            Dialect::Nft => "iptables-nft-restore",
            Dialect::Legacy => "iptables-legacy-restore",
        }
    }
}

/// Run the command with `input` on its stdin, draining its output while the input is written.
fn run_with_input(cmd: &mut Command, input: &str) -> io::Result<Output> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdin = child.stdin.take();

    thread::scope(|s| {
        // dropping stdin closes it so the tool sees the end of the batch
        let writer = s.spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes())?;
                stdin.flush()?;
            }
            Ok(())
        });

        let output = child.wait_with_output();
        let written = (writer.join()).map_err(|_| io::Error::other("stdin writer panicked"))?;
        let output = output?;

        match written {
            // the tool stopped reading; its output says why
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("{:?}: input not fully read", cmd.get_program())
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        Ok(output.into())
    })
}

impl KernelBackend for System {
    fn restore(&self, tool: Tool, batch: &str) -> io::Result<Output> {
        let mut cmd = match tool {
            Tool::IpSet => {
                let mut cmd = Command::new("ipset");
                cmd.arg("restore");
                cmd
            }
            Tool::IpTables => {
                let mut cmd = Command::new(self.iptables_restore());
                cmd.args(["-w", &self.lock_wait, "-T", "filter", "--noflush"]);
                cmd
            }
        };

        run_with_input(&mut cmd, batch)
    }

    fn exec(&self, tool: Tool, args: &[&str]) -> io::Result<Output> {
        let mut cmd = match tool {
            Tool::IpSet => Command::new("ipset"),
            Tool::IpTables => {
                let mut cmd = Command::new(self.iptables());
                cmd.args(["-w", &self.lock_wait]);
                cmd
            }
        };
        debug!("{tool}: exec {}", args.join(" "));
        Ok(cmd.args(args).output()?.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("no iptables hint found and kernel release unavailable: {0}")]
    KernelRelease(io::Error),
    #[error("no iptables hint found and kernel release {0:?} is not parsable")]
    UnparsableRelease(String),
}

/// Chains that kubelet and kube-proxy leave in the mangle table of the active dialect.
const HINT_CHAINS: [&str; 2] = ["KUBE-IPTABLES-HINT", "KUBE-KUBELET-CANARY"];

/// Detect the iptables dialect used by the other node components.
pub fn detect_dialect() -> Result<Dialect, DetectError> {
    detect_with(
        |program| {
            let out = Command::new(program).args(["-t", "mangle"]).output()?;
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        },
        || std::fs::read_to_string("/proc/sys/kernel/osrelease"),
    )
}

/// Detection logic with injected probes: `save` runs the given `*-save` program on the mangle
/// table, `kernel_release` reads the running kernel version.
pub fn detect_with(
    save: impl Fn(&str) -> io::Result<String>,
    kernel_release: impl FnOnce() -> io::Result<String>,
) -> Result<Dialect, DetectError> {
    for (program, dialect) in [
        ("iptables-nft-save", Dialect::Nft),
        ("iptables-legacy-save", Dialect::Legacy),
    ] {
        match save(program) {
            Ok(out) if HINT_CHAINS.iter().any(|chain| out.contains(chain)) => {
                info!("detected iptables dialect {dialect:?} from {program}");
                return Ok(dialect);
            }
            Ok(_) => debug!("{program}: no hint chain"),
            Err(e) => warn!("{program} failed: {e}"),
        }
    }

    let release = kernel_release().map_err(DetectError::KernelRelease)?;
    let major = release
        .trim()
        .split('.')
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| DetectError::UnparsableRelease(release.trim().to_string()))?;

    let dialect = if major >= 5 {
        Dialect::Nft
    } else {
        Dialect::Legacy
    };
    info!("detected iptables dialect {dialect:?} from kernel release {}", release.trim());
    Ok(dialect)
}
