use anyhow::{bail, Context, Result};
use managed_packages::{parse_dpkg_list, PackageBackend};
use std::collections::HashSet;
use std::process::Command;
use tracing::{debug, warn};

// Constants
const DPKG: &str = "dpkg";
const APT: &str = "apt";
const SUDO: &str = "sudo";

// Check whether the process already has root privileges
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

// Ask dpkg for the architecture bare package names resolve to
fn native_architecture() -> Result<String> {
    let output = Command::new(DPKG)
        .arg("--print-architecture")
        .output()
        .with_context(|| format!("failed to run {DPKG} --print-architecture"))?;

    if !output.status.success() {
        bail!("{DPKG} --print-architecture returned {}", output.status);
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// apt arguments for one package; `--` keeps names from being read as options
fn apt_args<'a>(action: &'a str, package: &'a str) -> [&'a str; 4] {
    [action, "-y", "--", package]
}

// Debian package database and apt, escalated through sudo when not root
pub struct Apt {
    use_sudo: bool,
}

impl Default for Apt {
    fn default() -> Self {
        Self::new()
    }
}

impl Apt {
    pub fn new() -> Self {
        let use_sudo = !is_root();
        if use_sudo {
            debug!("not running as root, package changes will go through {SUDO}");
        }
        Self { use_sudo }
    }

    fn privileged(&self, args: &[&str]) -> Command {
        let mut command = if self.use_sudo {
            let mut command = Command::new(SUDO);
            command.arg(APT);
            command
        } else {
            Command::new(APT)
        };
        command.args(args);
        command
    }

    // Run apt with the terminal attached so its progress stays visible
    fn run_apt(&self, args: &[&str]) -> Result<()> {
        let mut command = self.privileged(args);
        let command_line = format!("{APT} {}", args.join(" "));
        debug!(?command, "running package manager");

        let status = command
            .status()
            .with_context(|| format!("failed to run {command_line}"))?;
        if !status.success() {
            bail!("{command_line} returned {status}");
        }

        Ok(())
    }
}

impl PackageBackend for Apt {
    fn installed_packages(&self) -> Result<HashSet<String>> {
        let native_arch = match native_architecture() {
            Ok(arch) => Some(arch),
            Err(e) => {
                warn!("multi-arch names will only match qualified: {e:#}");
                None
            }
        };

        debug!("querying package database with {DPKG} -l");
        let output = Command::new(DPKG)
            .arg("-l")
            .output()
            .with_context(|| format!("failed to run {DPKG} -l"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{DPKG} -l returned {}: {}", output.status, stderr.trim());
        }

        let installed = parse_dpkg_list(
            &String::from_utf8_lossy(&output.stdout),
            native_arch.as_deref(),
        );
        debug!(count = installed.len(), ?native_arch, "parsed installed packages");
        Ok(installed)
    }

    fn install(&mut self, package: &str) -> Result<()> {
        self.run_apt(&apt_args("install", package))
    }

    fn purge(&mut self, package: &str) -> Result<()> {
        self.run_apt(&apt_args("purge", package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn command_line(command: &Command) -> (String, Vec<String>) {
        let program = command.get_program().to_string_lossy().into_owned();
        let args = command
            .get_args()
            .map(OsStr::to_string_lossy)
            .map(|arg| arg.into_owned())
            .collect();
        (program, args)
    }

    #[test]
    fn test_install_through_sudo() {
        let apt = Apt { use_sudo: true };
        let (program, args) = command_line(&apt.privileged(&apt_args("install", "curl")));

        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["apt", "install", "-y", "--", "curl"]);
    }

    #[test]
    fn test_purge_as_root() {
        let apt = Apt { use_sudo: false };
        let (program, args) = command_line(&apt.privileged(&apt_args("purge", "telnet")));

        assert_eq!(program, "apt");
        assert_eq!(args, vec!["purge", "-y", "--", "telnet"]);
    }

    // A leading dash stays a package name after the separator
    #[test]
    fn test_dashed_package_name() {
        let args = apt_args("install", "-f");
        assert_eq!(args, ["install", "-y", "--", "-f"]);
    }
}
