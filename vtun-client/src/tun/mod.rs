//! Tunnel devices and their configuration
//!
//! Device creation goes through the platform's tun API directly; addresses,
//! MTU and routes are applied with the platform's network tools (`ip` on
//! Linux, `ifconfig`/`route` on macOS), the same way an administrator would.

use std::fmt;
use std::io;
use std::process::Command;

use vtun_core::ClientConfig;

#[cfg(any(target_os = "linux", test))]
mod linux;

#[cfg(any(target_os = "macos", test))]
mod darwin;

#[cfg(target_os = "linux")]
pub use linux::TunDevice as Device;

#[cfg(target_os = "macos")]
pub use darwin::UtunDevice as Device;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("vtun-client supports Linux and macOS only");

/// One external configuration command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl SetupCommand {
    pub fn new(program: &'static str, args: &[&str]) -> Self {
        SetupCommand {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn run(&self) -> io::Result<()> {
        log::debug!("Running: {}", self);
        let status = Command::new(self.program).args(&self.args).status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("`{}` failed with {}", self, status),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SetupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Apply MTU, addresses and extra routes to the device
pub fn configure(ifname: &str, config: &ClientConfig) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    let commands = linux::setup_commands(ifname, config);
    #[cfg(target_os = "macos")]
    let commands = darwin::setup_commands(ifname, config);

    for command in &commands {
        command.run()?;
    }
    log::info!("Configured {} ({} commands)", ifname, commands.len());
    Ok(())
}
