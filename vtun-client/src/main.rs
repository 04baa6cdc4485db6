//! vtun-client
//!
//! Point-to-point tunnel client: creates a TUN/utun interface, configures
//! its addresses and routes, and relays its packets to a remote peer over
//! UDP with shared-key authentication and optional AEAD encryption.

#[cfg(not(unix))]
compile_error!("vtun-client only supports Linux and macOS");

use std::path::PathBuf;

use clap::Parser;
use ipnet::IpNet;
use vtun_core::config::{DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MTU, DEFAULT_RECONNECT_TIMEOUT};
use vtun_core::crypto::{CipherKind, SharedKey};
use vtun_core::{parse_net, run_client, ClientConfig, ClientError, TunnelDevice};

mod tun;

#[derive(Parser, Debug)]
#[command(name = "vtun-client")]
#[command(version)]
#[command(about = "Point-to-point UDP virtual tunnel client")]
struct Args {
    /// Peer to connect to (HOST:PORT, IPv6 hosts in brackets)
    #[arg(short = 'r', long, value_name = "HOST:PORT")]
    remote: String,

    /// Local tunnel IPv4 address, e.g. 10.7.0.2/24
    #[arg(short = 'a', long = "ipv4-addr", value_name = "ADDR/PREFIX", value_parser = parse_net)]
    ipv4_addr: Option<IpNet>,

    /// Local tunnel IPv6 address, e.g. fd00:7::2/64
    #[arg(short = 'A', long = "ipv6-addr", value_name = "ADDR/PREFIX", value_parser = parse_net)]
    ipv6_addr: Option<IpNet>,

    /// Tunnel interface MTU
    #[arg(short = 'm', long, default_value_t = DEFAULT_MTU)]
    mtu: u32,

    /// Tunnel interface name (utunN on macOS)
    #[arg(short = 'n', long)]
    ifname: Option<String>,

    /// Shared password
    #[arg(short = 'e', long = "key", value_name = "PASSWORD")]
    key: Option<String>,

    /// Payload cipher: aes-128, aes-256 or chacha20 (requires --key)
    #[arg(short = 't', long)]
    cipher: Option<CipherKind>,

    /// Seconds of silence before reconnecting
    #[arg(short = 'R', long = "reconnect-timeout", default_value_t = DEFAULT_RECONNECT_TIMEOUT)]
    reconnect_timeout: u64,

    /// Seconds between keepalives
    #[arg(short = 'K', long = "keepalive", default_value_t = DEFAULT_KEEPALIVE_TIMEOUT)]
    keepalive_timeout: u64,

    /// Keep retrying if the peer name does not resolve at startup
    #[arg(short = 'w', long = "wait-dns")]
    wait_dns: bool,

    /// Run in the background
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Write the process ID to this file
    #[arg(short = 'p', long = "pidfile")]
    pid_file: Option<PathBuf>,

    /// Local source address for the UDP socket
    #[arg(short = 'b', long = "bind-addr", conflicts_with = "bind_if")]
    bind_addr: Option<String>,

    /// Use this interface's IPv4 address as the source, re-read on every reconnect
    #[arg(short = 'I', long = "bind-if")]
    bind_if: Option<String>,

    /// Route a network through the tunnel (repeatable)
    #[arg(long = "route", value_name = "CIDR", value_parser = parse_net)]
    routes: Vec<IpNet>,
}

impl Args {
    fn into_config(self) -> Result<ClientConfig, String> {
        if self.cipher.is_some() && self.key.is_none() {
            return Err("--cipher requires --key".to_string());
        }

        Ok(ClientConfig {
            reconnect_timeout: self.reconnect_timeout,
            keepalive_timeout: self.keepalive_timeout,
            shared_key: SharedKey::from_password(self.key.as_deref()),
            cipher: self.cipher,
            tunnel_ipv4: self.ipv4_addr,
            tunnel_ipv6: self.ipv6_addr,
            bind_addr: self.bind_addr,
            bind_if: self.bind_if,
            wait_dns: self.wait_dns,
            ifname: self.ifname,
            mtu: self.mtu,
            pid_file: self.pid_file,
            daemon: self.daemon,
            routes: self.routes,
        })
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let remote = args.remote.clone();
    let config = args.into_config()?;

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    if config.keepalive_timeout >= config.reconnect_timeout {
        log::warn!(
            "Keepalive interval ({}s) is not below the reconnect timeout ({}s); the link may be rebuilt while idle",
            config.keepalive_timeout,
            config.reconnect_timeout
        );
    }

    log::info!("vtun-client starting");
    log::info!("   Remote:  {}", remote);
    if let Some(cidr) = &config.tunnel_ipv4 {
        log::info!("   IPv4:    {}", cidr);
    }
    if let Some(cidr) = &config.tunnel_ipv6 {
        log::info!("   IPv6:    {}", cidr);
    }

    let device = tun::Device::open(config.ifname.as_deref())?;
    tun::configure(device.name(), &config)?;

    match run_client(device, &remote, &config) {
        Ok(never) => match never {},
        Err(e) => {
            report(&e);
            Err(e.into())
        }
    }
}

fn report(e: &ClientError) {
    log::error!("Client stopped: {} (code {})", e, e.code());
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["vtun-client", "-r", "peer.example:1414"]).unwrap();
        assert_eq!(args.remote, "peer.example:1414");

        let config = args.into_config().unwrap();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.reconnect_timeout, DEFAULT_RECONNECT_TIMEOUT);
        assert_eq!(config.keepalive_timeout, DEFAULT_KEEPALIVE_TIMEOUT);
        assert!(config.cipher.is_none());
        assert!(!config.daemon);
        assert!(config.routes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_command_line() {
        let args = Args::try_parse_from([
            "vtun-client",
            "-r",
            "[2001:db8::1]:1414",
            "-a",
            "10.7.0.2/24",
            "-A",
            "fd00:7::2/64",
            "-m",
            "1400",
            "-n",
            "vt0",
            "-e",
            "secret",
            "-t",
            "chacha20",
            "-R",
            "30",
            "-K",
            "5",
            "-w",
            "-d",
            "-p",
            "/run/vtun.pid",
            "-I",
            "eth0",
            "--route",
            "192.168.50.0/24",
            "--route",
            "fd00:50::/48",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.tunnel_ipv4, Some("10.7.0.2/24".parse().unwrap()));
        assert_eq!(config.tunnel_ipv6, Some("fd00:7::2/64".parse().unwrap()));
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.ifname.as_deref(), Some("vt0"));
        assert_eq!(config.cipher, Some(CipherKind::ChaCha20Poly1305));
        assert_eq!(config.reconnect_timeout, 30);
        assert_eq!(config.keepalive_timeout, 5);
        assert!(config.wait_dns);
        assert!(config.daemon);
        assert_eq!(config.pid_file, Some(PathBuf::from("/run/vtun.pid")));
        assert_eq!(config.bind_if.as_deref(), Some("eth0"));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.shared_key.auth_key(),
            SharedKey::from_password(Some("secret")).auth_key()
        );
    }

    #[test]
    fn test_remote_is_required() {
        assert!(Args::try_parse_from(["vtun-client", "-a", "10.7.0.2/24"]).is_err());
    }

    #[test]
    fn test_bad_cidr_rejected() {
        assert!(Args::try_parse_from(["vtun-client", "-r", "h:1", "-a", "10.7.0.2/40"]).is_err());
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        assert!(Args::try_parse_from(["vtun-client", "-r", "h:1", "-e", "k", "-t", "rot13"]).is_err());
    }

    #[test]
    fn test_cipher_requires_key() {
        let args = Args::try_parse_from(["vtun-client", "-r", "h:1", "-t", "aes-256"]).unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_bind_options_conflict() {
        let parsed = Args::try_parse_from(["vtun-client", "-r", "h:1", "-b", "10.0.0.1", "-I", "eth0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_keepalive_above_reconnect_accepted() {
        let args = Args::try_parse_from(["vtun-client", "-r", "h:1", "-R", "47", "-K", "60"]).unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.keepalive_timeout, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bare_address_is_host_network() {
        let args = Args::try_parse_from(["vtun-client", "-r", "h:1", "-a", "10.7.0.2"]).unwrap();
        assert_eq!(args.ipv4_addr, Some("10.7.0.2/32".parse().unwrap()));
    }
}
