//! Linux TUN device
//!
//! Opened with `IFF_TUN` and without `IFF_NO_PI`, so every read and write
//! carries the 4-byte `struct tun_pi` naming the packet's ethertype.

use ipnet::IpNet;
use vtun_core::ClientConfig;

use super::SetupCommand;

#[cfg(target_os = "linux")]
pub use device::TunDevice;

#[cfg(target_os = "linux")]
mod device {
    use std::ffi::CStr;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use libc::{c_char, c_short, c_void, IFF_TUN, O_NONBLOCK, O_RDWR};
    use vtun_core::frame::{PacketInfo, TunnelDevice, TunnelFrame};

    /// TUNSETIFF ioctl number
    const TUNSETIFF: libc::c_ulong = 0x400454ca;

    /// Interface request structure
    #[repr(C)]
    struct IfReq {
        ifr_name: [c_char; 16],
        ifr_flags: c_short,
        _pad: [u8; 22],
    }

    pub struct TunDevice {
        fd: OwnedFd,
        name: String,
    }

    impl TunDevice {
        /// Create (or attach to) a TUN interface
        ///
        /// Without a name the kernel picks the next free `tunN`.
        pub fn open(name: Option<&str>) -> io::Result<Self> {
            unsafe {
                let fd = libc::open(
                    b"/dev/net/tun\0".as_ptr() as *const c_char,
                    O_RDWR | O_NONBLOCK | libc::O_CLOEXEC,
                );
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let fd = OwnedFd::from_raw_fd(fd);

                let mut ifr = IfReq {
                    ifr_name: [0; 16],
                    ifr_flags: IFF_TUN as c_short,
                    _pad: [0; 22],
                };
                if let Some(name) = name {
                    for (i, byte) in name.bytes().take(15).enumerate() {
                        ifr.ifr_name[i] = byte as c_char;
                    }
                }

                if libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut ifr as *mut _ as *mut c_void) < 0 {
                    return Err(io::Error::last_os_error());
                }

                let name = CStr::from_ptr(ifr.ifr_name.as_ptr())
                    .to_string_lossy()
                    .into_owned();
                log::info!("Created TUN device: {}", name);

                Ok(TunDevice { fd, name })
            }
        }
    }

    impl AsRawFd for TunDevice {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    impl TunnelDevice for TunDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn read_frame<'a>(&mut self, buf: &'a mut [u8]) -> io::Result<TunnelFrame<'a>> {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            PacketInfo::Linux
                .parse(&buf[..n as usize])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short read from tun device"))
        }

        fn write_frame(&mut self, frame: &TunnelFrame<'_>) -> io::Result<usize> {
            let header = PacketInfo::Linux.encode(frame.family);
            let iov = [
                libc::iovec {
                    iov_base: header.as_ptr() as *mut c_void,
                    iov_len: header.len(),
                },
                libc::iovec {
                    iov_base: frame.payload.as_ptr() as *mut c_void,
                    iov_len: frame.payload.len(),
                },
            ];

            let n = unsafe { libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }
}

/// `ip` invocations that bring the interface up with its addresses and routes
pub fn setup_commands(ifname: &str, config: &ClientConfig) -> Vec<SetupCommand> {
    let mtu = config.mtu.to_string();
    let mut commands = vec![
        SetupCommand::new("ip", &["link", "set", "dev", ifname, "mtu", &mtu]),
        SetupCommand::new("ip", &["link", "set", "dev", ifname, "up"]),
    ];

    if let Some(cidr) = &config.tunnel_ipv4 {
        commands.push(SetupCommand::new(
            "ip",
            &["-4", "addr", "add", &cidr.to_string(), "dev", ifname],
        ));
    }
    if let Some(cidr) = &config.tunnel_ipv6 {
        commands.push(SetupCommand::new(
            "ip",
            &["-6", "addr", "add", &cidr.to_string(), "dev", ifname],
        ));
    }

    for route in &config.routes {
        let family = match route {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };
        commands.push(SetupCommand::new(
            "ip",
            &[family, "route", "add", &route.to_string(), "dev", ifname],
        ));
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_setup() {
        let commands = setup_commands("tun0", &ClientConfig::default());
        let lines: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            lines,
            vec!["ip link set dev tun0 mtu 1300", "ip link set dev tun0 up"]
        );
    }

    #[test]
    fn test_full_setup() {
        let mut config = ClientConfig::default();
        config.mtu = 1400;
        config.tunnel_ipv4 = Some("10.7.0.2/24".parse().unwrap());
        config.tunnel_ipv6 = Some("fd00:7::2/64".parse().unwrap());
        config.routes = vec![
            "192.168.50.0/24".parse().unwrap(),
            "fd00:50::/48".parse().unwrap(),
        ];

        let lines: Vec<String> = setup_commands("vt0", &config)
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(
            lines,
            vec![
                "ip link set dev vt0 mtu 1400",
                "ip link set dev vt0 up",
                "ip -4 addr add 10.7.0.2/24 dev vt0",
                "ip -6 addr add fd00:7::2/64 dev vt0",
                "ip -4 route add 192.168.50.0/24 dev vt0",
                "ip -6 route add fd00:50::/48 dev vt0",
            ]
        );
    }
}
