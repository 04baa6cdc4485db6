//! macOS utun device
//!
//! utun is reached through a kernel control socket. Frames carry a 4-byte
//! big-endian address family in front of the IP packet.

use ipnet::IpNet;
use vtun_core::ClientConfig;

use super::SetupCommand;

#[cfg(target_os = "macos")]
pub use device::UtunDevice;

#[cfg(target_os = "macos")]
mod device {
    use std::ffi::CStr;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use libc::{
        c_char, c_int, c_void, sockaddr, sockaddr_ctl, socklen_t, AF_SYSTEM, CTLIOCGINFO,
        PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL,
    };
    use vtun_core::frame::{PacketInfo, TunnelDevice, TunnelFrame};

    #[repr(C)]
    struct CtlInfo {
        ctl_id: u32,
        ctl_name: [c_char; 96],
    }

    const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control\0";
    const UTUN_OPT_IFNAME: c_int = 2;
    const AF_SYS_CONTROL: u16 = 2;

    pub struct UtunDevice {
        fd: OwnedFd,
        name: String,
    }

    /// Kernel unit for a requested `utunN` name (unit 0 lets the kernel pick)
    fn unit_for(name: Option<&str>) -> io::Result<u32> {
        match name {
            None => Ok(0),
            Some(name) => name
                .strip_prefix("utun")
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| n + 1)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("utun device name must be utunN, got {}", name),
                    )
                }),
        }
    }

    impl UtunDevice {
        pub fn open(name: Option<&str>) -> io::Result<Self> {
            let unit = unit_for(name)?;

            unsafe {
                let fd = libc::socket(PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let fd = OwnedFd::from_raw_fd(fd);

                let mut ctl_info = CtlInfo {
                    ctl_id: 0,
                    ctl_name: [0; 96],
                };
                for (i, &byte) in UTUN_CONTROL_NAME.iter().enumerate() {
                    ctl_info.ctl_name[i] = byte as c_char;
                }
                if libc::ioctl(fd.as_raw_fd(), CTLIOCGINFO, &mut ctl_info as *mut _ as *mut c_void) < 0 {
                    return Err(io::Error::last_os_error());
                }

                let mut addr: sockaddr_ctl = std::mem::zeroed();
                addr.sc_len = std::mem::size_of::<sockaddr_ctl>() as u8;
                addr.sc_family = AF_SYSTEM as u8;
                addr.ss_sysaddr = AF_SYS_CONTROL;
                addr.sc_id = ctl_info.ctl_id;
                addr.sc_unit = unit;

                if libc::connect(
                    fd.as_raw_fd(),
                    &addr as *const _ as *const sockaddr,
                    std::mem::size_of::<sockaddr_ctl>() as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }

                let mut name_buf = [0u8; 32];
                let mut name_len = name_buf.len() as socklen_t;
                if libc::getsockopt(
                    fd.as_raw_fd(),
                    SYSPROTO_CONTROL,
                    UTUN_OPT_IFNAME,
                    name_buf.as_mut_ptr() as *mut c_void,
                    &mut name_len,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
                let name = CStr::from_bytes_until_nul(&name_buf)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utun name"))?
                    .to_string_lossy()
                    .into_owned();

                let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
                if flags < 0 || libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);

                log::info!("Created utun device: {}", name);
                Ok(UtunDevice { fd, name })
            }
        }
    }

    impl AsRawFd for UtunDevice {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    impl TunnelDevice for UtunDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn read_frame<'a>(&mut self, buf: &'a mut [u8]) -> io::Result<TunnelFrame<'a>> {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            PacketInfo::Darwin
                .parse(&buf[..n as usize])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short read from utun device"))
        }

        fn write_frame(&mut self, frame: &TunnelFrame<'_>) -> io::Result<usize> {
            let header = PacketInfo::Darwin.encode(frame.family);
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

            let n = unsafe { libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), iov.len() as c_int) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }
}

/// `ifconfig`/`route` invocations for a point-to-point utun interface
///
/// utun has no implicit subnet route, so one is added for the IPv4 prefix.
pub fn setup_commands(ifname: &str, config: &ClientConfig) -> Vec<SetupCommand> {
    let mtu = config.mtu.to_string();
    let mut commands = Vec::new();

    match config.tunnel_ipv4 {
        Some(IpNet::V4(v4)) => {
            let local = v4.addr().to_string();
            let netmask = v4.netmask().to_string();
            commands.push(SetupCommand::new(
                "ifconfig",
                &[ifname, "inet", &local, &local, "netmask", &netmask, "mtu", &mtu, "up"],
            ));
            if v4.prefix_len() < 32 {
                let subnet = v4.trunc().to_string();
                commands.push(SetupCommand::new(
                    "route",
                    &["-n", "add", "-net", &subnet, "-interface", ifname],
                ));
            }
        }
        _ => commands.push(SetupCommand::new("ifconfig", &[ifname, "mtu", &mtu, "up"])),
    }

    if let Some(v6) = &config.tunnel_ipv6 {
        let prefix = v6.prefix_len().to_string();
        commands.push(SetupCommand::new(
            "ifconfig",
            &[ifname, "inet6", &v6.addr().to_string(), "prefixlen", &prefix],
        ));
    }

    for route in &config.routes {
        let net = route.to_string();
        if let IpNet::V4(_) = route {
            commands.push(SetupCommand::new(
                "route",
                &["-n", "add", "-net", &net, "-interface", ifname],
            ));
        } else {
            commands.push(SetupCommand::new(
                "route",
                &["-n", "add", "-inet6", &net, "-interface", ifname],
            ));
        }
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(commands: &[SetupCommand]) -> Vec<String> {
        commands.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_subnet_route_uses_network_address() {
        let mut config = ClientConfig::default();
        config.tunnel_ipv4 = Some("10.7.9.2/16".parse().unwrap());

        let lines = lines(&setup_commands("utun2", &config));
        assert_eq!(lines[1], "route -n add -net 10.7.0.0/16 -interface utun2");
    }

    #[test]
    fn test_without_addresses() {
        let commands = setup_commands("utun5", &ClientConfig::default());
        assert_eq!(lines(&commands), vec!["ifconfig utun5 mtu 1300 up"]);
    }

    #[test]
    fn test_full_setup() {
        let mut config = ClientConfig::default();
        config.tunnel_ipv4 = Some("10.7.0.2/24".parse().unwrap());
        config.tunnel_ipv6 = Some("fd00:7::2/64".parse().unwrap());
        config.routes = vec![
            "192.168.50.0/24".parse().unwrap(),
            "fd00:50::/48".parse().unwrap(),
        ];

        assert_eq!(
            lines(&setup_commands("utun5", &config)),
            vec![
                "ifconfig utun5 inet 10.7.0.2 10.7.0.2 netmask 255.255.255.0 mtu 1300 up",
                "route -n add -net 10.7.0.0/24 -interface utun5",
                "ifconfig utun5 inet6 fd00:7::2 prefixlen 64",
                "route -n add -net 192.168.50.0/24 -interface utun5",
                "route -n add -inet6 fd00:50::/48 -interface utun5",
            ]
        );
    }

    #[test]
    fn test_host_address_has_no_subnet_route() {
        let mut config = ClientConfig::default();
        config.tunnel_ipv4 = Some(vtun_core::parse_net("10.7.0.2").unwrap());

        assert_eq!(
            lines(&setup_commands("utun1", &config)),
            vec!["ifconfig utun1 inet 10.7.0.2 10.7.0.2 netmask 255.255.255.255 mtu 1300 up"]
        );
    }
}
