//! Interface addresses (`getifaddrs(3)`) and index-to-name lookup

use std::io;
use std::net::Ipv4Addr;

use super::InterfaceAddr;

/// Enumerate IPv4 interface addresses in the order the OS reports them
///
/// Loopback is included: callers look interfaces up by name.
#[cfg(unix)]
pub fn ipv4_interface_addrs() -> io::Result<Vec<InterfaceAddr>> {
    use std::ffi::CStr;

    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && !ifa.ifa_name.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();

                    addrs.push(InterfaceAddr {
                        name,
                        addr: Ipv4Addr::from(ip_bytes),
                    });
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(addrs)
}

/// Name of the interface with kernel index `index`
#[cfg(unix)]
pub fn interface_name(index: u32) -> Option<String> {
    use std::ffi::CStr;

    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    unsafe {
        let name = libc::if_indextoname(index, buf.as_mut_ptr());
        if name.is_null() {
            return None;
        }
        Some(CStr::from_ptr(name).to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
pub fn interface_name(_index: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
pub fn ipv4_interface_addrs() -> io::Result<Vec<InterfaceAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration not supported on this platform",
    ))
}

// ============================================================================
// Tests
// ============================================================================
