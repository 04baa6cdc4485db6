//! IPv4 routing-table introspection
//!
//! Used to pick the local source address for the UDP socket: by default the
//! client binds to the address of the interface carrying the default route,
//! and an explicitly configured address must sit on such an interface.
//!
//! Backends only provide two primitives (dump the routing table, list the
//! interface addresses); the lookups on top of them are shared:
//!
//! ```text
//! default_route_interface   exactly one default route → its interface
//! ip_of_interface           first IPv4 address of an interface
//! interface_of_ip           first interface holding an address
//! is_on_default_route       address is the first IPv4 of a default-route interface
//! ```

pub mod darwin;
pub mod ifaddrs;
pub mod linux;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

/// Routing backend for the build target
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub type SystemRouteTable = darwin::SysctlRouteTable;

/// Routing backend for the build target
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub type SystemRouteTable = linux::NetlinkRouteTable;

// ============================================================================
// Types
// ============================================================================

/// One IPv4 routing-table entry, reduced to what the lookups need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    /// Absent when the backend reports no mask for the entry
    pub netmask: Option<Ipv4Addr>,
    pub interface: String,
}

impl RouteEntry {
    /// Destination 0.0.0.0 with no mask or a zero mask
    pub fn is_default(&self) -> bool {
        self.destination.is_unspecified()
            && self.netmask.map_or(true, |mask| mask.is_unspecified())
    }
}

/// An IPv4 address assigned to an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Local address and interface the UDP socket should bind to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTarget {
    pub addr: Ipv4Addr,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No matching route, interface or address (also: lookup failed)
    NotFound,
    /// More than one default route
    Ambiguous,
    /// Text that is not an IPv4 address
    InvalidAddress(String),
    /// Address exists but not on a default-route interface
    NotOnDefaultRoute(Ipv4Addr),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NotFound => write!(f, "not found"),
            RouteError::Ambiguous => write!(f, "more than one default route"),
            RouteError::InvalidAddress(s) => write!(f, "invalid IPv4 address '{}'", s),
            RouteError::NotOnDefaultRoute(addr) => {
                write!(f, "{} is not on a default-route interface", addr)
            }
        }
    }
}

impl std::error::Error for RouteError {}

// ============================================================================
// Route Table
// ============================================================================

/// Source of routing and interface-address information
pub trait RouteTable {
    /// Dump the IPv4 routing table
    fn routes(&self) -> io::Result<Vec<RouteEntry>>;

    /// IPv4 interface addresses in enumeration order
    fn interface_addrs(&self) -> io::Result<Vec<InterfaceAddr>>;

    /// Interface of the single default route
    fn default_route_interface(&self) -> Result<String, RouteError> {
        let routes = self.routes().map_err(|e| {
            log::debug!("Routing table dump failed: {}", e);
            RouteError::NotFound
        })?;

        let mut defaults = routes.into_iter().filter(RouteEntry::is_default);
        match (defaults.next(), defaults.next()) {
            (Some(route), None) => Ok(route.interface),
            (Some(_), Some(_)) => Err(RouteError::Ambiguous),
            (None, _) => Err(RouteError::NotFound),
        }
    }

    /// First IPv4 address assigned to `name`
    fn ip_of_interface(&self, name: &str) -> Result<Ipv4Addr, RouteError> {
        let addrs = self.interface_addrs().map_err(|e| {
            log::debug!("Interface enumeration failed: {}", e);
            RouteError::NotFound
        })?;

        addrs
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.addr)
            .ok_or(RouteError::NotFound)
    }

    /// First interface holding `addr`
    fn interface_of_ip(&self, addr: Ipv4Addr) -> Result<String, RouteError> {
        let addrs = self.interface_addrs().map_err(|e| {
            log::debug!("Interface enumeration failed: {}", e);
            RouteError::NotFound
        })?;

        addrs
            .into_iter()
            .find(|a| a.addr == addr)
            .map(|a| a.name)
            .ok_or(RouteError::NotFound)
    }

    /// Whether `addr` is the first IPv4 address of some default-route interface
    ///
    /// Lookup failures also yield `false`.
    fn is_on_default_route(&self, addr: Ipv4Addr) -> bool {
        let routes = match self.routes() {
            Ok(routes) => routes,
            Err(e) => {
                log::debug!("Routing table dump failed: {}", e);
                return false;
            }
        };

        routes
            .iter()
            .filter(|r| r.is_default())
            .any(|r| self.ip_of_interface(&r.interface) == Ok(addr))
    }
}

/// Work out the local bind address
///
/// Without an explicit address the default-route interface and its first
/// address are used. An explicit address must parse, belong to some
/// interface, and be on a default-route interface.
pub fn validate_and_resolve_bind_address<T: RouteTable + ?Sized>(
    table: &T,
    explicit: Option<&str>,
) -> Result<BindTarget, RouteError> {
    match explicit {
        None => {
            let interface = table.default_route_interface()?;
            let addr = table.ip_of_interface(&interface)?;
            Ok(BindTarget { addr, interface })
        }
        Some(text) => {
            let addr: Ipv4Addr = text
                .trim()
                .parse()
                .map_err(|_| RouteError::InvalidAddress(text.to_string()))?;
            let interface = table.interface_of_ip(addr)?;
            if !table.is_on_default_route(addr) {
                return Err(RouteError::NotOnDefaultRoute(addr));
            }
            Ok(BindTarget { addr, interface })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
