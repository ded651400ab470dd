//! Network addresses as carried in `version` and `addr` messages
//!
//! The IP is always stored as 16 bytes (IPv4 mapped into IPv6). The
//! `hostname` string ("ip:port", IPv6 in brackets) is the identity key used
//! by the address manager and the peer list.

use crate::wire::encoding::{Reader, WireError};
use crate::wire::types::Services;
use bytes::BufMut;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress {
    /// IPv6 or IPv4-mapped address bytes
    pub raw: [u8; 16],
    pub port: u16,
    pub services: Services,
    /// Last-seen unix time (only serialized in `addr`)
    pub time: u64,
}

impl Default for NetAddress {
    fn default() -> Self {
        Self::from_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

impl NetAddress {
    pub const SIZE: usize = 30;
    pub const SIZE_NO_TIME: usize = 26;

    pub fn new(ip: IpAddr, port: u16, services: Services, time: u64) -> Self {
        let raw = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            raw,
            port,
            services,
            time,
        }
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), Services::empty(), 0)
    }

    /// Parse "ip:port", falling back to `default_port` for bare IPs
    pub fn from_hostname(host: &str, default_port: u16) -> Result<Self, WireError> {
        if let Ok(addr) = SocketAddr::from_str(host) {
            return Ok(Self::from_socket(addr));
        }
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        let ip = IpAddr::from_str(trimmed)
            .map_err(|_| WireError::Invalid(format!("host {}", host)))?;
        Ok(Self::new(ip, default_port, Services::empty(), 0))
    }

    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.raw);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    /// Host part only, used as the ban-list key
    pub fn host(&self) -> String {
        self.ip().to_string()
    }

    /// Canonical "ip:port" key
    pub fn hostname(&self) -> String {
        self.socket_addr().to_string()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.ip(), IpAddr::V4(_))
    }

    pub fn is_null(&self) -> bool {
        self.ip().is_unspecified()
    }

    pub fn has_services(&self, required: Services) -> bool {
        self.services.contains(required)
    }

    pub fn is_valid(&self) -> bool {
        match self.ip() {
            IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_broadcast(),
            IpAddr::V6(v6) => !v6.is_unspecified(),
        }
    }

    /// Publicly reachable address
    pub fn is_routable(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        match self.ip() {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                !(v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_multicast()
                    || v4.is_documentation()
                    || o[0] == 0
                    || (o[0] == 100 && (o[1] & 0xc0) == 64)
                    || (o[0] == 198 && (o[1] & 0xfe) == 18))
            }
            IpAddr::V6(v6) => {
                let seg = v6.segments();
                !(v6.is_loopback()
                    || v6.is_multicast()
                    || (seg[0] & 0xfe00) == 0xfc00
                    || (seg[0] & 0xffc0) == 0xfe80
                    || (seg[0] == 0x2001 && seg[1] == 0x0db8))
            }
        }
    }

    /// Crude reachability score: same address family scores higher
    pub fn reachability(&self, dest: &NetAddress) -> u8 {
        if !dest.is_routable() {
            return 0;
        }
        if self.is_ipv4() == dest.is_ipv4() {
            2
        } else {
            1
        }
    }

    /// `addr` form: time, services, ip, port
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.time as u32);
        self.encode_no_time(buf);
    }

    /// `version` form: services, ip, port
    pub fn encode_no_time<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&self.raw);
        buf.put_u16(self.port);
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let time = reader.read_u32()? as u64;
        let mut addr = Self::decode_no_time(reader)?;
        addr.time = time;
        Ok(addr)
    }

    pub fn decode_no_time(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let services = Services::from_bits_retain(reader.read_u64()?);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(reader.read_bytes(16)?);
        let port = reader.read_u16_be()?;
        Ok(Self {
            raw,
            port,
            services,
            time: 0,
        })
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hostname())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_formats() {
        let v4 = NetAddress::from_hostname("1.2.3.4:8333", 0).unwrap();
        assert_eq!(v4.hostname(), "1.2.3.4:8333");
        assert_eq!(v4.host(), "1.2.3.4");
        assert!(v4.is_ipv4());

        let v6 = NetAddress::from_hostname("[2a01::1]:18333", 0).unwrap();
        assert_eq!(v6.hostname(), "[2a01::1]:18333");

        let bare = NetAddress::from_hostname("5.6.7.8", 8333).unwrap();
        assert_eq!(bare.port, 8333);
        assert!(NetAddress::from_hostname("not an ip", 1).is_err());
    }

    #[test]
    fn test_routability() {
        let routable = |s: &str| NetAddress::from_hostname(s, 8333).unwrap().is_routable();
        assert!(routable("8.8.8.8"));
        assert!(!routable("127.0.0.1"));
        assert!(!routable("10.1.2.3"));
        assert!(!routable("192.168.0.1"));
        assert!(!routable("0.0.0.0"));
        assert!(!routable("fe80::1"));
        assert!(routable("2a01::1"));
    }

    #[test]
    fn test_encoding_layout() {
        let mut addr = NetAddress::from_hostname("1.2.3.4:8333", 0).unwrap();
        addr.services = Services::NETWORK | Services::WITNESS;
        addr.time = 1_500_000_000;

        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), NetAddress::SIZE);
        // Port is big-endian
        assert_eq!(&buf[28..30], &[0x20, 0x8d]);
        assert_eq!(NetAddress::decode(&mut Reader::new(&buf)).unwrap(), addr);
    }
}
