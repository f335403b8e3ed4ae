//! The production resolver: libc's resolver on a blocking worker.
//!
//! `getaddrinfo`/`getnameinfo` block for as long as the upstream servers
//! take, so every call runs under `spawn_blocking`; the proxy listener is
//! never tied up behind a slow lookup. Binding the query to the selected
//! network is the system resolver's job; the netId travels with every call
//! through this seam so a substitute implementation can honor it.

#![cfg(unix)]

use async_trait::async_trait;

use std::ffi::{CStr, CString};
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use crate::net_id::NetId;

use super::{AddrInfoHints, NativeResolver, ResolverError};

pub struct SystemResolver;

impl SystemResolver {
    fn blocking_get_addr_info(
        name: Option<String>,
        service: Option<String>,
        hints: Option<AddrInfoHints>,
    ) -> Result<Vec<SocketAddr>, ResolverError> {
        let c_name = name
            .map(|n| CString::new(n).map_err(|_| ResolverError::new(libc::EAI_NONAME)))
            .transpose()?;
        let c_service = service
            .map(|s| CString::new(s).map_err(|_| ResolverError::new(libc::EAI_SERVICE)))
            .transpose()?;

        let mut c_hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        if let Some(h) = hints {
            c_hints.ai_flags = h.flags;
            c_hints.ai_family = h.family;
            c_hints.ai_socktype = h.socktype;
            c_hints.ai_protocol = h.protocol;
        }

        let mut result: *mut libc::addrinfo = ptr::null_mut();
        let status = unsafe {
            libc::getaddrinfo(
                c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
                c_service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                if hints.is_some() { &c_hints } else { ptr::null() },
                &mut result,
            )
        };
        if status != 0 {
            return Err(ResolverError::new(status));
        }

        let mut addrs = Vec::new();
        let mut cursor = result;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if let Some(addr) = unsafe { sockaddr_to_addr(entry.ai_addr, entry.ai_addrlen) } {
                addrs.push(addr);
            }
            cursor = entry.ai_next;
        }
        unsafe { libc::freeaddrinfo(result) };
        Ok(addrs)
    }

    fn blocking_get_name_info(addr: IpAddr) -> Result<String, ResolverError> {
        let mut host = vec![0 as libc::c_char; libc::NI_MAXHOST as usize];
        let status = match addr {
            IpAddr::V4(v4) => {
                let sa = SocketAddrV4::new(v4, 0);
                let raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                let mut raw = raw;
                raw.sin_family = libc::AF_INET as libc::sa_family_t;
                raw.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(sa.ip().octets()),
                };
                unsafe {
                    libc::getnameinfo(
                        &raw as *const libc::sockaddr_in as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                        host.as_mut_ptr(),
                        host.len() as libc::socklen_t,
                        ptr::null_mut(),
                        0,
                        libc::NI_NAMEREQD,
                    )
                }
            }
            IpAddr::V6(v6) => {
                let raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                let mut raw = raw;
                raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                raw.sin6_addr = libc::in6_addr {
                    s6_addr: v6.octets(),
                };
                unsafe {
                    libc::getnameinfo(
                        &raw as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                        host.as_mut_ptr(),
                        host.len() as libc::socklen_t,
                        ptr::null_mut(),
                        0,
                        libc::NI_NAMEREQD,
                    )
                }
            }
        };
        if status != 0 {
            return Err(ResolverError::new(status));
        }

        let hostname = unsafe { CStr::from_ptr(host.as_ptr()) };
        Ok(hostname.to_string_lossy().into_owned())
    }
}

/// Converts a raw `sockaddr` from an addrinfo entry. Families other than
/// INET/INET6 are skipped.
unsafe fn sockaddr_to_addr(sa: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if sa.is_null() {
        return None;
    }
    match unsafe { (*sa).sa_family } as i32 {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(sa as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(sa as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[async_trait]
impl NativeResolver for SystemResolver {
    async fn get_addr_info(
        &self,
        net_id: NetId,
        name: Option<&str>,
        service: Option<&str>,
        hints: Option<AddrInfoHints>,
    ) -> Result<Vec<SocketAddr>, ResolverError> {
        tracing::debug!(%net_id, name, service, "getaddrinfo");
        let name = name.map(str::to_string);
        let service = service.map(str::to_string);
        tokio::task::spawn_blocking(move || Self::blocking_get_addr_info(name, service, hints))
            .await
            .map_err(|_| ResolverError::new(libc::EAI_SYSTEM))?
    }

    async fn get_host_by_name(&self, net_id: NetId, name: &str, family: i32) -> Result<Vec<IpAddr>, ResolverError> {
        let hints = AddrInfoHints {
            flags: 0,
            family,
            socktype: 0,
            protocol: 0,
        };
        let addrs = self.get_addr_info(net_id, Some(name), None, Some(hints)).await?;
        Ok(addrs.iter().map(SocketAddr::ip).collect())
    }

    async fn get_host_by_addr(&self, net_id: NetId, addr: IpAddr) -> Result<String, ResolverError> {
        tracing::debug!(%net_id, %addr, "gethostbyaddr");
        tokio::task::spawn_blocking(move || Self::blocking_get_name_info(addr))
            .await
            .map_err(|_| ResolverError::new(libc::EAI_SYSTEM))?
    }

    fn flush_cache(&self, net_id: NetId) {
        // The system resolver keys its cache by network and watches
        // lifecycle itself; there is nothing to drop on this side.
        tracing::debug!(%net_id, "resolver cache invalidation requested");
    }
}
