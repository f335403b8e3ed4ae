//! The DNS proxy: per-network name resolution on behalf of clients.
//!
//! Requests arrive as one shell-quoted line on the proxy socket. The
//! effective netId comes from the selection algorithm with `for_dns` set,
//! so a UID range entry that disables DNS forwarding falls through to the
//! requested or default network. Resolution itself is delegated to the
//! system resolver bound to the chosen network, behind [`NativeResolver`];
//! every request runs on its own worker because that call blocks.
//!
//! Reply wire format: one 4-byte big-endian status (0 ok, negative on
//! error), then length-prefixed records (4-byte big-endian length, then
//! that many bytes); a zero-length record terminates the stream.

use async_trait::async_trait;
use thiserror::Error as ThisError;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::net_id::NetId;

pub mod resolver;

#[cfg(unix)]
pub use resolver::SystemResolver;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("malformed request: {0}")]
    BadRequest(String),
}

/// A resolver failure, carried to the client as a negative status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolverError {
    pub code: i32,
}

impl ResolverError {
    pub fn new(code: i32) -> Self {
        // Normalized negative so the wire status is unambiguous.
        ResolverError { code: -code.abs() }
    }
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "resolver error {}", self.code)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddrInfoHints {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

/// The external system resolver, bound per query to a logical network.
/// The daemon owns no DNS state of its own; cache invalidation on network
/// destruction also goes through here.
#[async_trait]
pub trait NativeResolver: Send + Sync {
    async fn get_addr_info(
        &self,
        net_id: NetId,
        name: Option<&str>,
        service: Option<&str>,
        hints: Option<AddrInfoHints>,
    ) -> Result<Vec<SocketAddr>, ResolverError>;

    async fn get_host_by_name(&self, net_id: NetId, name: &str, family: i32) -> Result<Vec<IpAddr>, ResolverError>;

    async fn get_host_by_addr(&self, net_id: NetId, addr: IpAddr) -> Result<String, ResolverError>;

    /// Drop any cached answers keyed by this network.
    fn flush_cache(&self, net_id: NetId);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DnsRequest {
    GetAddrInfo {
        name: Option<String>,
        service: Option<String>,
        hints: Option<AddrInfoHints>,
        net_id: NetId,
    },
    GetHostByName {
        net_id: NetId,
        name: String,
        family: i32,
    },
    GetHostByAddr {
        addr: IpAddr,
        family: i32,
        net_id: NetId,
    },
}

impl DnsRequest {
    /// The netId the client asked for; `UNSET` defers to the selection
    /// algorithm entirely.
    pub fn requested_net_id(&self) -> NetId {
        match self {
            DnsRequest::GetAddrInfo { net_id, .. } => *net_id,
            DnsRequest::GetHostByName { net_id, .. } => *net_id,
            DnsRequest::GetHostByAddr { net_id, .. } => *net_id,
        }
    }
}

/// A `^` token marks an absent argument.
fn optional(token: &str) -> Option<String> {
    if token == "^" { None } else { Some(token.to_string()) }
}

fn parse_int(token: &str, what: &str) -> Result<i32, Error> {
    token
        .parse::<i32>()
        .map_err(|_| Error::BadRequest(format!("bad {what} `{token}`")))
}

fn parse_net_id(token: &str) -> Result<NetId, Error> {
    token
        .parse::<NetId>()
        .map_err(|_| Error::BadRequest(format!("bad netId `{token}`")))
}

/// Parses one tokenized request line.
///
/// Layouts:
/// - `getaddrinfo <name|^> <service|^> <flags> <family> <socktype> <protocol> <netId>`
/// - `gethostbyname <netId> <name> <family>`
/// - `gethostbyaddr <addr> <addrLen> <family> <netId>`
pub fn parse_request(argv: &[String]) -> Result<DnsRequest, Error> {
    let opcode = argv.first().map(String::as_str).unwrap_or_default();
    match opcode {
        "getaddrinfo" => {
            if argv.len() != 8 {
                return Err(Error::BadRequest(format!(
                    "getaddrinfo expects 7 arguments, got {}",
                    argv.len() - 1
                )));
            }
            let hints = AddrInfoHints {
                flags: parse_int(&argv[3], "ai_flags")?,
                family: parse_int(&argv[4], "ai_family")?,
                socktype: parse_int(&argv[5], "ai_socktype")?,
                protocol: parse_int(&argv[6], "ai_protocol")?,
            };
            // All four set to -1 means the caller passed no hints at all.
            const NO_HINTS: AddrInfoHints = AddrInfoHints {
                flags: -1,
                family: -1,
                socktype: -1,
                protocol: -1,
            };
            let hints = if hints == NO_HINTS { None } else { Some(hints) };
            Ok(DnsRequest::GetAddrInfo {
                name: optional(&argv[1]),
                service: optional(&argv[2]),
                hints,
                net_id: parse_net_id(&argv[7])?,
            })
        }
        "gethostbyname" => {
            if argv.len() != 4 {
                return Err(Error::BadRequest(format!(
                    "gethostbyname expects 3 arguments, got {}",
                    argv.len() - 1
                )));
            }
            Ok(DnsRequest::GetHostByName {
                net_id: parse_net_id(&argv[1])?,
                name: argv[2].clone(),
                family: parse_int(&argv[3], "family")?,
            })
        }
        "gethostbyaddr" => {
            if argv.len() != 5 {
                return Err(Error::BadRequest(format!(
                    "gethostbyaddr expects 4 arguments, got {}",
                    argv.len() - 1
                )));
            }
            let addr: IpAddr = argv[1]
                .parse()
                .map_err(|_| Error::BadRequest(format!("bad address `{}`", argv[1])))?;
            Ok(DnsRequest::GetHostByAddr {
                addr,
                family: parse_int(&argv[3], "family")?,
                net_id: parse_net_id(&argv[4])?,
            })
        }
        other => Err(Error::BadRequest(format!("unknown opcode `{other}`"))),
    }
}

// ============================================================================
// Reply framing
// ============================================================================

pub fn encode_status(status: i32) -> [u8; 4] {
    status.to_be_bytes()
}

pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Runs one resolved request and produces the full reply byte stream:
/// status word, one textual record per result, zero-length terminator.
pub async fn run_request<R: NativeResolver>(request: &DnsRequest, net_id: NetId, resolver: &R) -> Vec<u8> {
    let records: Result<Vec<String>, ResolverError> = match request {
        DnsRequest::GetAddrInfo {
            name, service, hints, ..
        } => resolver
            .get_addr_info(net_id, name.as_deref(), service.as_deref(), *hints)
            .await
            .map(|addrs| addrs.iter().map(SocketAddr::to_string).collect()),
        DnsRequest::GetHostByName { name, family, .. } => resolver
            .get_host_by_name(net_id, name, *family)
            .await
            .map(|addrs| addrs.iter().map(IpAddr::to_string).collect()),
        DnsRequest::GetHostByAddr { addr, .. } => resolver
            .get_host_by_addr(net_id, *addr)
            .await
            .map(|hostname| vec![hostname]),
    };

    let mut reply = Vec::new();
    match records {
        Ok(records) => {
            reply.extend_from_slice(&encode_status(0));
            for record in &records {
                reply.extend_from_slice(&encode_frame(record.as_bytes()));
            }
        }
        Err(e) => {
            reply.extend_from_slice(&encode_status(e.code));
        }
    }
    reply.extend_from_slice(&encode_frame(&[]));
    reply
}

// ============================================================================
// Test resolver
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
