//! Static node address table.
//!
//! The table is parsed from one configuration string of comma-separated
//! `dbid:contentId:host:port` entries, e.g.
//! `1:-1:10.0.0.1:2000,2:0:10.0.0.2:2001`. The host may be an IPv4 or IPv6
//! literal or a host name; IPv6 literals may be written with or without
//! brackets since the port is always taken after the last colon.
//!
//! Parsing never blocks: IP literals are resolved on the spot, host names
//! are looked up afterwards by [`AddressTable::resolve`] on the runtime.
//!
//! A reload builds a whole new table; callers keep the old one until the
//! new one parsed successfully.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use log::{info, warn};
use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed address entry '{entry}': {reason}")]
    Malformed { entry: String, reason: &'static str },
    #[error("duplicate address entry for dbid {0}")]
    Duplicate(u16),
    #[error("no address entry for dbid {0}")]
    Missing(u16),
    #[error("address of dbid {0} could not be resolved")]
    Unresolved(u16),
}

/// One node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub dbid: u16,
    pub content_id: i16,
    pub host: String,
    pub port: u16,
    /// `None` until the host resolved; the entry is kept so that the node is
    /// still known, and the failure shows up when it is dialed.
    pub addr: Option<SocketAddr>,
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seg{},dbid{}: {}:{}",
            self.content_id, self.dbid, self.host, self.port
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    nodes: Vec<NodeAddr>,
}

impl AddressTable {
    pub fn parse(value: &str) -> Result<Self, AddrError> {
        let mut nodes: Vec<NodeAddr> = Vec::new();

        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let node = parse_entry(entry)?;
            if nodes.iter().any(|n| n.dbid == node.dbid) {
                return Err(AddrError::Duplicate(node.dbid));
            }

            info!("ic-proxy-addr: addr: {node}");
            nodes.push(node);
        }

        let table = Self { nodes };
        info!(
            "ic-proxy-addr: {} unique content ids",
            table.content_count()
        );
        Ok(table)
    }

    /// Looks up the host names [`parse`](Self::parse) left unresolved.
    pub async fn resolve(mut self) -> Self {
        for node in self.nodes.iter_mut().filter(|n| n.addr.is_none()) {
            match lookup_host((node.host.as_str(), node.port)).await {
                Ok(mut addrs) => node.addr = addrs.next(),
                Err(e) => warn!("ic-proxy-addr: invalid address: {node}: {e}"),
            }
        }
        self
    }

    /// Every entry has a socket address.
    pub fn is_resolved(&self) -> bool {
        self.nodes.iter().all(|n| n.addr.is_some())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeAddr> {
        self.nodes.iter()
    }

    pub fn lookup(&self, dbid: u16) -> Option<&NodeAddr> {
        self.nodes.iter().find(|n| n.dbid == dbid)
    }

    /// Resolved socket address of `dbid`.
    pub fn addr_of(&self, dbid: u16) -> Result<SocketAddr, AddrError> {
        self.lookup(dbid)
            .ok_or(AddrError::Missing(dbid))?
            .addr
            .ok_or(AddrError::Unresolved(dbid))
    }

    /// Port the local node listens on for peers.
    pub fn my_port(&self, dbid: u16) -> Result<u16, AddrError> {
        self.lookup(dbid)
            .map(|n| n.port)
            .ok_or(AddrError::Missing(dbid))
    }

    /// Number of distinct content ids, counting the coordinator (-1).
    pub fn content_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.content_id)
            .max()
            .map_or(0, |max| (max as isize + 2).max(0) as usize)
    }
}

fn parse_entry(entry: &str) -> Result<NodeAddr, AddrError> {
    let malformed = |reason| AddrError::Malformed {
        entry: entry.to_string(),
        reason,
    };

    let mut fields = entry.splitn(3, ':');
    let dbid = fields.next().ok_or_else(|| malformed("missing dbid"))?;
    let content = fields.next().ok_or_else(|| malformed("missing content id"))?;
    let rest = fields.next().ok_or_else(|| malformed("missing host"))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| malformed("missing port"))?;

    let dbid: u16 = dbid.trim().parse().map_err(|_| malformed("invalid dbid"))?;
    let content_id: i16 = content
        .trim()
        .parse()
        .map_err(|_| malformed("invalid content id"))?;
    let port: u16 = port.trim().parse().map_err(|_| malformed("invalid port"))?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(malformed("missing host"));
    }

    let addr = host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port));

    Ok(NodeAddr {
        dbid,
        content_id,
        host: host.to_string(),
        port,
        addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entries_in_order() {
        let table = AddressTable::parse("1:-1:127.0.0.1:2000, 2:0:127.0.0.1:2001,3:1:127.0.0.1:2002,").unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.iter().map(|n| n.dbid).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(table.my_port(2), Ok(2001));
        assert_eq!(
            table.addr_of(3),
            Ok("127.0.0.1:2002".parse().unwrap())
        );
        assert_eq!(table.lookup(1).unwrap().content_id, -1);
        assert_eq!(table.content_count(), 3);
    }

    #[test]
    fn parse_ipv6_literals() {
        let table = AddressTable::parse("4:2:::1:3000,5:3:[::1]:3001").unwrap();

        assert_eq!(table.addr_of(4), Ok("[::1]:3000".parse().unwrap()));
        assert_eq!(table.addr_of(5), Ok("[::1]:3001".parse().unwrap()));
    }

    #[test]
    fn missing_dbid() {
        let table = AddressTable::parse("1:-1:127.0.0.1:2000").unwrap();

        assert_eq!(table.my_port(9), Err(AddrError::Missing(9)));
        assert_eq!(table.addr_of(9), Err(AddrError::Missing(9)));
    }

    #[test]
    fn malformed_entries() {
        for bad in ["1:-1:127.0.0.1", "x:0:127.0.0.1:1", "1:0::", "1:0:127.0.0.1:99999"] {
            assert!(
                matches!(AddressTable::parse(bad), Err(AddrError::Malformed { .. })),
                "{bad}"
            );
        }

        assert_eq!(
            AddressTable::parse("1:0:127.0.0.1:1,1:1:127.0.0.1:2"),
            Err(AddrError::Duplicate(1))
        );
    }

    #[test]
    fn host_names_wait_for_resolve() {
        let table = AddressTable::parse("1:-1:localhost:2000,2:0:127.0.0.1:2001").unwrap();

        assert!(!table.is_resolved());
        assert_eq!(table.addr_of(1), Err(AddrError::Unresolved(1)));
        assert_eq!(table.my_port(1), Ok(2000));
        assert!(table.addr_of(2).is_ok());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let table = runtime.block_on(table.resolve());

        assert!(table.is_resolved());
        assert_eq!(table.addr_of(1).unwrap().port(), 2000);
        assert!(table.addr_of(1).unwrap().ip().is_loopback());
    }

    #[test]
    fn empty_table() {
        let table = AddressTable::parse("").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.content_count(), 0);
    }
}
