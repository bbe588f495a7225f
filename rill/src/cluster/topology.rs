//! Reading and diffing the cluster's host set.
//!
//! The `system.peers` and `system.local` tables are queried with plain CQL
//! and their cells decoded directly from raw bytes; the three column shapes
//! involved (inet, text, set<text>) are stable across server versions, and
//! keeping the decoding local avoids dragging a full value deserializer into
//! the core.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use rill_cql::frame::response::result::Row;
use tracing::warn;

use super::HostId;
use crate::errors::MetadataError;
use crate::network::connection::Connection;
use crate::statement::Statement;

const PEERS_QUERY: &str = "SELECT peer, data_center, rack, tokens FROM system.peers";
const LOCAL_QUERY: &str =
    "SELECT rpc_address, data_center, rack, tokens FROM system.local WHERE key='local'";

/// A node of the cluster, as read from the system tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: IpAddr,
    pub port: u16,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    /// Token ring positions, kept opaque; the core does not route by token.
    pub tokens: Vec<String>,
}

impl Host {
    pub fn id(&self) -> HostId {
        (self.address, self.port)
    }
}

/// Reads the current host set over the given connection. The node the
/// connection goes to is always first in the returned list.
pub(crate) async fn query_topology(
    connection: &Connection,
    port: u16,
) -> Result<Vec<Host>, MetadataError> {
    let mut hosts = Vec::new();

    let local = connection
        .query_unpaged(Statement::new(LOCAL_QUERY))
        .await?;
    for row in local.rows() {
        match parse_host_row(row, "local", port) {
            Ok(mut host) => {
                // system.local may report the unspecified address; the
                // address we actually connected to is the usable one then.
                if host.address.is_unspecified() {
                    host.address = connection.get_connect_address().ip();
                }
                hosts.push(host);
            }
            Err(e) => warn!(error = %e, "Skipping malformed system.local row"),
        }
    }

    let peers = connection
        .query_unpaged(Statement::new(PEERS_QUERY))
        .await?;
    for row in peers.rows() {
        match parse_host_row(row, "peers", port) {
            Ok(host) => hosts.push(host),
            Err(e) => warn!(error = %e, "Skipping malformed system.peers row"),
        }
    }

    Ok(hosts)
}

fn parse_host_row(row: &Row, table: &'static str, port: u16) -> Result<Host, MetadataError> {
    let malformed = |reason: &'static str| MetadataError::MalformedSystemRow { table, reason };

    let [address, datacenter, rack, tokens] = row.columns.as_slice() else {
        return Err(malformed("expected 4 columns"));
    };

    let address = cell_inet(address).ok_or(malformed("address cell is not an inet"))?;
    let datacenter = cell_text(datacenter);
    let rack = cell_text(rack);
    let tokens = match tokens {
        Some(cell) => cell_text_set(cell).ok_or(malformed("tokens cell is not a set<text>"))?,
        None => Vec::new(),
    };

    Ok(Host {
        address,
        port,
        datacenter,
        rack,
        tokens,
    })
}

fn cell_inet(cell: &Option<Bytes>) -> Option<IpAddr> {
    match cell.as_deref()? {
        bytes if bytes.len() == 4 => Some(IpAddr::from(<[u8; 4]>::try_from(bytes).unwrap())),
        bytes if bytes.len() == 16 => Some(IpAddr::from(<[u8; 16]>::try_from(bytes).unwrap())),
        _ => None,
    }
}

fn cell_text(cell: &Option<Bytes>) -> Option<String> {
    std::str::from_utf8(cell.as_deref()?)
        .ok()
        .map(ToOwned::to_owned)
}

/// Decodes a `set<text>` cell: an element count followed by length-prefixed
/// strings (the v3+ collection layout).
fn cell_text_set(cell: &Bytes) -> Option<Vec<String>> {
    let mut buf = &cell[..];
    let count = read_be_i32(&mut buf)?;
    if count < 0 {
        return None;
    }
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_be_i32(&mut buf)?;
        if len < 0 || buf.len() < len as usize {
            return None;
        }
        let (raw, rest) = buf.split_at(len as usize);
        buf = rest;
        elements.push(std::str::from_utf8(raw).ok()?.to_owned());
    }
    Some(elements)
}

fn read_be_i32(buf: &mut &[u8]) -> Option<i32> {
    if buf.len() < 4 {
        return None;
    }
    let (raw, rest) = buf.split_at(4);
    *buf = rest;
    Some(i32::from_be_bytes(raw.try_into().unwrap()))
}

/// Compares the freshly read host set against the previous one.
///
/// Hosts present in both sets are not re-announced; a host whose metadata
/// changed (datacenter, rack, tokens) keeps its identity and is also not
/// re-announced, since identity is (address, port).
pub(crate) fn diff_hosts(
    known: &HashMap<HostId, Host>,
    fresh: &[Host],
) -> (Vec<Host>, Vec<Host>) {
    let fresh_ids: std::collections::HashSet<HostId> = fresh.iter().map(Host::id).collect();

    let added = fresh
        .iter()
        .filter(|host| !known.contains_key(&host.id()))
        .cloned()
        .collect();
    let removed = known
        .values()
        .filter(|host| !fresh_ids.contains(&host.id()))
        .cloned()
        .collect();

    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last_octet: u8) -> Host {
        Host {
            address: IpAddr::from([10, 0, 0, last_octet]),
            port: 9042,
            datacenter: Some("dc1".to_string()),
            rack: Some("r1".to_string()),
            tokens: vec!["-9223372036854775808".to_string()],
        }
    }

    fn known(hosts: &[Host]) -> HashMap<HostId, Host> {
        hosts.iter().map(|h| (h.id(), h.clone())).collect()
    }

    #[test]
    fn diff_emits_exactly_the_changes() {
        let a = host(1);
        let b = host(2);
        let c = host(3);

        let (added, removed) = diff_hosts(&known(&[a.clone(), b.clone()]), &[b.clone(), c.clone()]);
        assert_eq!(added, vec![c]);
        assert_eq!(removed, vec![a]);
    }

    #[test]
    fn diff_is_idempotent() {
        let hosts = [host(1), host(2)];
        let known = known(&hosts);

        let (added, removed) = diff_hosts(&known, &hosts);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn metadata_change_is_not_a_membership_change() {
        let mut moved = host(1);
        moved.tokens = vec!["42".to_string()];

        let (added, removed) = diff_hosts(&known(&[host(1)]), &[moved]);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn text_set_cell_round_trip() {
        // set<text> of ["a", "bc"]: count 2, then length-prefixed elements.
        let cell = Bytes::from_static(&[
            0, 0, 0, 2, //
            0, 0, 0, 1, b'a', //
            0, 0, 0, 2, b'b', b'c',
        ]);
        assert_eq!(
            cell_text_set(&cell).unwrap(),
            vec!["a".to_string(), "bc".to_string()]
        );

        let truncated = Bytes::from_static(&[0, 0, 0, 2, 0, 0, 0, 9, b'a']);
        assert_eq!(cell_text_set(&truncated), None);
    }

    #[test]
    fn inet_cells() {
        assert_eq!(
            cell_inet(&Some(Bytes::from_static(&[127, 0, 0, 1]))),
            Some(IpAddr::from([127, 0, 0, 1]))
        );
        assert_eq!(cell_inet(&Some(Bytes::from_static(&[1, 2, 3]))), None);
        assert_eq!(cell_inet(&None), None);
    }
}
