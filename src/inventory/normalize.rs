use crate::error::ParseError;

use super::{Host, OsKind, DEFAULT_OS_VERSION, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};

/// Key/value pairs of one inventory entry, keys lower-cased, in source order.
pub(super) type RawEntry = Vec<(String, String)>;

const HOSTNAME_KEYS: &[&str] = &["hostname", "host", "name", "fqdn"];
const ADDRESS_KEYS: &[&str] = &["ip_address", "ip", "address"];
const USER_KEYS: &[&str] = &["username", "user", "login"];
const PORT_KEYS: &[&str] = &["ssh_port", "port"];
const OS_KEYS: &[&str] = &["os", "operating_system"];
const OS_VERSION_KEYS: &[&str] = &["os_version", "version"];
const PRIVATE_ADDRESS_KEYS: &[&str] = &["private_address", "private_ip", "internal_ip"];

/// Canonical column order used when writing inventories back out.
pub(super) const CANONICAL_KEYS: [&str; 7] = [
    "hostname",
    "ip_address",
    "username",
    "ssh_port",
    "os",
    "os_version",
    "private_address",
];

pub(super) fn push(entry: &mut RawEntry, key: &str, value: &str) {
    entry.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
}

fn lookup<'a>(entry: &'a RawEntry, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        entry
            .iter()
            .find(|(key, value)| key == alias && !value.is_empty())
            .map(|(_, value)| value.as_str())
    })
}

/// Turn one raw entry into a [`Host`]. `position` is 1-based and only used for
/// error reporting.
pub(super) fn host(position: usize, entry: &RawEntry) -> Result<Host, ParseError> {
    let hostname = lookup(entry, HOSTNAME_KEYS).ok_or(ParseError::MissingField {
        entry: position,
        field: "hostname",
    })?;
    let address = lookup(entry, ADDRESS_KEYS).ok_or(ParseError::MissingField {
        entry: position,
        field: "ip_address",
    })?;

    let ssh_port = match lookup(entry, PORT_KEYS) {
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ParseError::InvalidField {
                hostname: hostname.to_string(),
                field: "ssh_port",
                value: raw.to_string(),
            })?,
        None => DEFAULT_SSH_PORT,
    };

    let os = match lookup(entry, OS_KEYS) {
        Some(raw) => raw
            .parse::<OsKind>()
            .map_err(|_| ParseError::InvalidField {
                hostname: hostname.to_string(),
                field: "os",
                value: raw.to_string(),
            })?,
        None => OsKind::Ubuntu,
    };

    Ok(Host {
        hostname: hostname.to_string(),
        address: address.to_string(),
        ssh_user: lookup(entry, USER_KEYS)
            .unwrap_or(DEFAULT_SSH_USER)
            .to_string(),
        ssh_port,
        os,
        os_version: lookup(entry, OS_VERSION_KEYS)
            .unwrap_or(DEFAULT_OS_VERSION)
            .to_string(),
        private_address: lookup(entry, PRIVATE_ADDRESS_KEYS).map(str::to_string),
    })
}

/// Canonical field values of a host, in [`CANONICAL_KEYS`] order. The private
/// address is empty when unset.
pub(super) fn canonical_values(host: &Host) -> [String; 7] {
    [
        host.hostname.clone(),
        host.address.clone(),
        host.ssh_user.clone(),
        host.ssh_port.to_string(),
        host.os.to_string(),
        host.os_version.clone(),
        host.private_address.clone().unwrap_or_default(),
    ]
}
