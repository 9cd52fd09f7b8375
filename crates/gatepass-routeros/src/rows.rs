//! Typed views over reply rows.
//!
//! Print commands return attribute bags; each command family gets a
//! small record type lifting the fields callers actually read. Unknown
//! attributes are ignored, missing ones become `None` or empty.

use indexmap::IndexMap;

// ── Raw row ──────────────────────────────────────────────────────────

/// Raw attribute row from one `!re` sentence.
#[derive(Debug, Clone, Default)]
pub struct Row(IndexMap<String, String>);

impl Row {
    pub fn new(attributes: IndexMap<String, String>) -> Self {
        Self(attributes)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The `.id` record identifier (`*1A` style).
    pub fn id(&self) -> Option<&str> {
        self.get(".id")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<IndexMap<String, String>> for Row {
    fn from(attributes: IndexMap<String, String>) -> Self {
        Self(attributes)
    }
}

fn owned(row: &Row, key: &str) -> Option<String> {
    row.get(key).map(str::to_owned)
}

fn owned_or_empty(row: &Row, key: &str) -> String {
    row.get(key).unwrap_or_default().to_owned()
}

// ── Per-family rows ──────────────────────────────────────────────────

/// `/system/resource/print`.
#[derive(Debug, Clone, Default)]
pub struct ResourceRow {
    pub version: Option<String>,
    pub board_name: Option<String>,
    pub uptime: Option<String>,
}

impl ResourceRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            version: owned(row, "version"),
            board_name: owned(row, "board-name"),
            uptime: owned(row, "uptime"),
        }
    }

    /// Leading integer of the version string: "7.14.2 (stable)" -> 7.
    pub fn major_version(&self) -> Option<u32> {
        let version = self.version.as_deref()?;
        let digits: String = version.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }
}

/// `/ip/hotspot/user/profile/print`.
#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: Option<String>,
    pub name: String,
    pub session_timeout: Option<String>,
    pub idle_timeout: Option<String>,
    pub rate_limit: Option<String>,
    pub shared_users: Option<String>,
}

impl ProfileRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.id().map(str::to_owned),
            name: owned_or_empty(row, "name"),
            session_timeout: owned(row, "session-timeout"),
            idle_timeout: owned(row, "idle-timeout"),
            rate_limit: owned(row, "rate-limit"),
            shared_users: owned(row, "shared-users"),
        }
    }
}

/// `/ip/hotspot/user/print`.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Option<String>,
    pub name: String,
    pub password: Option<String>,
    pub profile: Option<String>,
    pub mac_address: Option<String>,
    pub disabled: bool,
}

impl UserRow {
    pub fn from_row(row: &Row) -> Self {
        let disabled = matches!(row.get("disabled"), Some("true" | "yes"));
        Self {
            id: row.id().map(str::to_owned),
            name: owned_or_empty(row, "name"),
            password: owned(row, "password"),
            profile: owned(row, "profile"),
            mac_address: owned(row, "mac-address"),
            disabled,
        }
    }
}

/// `/ip/hotspot/host/print` -- the appliance's view of attached clients.
#[derive(Debug, Clone)]
pub struct HostRow {
    pub id: Option<String>,
    pub mac_address: String,
    pub address: Option<String>,
    /// NATed address handed to the client; preferred for logins on
    /// modern firmware.
    pub to_address: Option<String>,
    pub server: Option<String>,
}

impl HostRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.id().map(str::to_owned),
            mac_address: owned_or_empty(row, "mac-address"),
            address: owned(row, "address"),
            to_address: owned(row, "to-address"),
            server: owned(row, "server"),
        }
    }
}

/// `/ip/hotspot/active/print`.
#[derive(Debug, Clone)]
pub struct ActiveRow {
    pub id: Option<String>,
    pub user: String,
    pub address: Option<String>,
    pub mac_address: Option<String>,
    pub uptime: Option<String>,
    pub server: Option<String>,
}

impl ActiveRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.id().map(str::to_owned),
            user: owned_or_empty(row, "user"),
            address: owned(row, "address"),
            mac_address: owned(row, "mac-address"),
            uptime: owned(row, "uptime"),
            server: owned(row, "server"),
        }
    }
}

/// `/ip/hotspot/cookie/print`.
#[derive(Debug, Clone)]
pub struct CookieRow {
    pub id: Option<String>,
    pub user: String,
    pub mac_address: String,
}

impl CookieRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.id().map(str::to_owned),
            user: owned_or_empty(row, "user"),
            mac_address: owned_or_empty(row, "mac-address"),
        }
    }
}

/// `/system/script/print`.
#[derive(Debug, Clone)]
pub struct ScriptRow {
    pub id: Option<String>,
    pub name: String,
}

impl ScriptRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.id().map(str::to_owned),
            name: owned_or_empty(row, "name"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        Row::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
    }

    #[test]
    fn major_version_takes_leading_integer() {
        let cases = [
            ("7.14.2 (stable)", Some(7)),
            ("6.48.6", Some(6)),
            ("7rc1", Some(7)),
            ("beta", None),
            ("", None),
        ];
        for (version, expected) in cases {
            let resource = ResourceRow {
                version: Some(version.to_owned()),
                ..ResourceRow::default()
            };
            assert_eq!(resource.major_version(), expected, "version {version:?}");
        }
        assert_eq!(ResourceRow::default().major_version(), None);
    }

    #[test]
    fn user_row_reads_wire_fields() {
        let user = UserRow::from_row(&row(&[
            (".id", "*3"),
            ("name", "K7Q2P9"),
            ("profile", "1_Day"),
            ("disabled", "no"),
        ]));
        assert_eq!(user.id.as_deref(), Some("*3"));
        assert_eq!(user.name, "K7Q2P9");
        assert_eq!(user.profile.as_deref(), Some("1_Day"));
        assert!(!user.disabled);
        assert!(user.password.is_none());
    }

    #[test]
    fn host_row_keeps_both_addresses() {
        let host = HostRow::from_row(&row(&[
            ("mac-address", "aa:bb:cc:dd:ee:ff"),
            ("address", "10.5.50.17"),
            ("to-address", "10.5.50.17"),
            ("server", "hotspot1"),
        ]));
        assert_eq!(host.mac_address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(host.to_address.as_deref(), Some("10.5.50.17"));
    }
}
