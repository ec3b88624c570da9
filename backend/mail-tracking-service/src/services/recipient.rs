//! Mail routing information of a notifiable target
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The shapes a notifiable's mail route comes in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MailRoute {
    /// `"jane@example.com"`
    Address(String),
    /// `{"email": "jane@example.com", "name": "Jane"}`
    NamedAddress { email: String, name: Option<String> },
    /// `["jane@example.com", "ops@example.com"]`
    AddressList(Vec<String>),
    /// `{"jane@example.com": "Jane"}`, address keyed to display name
    KeyedRoute(#[serde(with = "keyed_entries")] Vec<(String, String)>),
}

/// Resolved recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

impl MailRoute {
    /// First usable address with its display name, if any. Addresses are
    /// trimmed and lowercased.
    pub fn resolve(&self) -> Option<Recipient> {
        match self {
            MailRoute::Address(address) => usable(address).map(|email| Recipient { email, name: None }),
            MailRoute::NamedAddress { email, name } => usable(email).map(|email| Recipient {
                email,
                name: clean_name(name.as_deref()),
            }),
            MailRoute::AddressList(addresses) => addresses
                .iter()
                .find_map(|a| usable(a))
                .map(|email| Recipient { email, name: None }),
            MailRoute::KeyedRoute(entries) => entries.iter().find_map(|(address, name)| {
                usable(address).map(|email| Recipient {
                    email,
                    name: clean_name(Some(name)),
                })
            }),
        }
    }

    /// Short tag stored in the diagnostics blob
    pub fn kind(&self) -> &'static str {
        match self {
            MailRoute::Address(_) => "address",
            MailRoute::NamedAddress { .. } => "named_address",
            MailRoute::AddressList(_) => "address_list",
            MailRoute::KeyedRoute(_) => "keyed_route",
        }
    }
}

/// Keyed routes travel as JSON objects; entry order is kept so "first usable"
/// means first in the payload.
mod keyed_entries {
    use super::*;

    pub fn serialize<S: Serializer>(entries: &[(String, String)], s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(entries.len()))?;
        for (address, name) in entries {
            map.serialize_entry(address, name)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(String, String)>, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of address to display name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((address, name)) = map.next_entry::<String, Option<String>>()? {
                    entries.push((address, name.unwrap_or_default()));
                }
                Ok(entries)
            }
        }

        d.deserialize_map(EntriesVisitor)
    }
}

fn usable(address: &str) -> Option<String> {
    let address = address.trim();
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            Some(address.to_lowercase())
        }
        _ => None,
    }
}

fn clean_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}
