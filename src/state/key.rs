//! Link identity - key type and role prefix parsing
//!
//! A monitored link is identified by `(group, name)`. Link names come from
//! free-form router comments, so they are normalized first: uppercased, with
//! runs of whitespace and underscores folded to single hyphens. The leading
//! name segment encodes the link's role (`ISP`, `PRIVATE`, `VENDO`, `ADMIN`)
//! used for routing decisions downstream.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Identity of a monitored connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    /// Router group this link belongs to
    pub group: String,
    /// Normalized link name (e.g. `PRIVATE-ALICIA`)
    pub name: String,
}

impl LinkKey {
    /// Build a key from a group and a raw link name (name is normalized)
    pub fn new(group: impl Into<String>, name: &str) -> Self {
        Self {
            group: group.into(),
            name: normalize_link_name(name),
        }
    }

    /// Role encoded in the name's leading segment
    pub fn role(&self) -> Role {
        Role::of(&self.name)
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

/// Link role, parsed from the name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Group uplink; state changes broadcast to the whole group
    Isp,
    /// Dedicated subscriber drop
    Private,
    /// Shared coin-operated terminal
    Vendo,
    /// Administrative recipient, receives mirrored copies
    Admin,
    /// Anything else; generic fallback routing
    Other,
}

impl Role {
    /// Parse the role from a normalized link name
    pub fn of(name: &str) -> Role {
        let prefix = name.split('-').next().unwrap_or(name);
        match prefix {
            "ISP" => Role::Isp,
            "PRIVATE" => Role::Private,
            "VENDO" => Role::Vendo,
            "ADMIN" => Role::Admin,
            _ => Role::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Isp => "ISP",
            Role::Private => "PRIVATE",
            Role::Vendo => "VENDO",
            Role::Admin => "ADMIN",
            Role::Other => "OTHER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a raw link name: uppercase, separator runs folded to `-`
///
/// Router comments are free-form; `private_alicia`, `PRIVATE ALICIA` and
/// `PRIVATE-ALICIA` must all map to the same key.
pub fn normalize_link_name(raw: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    let re = SEPARATORS.get_or_init(|| Regex::new(r"[\s_]+").expect("valid separator pattern"));
    re.replace_all(raw.trim(), "-")
        .to_uppercase()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_underscores_and_spaces() {
        assert_eq!(normalize_link_name("private_alicia"), "PRIVATE-ALICIA");
        assert_eq!(normalize_link_name("PRIVATE  ALICIA"), "PRIVATE-ALICIA");
        assert_eq!(normalize_link_name("  vendo_plaza_2 "), "VENDO-PLAZA-2");
        assert_eq!(normalize_link_name("ISP-PLDT"), "ISP-PLDT");
    }

    #[test]
    fn test_normalize_trims_stray_separators() {
        assert_eq!(normalize_link_name("_private_x_"), "PRIVATE-X");
    }

    #[test]
    fn test_role_prefix_parsing() {
        assert_eq!(Role::of("ISP-PLDT"), Role::Isp);
        assert_eq!(Role::of("PRIVATE-ALICIA"), Role::Private);
        assert_eq!(Role::of("VENDO-PLAZA"), Role::Vendo);
        assert_eq!(Role::of("ADMIN"), Role::Admin);
        assert_eq!(Role::of("BACKHAUL-1"), Role::Other);
    }

    #[test]
    fn test_key_roundtrip() {
        let key = LinkKey::new("G1", "private_alicia");
        assert_eq!(key.name, "PRIVATE-ALICIA");
        assert_eq!(key.role(), Role::Private);
        assert_eq!(key.to_string(), "G1:PRIVATE-ALICIA");
    }
}
