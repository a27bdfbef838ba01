//! Database-scope privileges
//!
//! `ALL` is only an abbreviation: it is expanded when parsed and never stored.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A privilege grantable on a database.
///
/// Variant order is the alphabetical order of the SQL keywords so that sorting
/// by `(grantee, privilege)` matches the manifest ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Privilege {
    Connect,
    Create,
    Temporary,
}

impl Privilege {
    pub const ALL: [Privilege; 3] = [Self::Connect, Self::Create, Self::Temporary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Create => "CREATE",
            Self::Temporary => "TEMPORARY",
        }
    }

    /// The aclitem letter for this privilege
    pub fn acl_letter(&self) -> char {
        match self {
            Self::Connect => 'c',
            Self::Create => 'C',
            Self::Temporary => 'T',
        }
    }

    /// Map an aclitem letter; letters of other object classes return `None`
    pub fn from_acl_letter(letter: char) -> Option<Self> {
        match letter {
            'c' => Some(Self::Connect),
            'C' => Some(Self::Create),
            'T' => Some(Self::Temporary),
            _ => None,
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown database privilege '{0}'")]
pub struct UnknownPrivilege(pub String);

impl FromStr for Privilege {
    type Err = UnknownPrivilege;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONNECT" => Ok(Self::Connect),
            "CREATE" => Ok(Self::Create),
            "TEMPORARY" | "TEMP" => Ok(Self::Temporary),
            _ => Err(UnknownPrivilege(s.to_string())),
        }
    }
}

/// Canonical set of database privileges (deduplicated, ordered, `ALL` expanded)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrivilegeSet(BTreeSet<Privilege>);

impl PrivilegeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(Privilege::ALL.into_iter().collect())
    }

    /// Privileges PUBLIC holds when `datacl` is NULL
    pub fn public_default() -> Self {
        Self::from_iter([Privilege::Connect, Privilege::Temporary])
    }

    /// Parse a list of privilege names, expanding `ALL`
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownPrivilege> {
        let mut set = Self::empty();
        for name in names {
            let name = name.as_ref();
            let trimmed = name.trim();
            if trimmed.eq_ignore_ascii_case("ALL") || trimmed.eq_ignore_ascii_case("ALL PRIVILEGES")
            {
                set.extend(Privilege::ALL);
            } else {
                set.insert(trimmed.parse()?);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, privilege: Privilege) -> bool {
        self.0.insert(privilege)
    }

    pub fn contains(&self, privilege: Privilege) -> bool {
        self.0.contains(&privilege)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_all(&self) -> bool {
        self.0.len() == Privilege::ALL.len()
    }

    pub fn is_superset(&self, other: &PrivilegeSet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Privilege> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &PrivilegeSet) -> PrivilegeSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &PrivilegeSet) -> PrivilegeSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Comma-separated SQL keyword list (`CONNECT, TEMPORARY`)
    pub fn to_sql_list(&self) -> String {
        self.iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<Privilege> for PrivilegeSet {
    fn from_iter<I: IntoIterator<Item = Privilege>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Privilege> for PrivilegeSet {
    fn extend<I: IntoIterator<Item = Privilege>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl fmt::Display for PrivilegeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("ALL")
        } else if self.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&self.to_sql_list())
        }
    }
}

impl Serialize for PrivilegeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|p| p.as_str()))
    }
}

impl<'de> Deserialize<'de> for PrivilegeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Self::parse(&names).map_err(serde::de::Error::custom)
    }
}
