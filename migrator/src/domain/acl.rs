//! Codec for PostgreSQL `aclitem` text
//!
//! Decodes entries of the form `<grantee>=<privs>/<grantor>` into normalized
//! grants, restricted to the database object class:
//! - `c` CONNECT, `T` TEMPORARY, `C` CREATE; other privilege letters are ignored
//! - `*` after a letter marks the privilege as grantable
//! - an empty grantee is PUBLIC, normalized to `"public"`
//! - a NULL `datacl` means `acldefault('d', owner)`

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::constants::PUBLIC_GRANTEE;
use crate::domain::privilege::{Privilege, PrivilegeSet};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclError {
    #[error("Malformed aclitem '{item}': {reason}")]
    Malformed { item: String, reason: &'static str },
}

impl AclError {
    fn malformed(item: &str, reason: &'static str) -> Self {
        Self::Malformed {
            item: item.to_string(),
            reason,
        }
    }
}

/// One decoded access-control entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclItem {
    /// Role name, or `"public"`
    pub grantee: String,
    pub grantor: String,
    pub privileges: PrivilegeSet,
    /// Subset of `privileges` held WITH GRANT OPTION
    pub grant_options: PrivilegeSet,
}

impl AclItem {
    pub fn new(grantee: &str, grantor: &str, privileges: PrivilegeSet) -> Self {
        Self {
            grantee: grantee.to_string(),
            grantor: grantor.to_string(),
            privileges,
            grant_options: PrivilegeSet::empty(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.grantee == PUBLIC_GRANTEE
    }
}

/// Result of decoding a whole `datacl` array
#[derive(Debug, Clone, Default)]
pub struct DecodedAcl {
    pub items: Vec<AclItem>,
    /// Entries that failed to decode; the remaining entries are still valid
    pub errors: Vec<AclError>,
    /// True when the array was NULL and `acldefault` was applied
    pub defaulted: bool,
}

/// Privileges held by one grantee, merged across grantors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GranteePrivileges {
    pub privileges: PrivilegeSet,
    pub grant_options: PrivilegeSet,
}

impl DecodedAcl {
    /// Merge entries per grantee (a grantee may hold rights from several grantors)
    pub fn by_grantee(&self) -> BTreeMap<String, GranteePrivileges> {
        let mut merged: BTreeMap<String, GranteePrivileges> = BTreeMap::new();
        for item in &self.items {
            let entry = merged.entry(item.grantee.clone()).or_default();
            entry.privileges.extend(item.privileges.iter());
            entry.grant_options.extend(item.grant_options.iter());
        }
        merged
    }
}

/// `acldefault('d', owner)`: owner holds every privilege, PUBLIC holds CONNECT and TEMPORARY
pub fn acl_default(owner: &str) -> Vec<AclItem> {
    vec![
        AclItem::new(PUBLIC_GRANTEE, owner, PrivilegeSet::public_default()),
        AclItem::new(owner, owner, PrivilegeSet::all()),
    ]
}

/// Decode a `datacl` array (`None` for SQL NULL)
pub fn decode_acl(datacl: Option<&[String]>, owner: &str) -> DecodedAcl {
    let Some(entries) = datacl else {
        return DecodedAcl {
            items: acl_default(owner),
            errors: Vec::new(),
            defaulted: true,
        };
    };

    let mut decoded = DecodedAcl::default();
    for entry in entries {
        match decode_item(entry) {
            Ok(item) => decoded.items.push(item),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed aclitem");
                decoded.errors.push(e);
            }
        }
    }
    decoded
}

/// Decode a single `aclitem` string
pub fn decode_item(raw: &str) -> Result<AclItem, AclError> {
    let item = raw.trim();
    let mut chars = item.chars().peekable();

    let grantee = read_name(item, &mut chars, Some('='))?;
    if chars.next() != Some('=') {
        return Err(AclError::malformed(item, "missing '='"));
    }

    let mut privileges = PrivilegeSet::empty();
    let mut grant_options = PrivilegeSet::empty();
    // Last letter seen and whether it already carries a '*'
    let mut previous: Option<(char, bool)> = None;
    loop {
        match chars.next() {
            Some('/') => break,
            Some('*') => match previous {
                Some((letter, false)) => {
                    if let Some(p) = Privilege::from_acl_letter(letter) {
                        grant_options.insert(p);
                    }
                    previous = Some((letter, true));
                }
                Some((_, true)) => return Err(AclError::malformed(item, "repeated '*'")),
                None => return Err(AclError::malformed(item, "'*' without a privilege letter")),
            },
            Some(c) if c.is_ascii_alphabetic() => {
                if let Some(p) = Privilege::from_acl_letter(c) {
                    privileges.insert(p);
                }
                previous = Some((c, false));
            }
            Some(_) => return Err(AclError::malformed(item, "invalid privilege character")),
            None => return Err(AclError::malformed(item, "missing '/'")),
        }
    }

    let grantor = read_name(item, &mut chars, None)?;
    if grantor.is_empty() {
        return Err(AclError::malformed(item, "empty grantor"));
    }
    if chars.next().is_some() {
        return Err(AclError::malformed(item, "trailing characters after grantor"));
    }

    Ok(AclItem {
        grantee: if grantee.is_empty() {
            PUBLIC_GRANTEE.to_string()
        } else {
            grantee
        },
        grantor,
        privileges,
        grant_options,
    })
}

/// Read a possibly double-quoted role name up to `stop` (or the end of input)
fn read_name(
    item: &str,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    stop: Option<char>,
) -> Result<String, AclError> {
    let mut name = String::new();
    if chars.peek() == Some(&'"') {
        chars.next();
        loop {
            match chars.next() {
                Some('"') if chars.peek() == Some(&'"') => {
                    chars.next();
                    name.push('"');
                }
                Some('"') => return Ok(name),
                Some(c) => name.push(c),
                None => return Err(AclError::malformed(item, "unterminated quoted name")),
            }
        }
    }

    while let Some(&c) = chars.peek() {
        if Some(c) == stop || c == '/' {
            break;
        }
        if c == '"' {
            return Err(AclError::malformed(item, "unexpected quote in name"));
        }
        name.push(c);
        chars.next();
    }
    Ok(name)
}

/// Encode an entry back to `aclitem` text, letters in PostgreSQL's order
pub fn encode_item(item: &AclItem) -> String {
    let grantee = if item.is_public() {
        String::new()
    } else {
        encode_name(&item.grantee)
    };

    let mut privs = String::new();
    for p in [Privilege::Create, Privilege::Temporary, Privilege::Connect] {
        if item.privileges.contains(p) {
            privs.push(p.acl_letter());
            if item.grant_options.contains(p) {
                privs.push('*');
            }
        }
    }

    format!("{}={}/{}", grantee, privs, encode_name(&item.grantor))
}

/// Quote a name the way PostgreSQL's aclitem output does
fn encode_name(name: &str) -> String {
    let safe = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if safe {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(privs: &[Privilege]) -> PrivilegeSet {
        privs.iter().copied().collect()
    }

    #[test]
    fn test_decode_public_entry() {
        let item = decode_item("=Tc/postgres").unwrap();
        assert_eq!(item.grantee, "public");
        assert_eq!(item.grantor, "postgres");
        assert_eq!(item.privileges, PrivilegeSet::public_default());
        assert!(item.grant_options.is_empty());
    }

    #[test]
    fn test_decode_full_set_with_grant_option() {
        let item = decode_item("app_user=C*Tc/postgres").unwrap();
        assert_eq!(item.grantee, "app_user");
        assert!(item.privileges.is_all());
        assert_eq!(item.grant_options, set(&[Privilege::Create]));
    }

    #[test]
    fn test_decode_ignores_other_object_class_letters() {
        let item = decode_item("reader=arwdc/owner").unwrap();
        assert_eq!(item.privileges, set(&[Privilege::Connect]));
    }

    #[test]
    fn test_decode_quoted_names() {
        let item = decode_item(r#""my ""odd"" role"=c/"Admin Team""#).unwrap();
        assert_eq!(item.grantee, r#"my "odd" role"#);
        assert_eq!(item.grantor, "Admin Team");
    }

    #[test]
    fn test_decode_empty_privileges() {
        let item = decode_item("bob=/alice").unwrap();
        assert!(item.privileges.is_empty());
    }

    #[test]
    fn test_decode_malformed() {
        for bad in [
            "bob",
            "bob=c",
            "bob=c/",
            "bob=*c/alice",
            "bob=c**/alice",
            "bob=c1/alice",
            "\"bob=c/alice",
            "bob=c/alice/extra",
        ] {
            assert!(
                matches!(decode_item(bad), Err(AclError::Malformed { .. })),
                "expected malformed: {bad}"
            );
        }
    }

    #[test]
    fn test_decode_acl_null_applies_default() {
        let decoded = decode_acl(None, "app_user");
        assert!(decoded.defaulted);
        let merged = decoded.by_grantee();
        assert_eq!(merged["app_user"].privileges, PrivilegeSet::all());
        assert_eq!(merged["public"].privileges, PrivilegeSet::public_default());
    }

    #[test]
    fn test_decode_acl_discards_only_bad_entries() {
        let entries = vec![
            "=c/owner".to_string(),
            "garbage".to_string(),
            "bob=T/owner".to_string(),
        ];
        let decoded = decode_acl(Some(&entries), "owner");
        assert!(!decoded.defaulted);
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.errors.len(), 1);
    }

    #[test]
    fn test_by_grantee_merges_grantors() {
        let entries = vec!["bob=c/alice".to_string(), "bob=T*/carol".to_string()];
        let merged = decode_acl(Some(&entries), "alice").by_grantee();
        assert_eq!(
            merged["bob"].privileges,
            set(&[Privilege::Connect, Privilege::Temporary])
        );
        assert_eq!(merged["bob"].grant_options, set(&[Privilege::Temporary]));
    }

    #[test]
    fn test_encode_round_trip_up_to_letter_order() {
        for (input, canonical) in [
            ("=Tc/postgres", "=Tc/postgres"),
            ("=cT/postgres", "=Tc/postgres"),
            ("app=cTC/postgres", "app=CTc/postgres"),
            ("app=c*C/postgres", "app=Cc*/postgres"),
            (r#""we ird"=c/"o""wner""#, r#""we ird"=c/"o""wner""#),
            ("Analytics=c/postgres", "Analytics=c/postgres"),
        ] {
            let item = decode_item(input).unwrap();
            assert_eq!(encode_item(&item), canonical, "input: {input}");
            assert_eq!(decode_item(&encode_item(&item)).unwrap(), item);
        }
    }
}
