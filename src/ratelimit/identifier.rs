//! Rate limit identifiers and their storage keys.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix applied to an identifier's storage key to address its lockout record.
pub const LOCKOUT_PREFIX: &str = "lockout:";

/// Reasons an email or network address cannot be turned into an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("{0} must not be empty")]
    Empty(IdentifierClass),
    #[error("malformed email address: {0:?}")]
    MalformedEmail(String),
    #[error("malformed network address: {0:?}")]
    MalformedIp(String),
}

/// The class of subject an identifier counts attempts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierClass {
    /// The account, keyed by email address
    Email,
    /// The network origin, keyed by source address
    Ip,
}

impl IdentifierClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierClass::Email => "email",
            IdentifierClass::Ip => "ip",
        }
    }
}

impl fmt::Display for IdentifierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated (class, value) pair used as a rate limit key.
///
/// Values are normalized on construction so that equal subjects always produce
/// equal keys: emails are trimmed and lower-cased, addresses are rendered in
/// their canonical textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    class: IdentifierClass,
    value: String,
}

impl Identifier {
    /// Build an account identifier from an email address.
    pub fn email(raw: &str) -> Result<Self, IdentifierError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(IdentifierError::Empty(IdentifierClass::Email));
        }

        let malformed = || IdentifierError::MalformedEmail(raw.to_string());

        if value.chars().any(char::is_whitespace) {
            return Err(malformed());
        }

        let (local, domain) = value.split_once('@').ok_or_else(malformed)?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(malformed());
        }
        if domain.split('.').any(str::is_empty) {
            return Err(malformed());
        }

        Ok(Self {
            class: IdentifierClass::Email,
            value: value.to_lowercase(),
        })
    }

    /// Build a network origin identifier from a textual IPv4 or IPv6 address.
    pub fn ip(raw: &str) -> Result<Self, IdentifierError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(IdentifierError::Empty(IdentifierClass::Ip));
        }

        let addr: IpAddr = value
            .parse()
            .map_err(|_| IdentifierError::MalformedIp(raw.to_string()))?;

        Ok(Self {
            class: IdentifierClass::Ip,
            value: addr.to_string(),
        })
    }

    pub fn class(&self) -> IdentifierClass {
        self.class
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Key under which attempt records for this identifier are stored.
    ///
    /// Format: `"{class}:{value}"`, e.g. `email:user@example.com`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.class, self.value)
    }

    /// Key under which the lockout record for this identifier is stored.
    pub fn lockout_key(&self) -> String {
        format!("{}{}", LOCKOUT_PREFIX, self.storage_key())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_identifier_keys() {
        let id = Identifier::email("test@ocupop.com").unwrap();

        assert_eq!(id.class(), IdentifierClass::Email);
        assert_eq!(id.storage_key(), "email:test@ocupop.com");
        assert_eq!(id.lockout_key(), "lockout:email:test@ocupop.com");
    }

    #[test]
    fn test_email_is_normalized() {
        let a = Identifier::email("  Test@Ocupop.COM ").unwrap();
        let b = Identifier::email("test@ocupop.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_emails_rejected() {
        for raw in [
            "plainaddress",
            "@ocupop.com",
            "test@",
            "a@b@c.com",
            "te st@ocupop.com",
            "test@ocupop..com",
        ] {
            assert!(
                matches!(Identifier::email(raw), Err(IdentifierError::MalformedEmail(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        assert_eq!(
            Identifier::email("   "),
            Err(IdentifierError::Empty(IdentifierClass::Email))
        );
        assert_eq!(Identifier::ip(""), Err(IdentifierError::Empty(IdentifierClass::Ip)));
    }

    #[test]
    fn test_ip_identifier_is_canonical() {
        let v4 = Identifier::ip("127.0.0.1").unwrap();
        assert_eq!(v4.storage_key(), "ip:127.0.0.1");

        let v6 = Identifier::ip("0:0:0:0:0:0:0:1").unwrap();
        assert_eq!(v6, Identifier::ip("::1").unwrap());
        assert_eq!(v6.lockout_key(), "lockout:ip:::1");
    }

    #[test]
    fn test_malformed_ip_rejected() {
        assert!(matches!(
            Identifier::ip("999.1.1.1"),
            Err(IdentifierError::MalformedIp(_))
        ));
        assert!(matches!(
            Identifier::ip("not-an-ip"),
            Err(IdentifierError::MalformedIp(_))
        ));
    }

    #[test]
    fn test_classes_never_collide() {
        // Same raw text cannot appear in both classes, but keys stay distinct by prefix.
        let email = Identifier::email("a@b.c").unwrap();
        let ip = Identifier::ip("10.0.0.1").unwrap();
        assert_ne!(email.storage_key(), ip.storage_key());
        assert!(email.storage_key().starts_with("email:"));
        assert!(ip.storage_key().starts_with("ip:"));
    }
}
