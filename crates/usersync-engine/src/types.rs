//! Identity and attribute types shared across the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// How a user's credential is managed on the dashboard.
///
/// Serialized in canonical spelling; parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum IdentityType {
    /// Platform-native account owned by the user.
    #[serde(rename = "adobeID")]
    AdobeId,
    /// Account owned by the organization, linked to the enterprise directory.
    #[serde(rename = "enterpriseID")]
    EnterpriseId,
    /// Account authenticated through a federated identity provider.
    #[serde(rename = "federatedID")]
    FederatedId,
}

impl IdentityType {
    /// Convert to the canonical string used in user keys and configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityType::AdobeId => "adobeID",
            IdentityType::EnterpriseId => "enterpriseID",
            IdentityType::FederatedId => "federatedID",
        }
    }
}

impl fmt::Display for IdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IdentityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adobeid" | "adobe" => Ok(IdentityType::AdobeId),
            "enterpriseid" | "enterprise" => Ok(IdentityType::EnterpriseId),
            "federatedid" | "federated" => Ok(IdentityType::FederatedId),
            _ => Err(SyncError::UnknownIdentityType {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for IdentityType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Trim and lower-case a name for comparison. Empty input yields `None`.
#[must_use]
pub fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// Unique key of a user: `"<identity_type>,<username>,<domain>"`.
///
/// The domain part is empty when the username is an email address. Keys order
/// lexically, which is the order actions are emitted in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    /// Build a key from raw identity fields.
    ///
    /// Returns `None` when the username (falling back to the email) is missing,
    /// or when a non-email username comes without a domain.
    #[must_use]
    pub fn new(
        identity_type: IdentityType,
        username: Option<&str>,
        domain: Option<&str>,
        email: Option<&str>,
    ) -> Option<Self> {
        let username = normalize(username).or_else(|| normalize(email))?;
        let domain = if username.contains('@') {
            String::new()
        } else {
            normalize(domain)?
        };
        Some(Self(format!("{identity_type},{username},{domain}")))
    }

    /// Parse a key previously produced by [`UserKey::new`].
    pub fn parse(value: &str) -> SyncResult<Self> {
        let mut parts = value.splitn(3, ',');
        let (Some(id_type), Some(username), Some(domain)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::configuration(format!(
                "Malformed user key '{value}': expected 'type,user,domain'"
            )));
        };
        let identity_type: IdentityType = id_type.parse()?;
        let username = username.trim();
        let domain = domain.trim();
        Self::new(
            identity_type,
            Some(username),
            Some(domain).filter(|d| !d.is_empty()),
            None,
        )
        .ok_or_else(|| SyncError::configuration(format!("Invalid user key '{value}'")))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(identity_type, username, domain)`.
    #[must_use]
    pub fn parts(&self) -> (&str, &str, &str) {
        let mut parts = self.0.splitn(3, ',');
        (
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        )
    }

    /// The username component.
    #[must_use]
    pub fn username(&self) -> &str {
        self.parts().1
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A directory or dashboard attribute: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Single(String),
    Multi(Vec<String>),
}

impl AttributeValue {
    /// The first value, if any.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            AttributeValue::Single(v) => Some(v.as_str()),
            AttributeValue::Multi(values) => values.first().map(String::as_str),
        }
    }

    /// Interpret a JSON value produced by a hook.
    ///
    /// `null` means "no value". Scalars other than strings are stringified;
    /// nested objects are rejected.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        fn scalar(value: &serde_json::Value) -> Option<String> {
            match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        }

        match value {
            serde_json::Value::Array(items) => {
                Some(AttributeValue::Multi(items.iter().filter_map(scalar).collect()))
            }
            other => scalar(other).map(AttributeValue::Single),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Single(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Single(value)
    }
}

/// Ordered attribute mapping; keys are unique.
pub type Attributes = BTreeMap<String, AttributeValue>;
