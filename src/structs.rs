use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod purchase;
pub mod user;

/// Kind of authorization token. Each kind grants a different capability against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Earner,
    Spender,
    Indicator,
    Account,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Earner => write!(f, "earner"),
            Self::Spender => write!(f, "spender"),
            Self::Indicator => write!(f, "indicator"),
            Self::Account => write!(f, "account"),
        }
    }
}

/// Stored token values, one per type.
pub type AuthTokens = BTreeMap<TokenType, String>;

/// Host-supplied values sent with every request (sponsor ID, client version, ...).
pub type RequestMetadata = BTreeMap<String, String>;

/// How new tokens are combined with the stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSetMode {
    /// Add or overwrite only the given types.
    Merge,
    /// Discard all stored tokens first. Only allowed for tracker users.
    ReplaceAll,
}

/// Price of a purchasable item, as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasePrice {
    #[serde(rename = "class")]
    pub transaction_class: String,
    pub distinguisher: String,
    /// Positive magnitude; sent to the server negated as a debit.
    pub price: i64,
}

/// A completed expiring purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    /// Server-issued transaction ID. Unique within the store.
    pub id: String,
    #[serde(rename = "class")]
    pub transaction_class: String,
    pub distinguisher: String,
    pub authorization: Option<String>,
    /// Expiry in server time. This is the authoritative value.
    pub server_time_expiry: Option<DateTime<Utc>>,
    /// `server_time_expiry` shifted into local time by the stored clock skew.
    /// Derived on every read, never persisted.
    #[serde(skip)]
    pub local_time_expiry: Option<DateTime<Utc>>,
}

// The derived local expiry is deliberately excluded.
impl PartialEq for Purchase {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.transaction_class == other.transaction_class
            && self.distinguisher == other.distinguisher
            && self.authorization == other.authorization
            && self.server_time_expiry == other.server_time_expiry
    }
}

impl Eq for Purchase {}

impl Purchase {
    pub(crate) fn is_expired(&self, local_now: DateTime<Utc>) -> bool {
        matches!(self.local_time_expiry, Some(expiry) if expiry < local_now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn purchase(id: &str) -> Purchase {
        Purchase {
            id: id.to_string(),
            transaction_class: "speed-boost".to_string(),
            distinguisher: "1hr".to_string(),
            authorization: None,
            server_time_expiry: Some(Utc::now()),
            local_time_expiry: None,
        }
    }

    #[test]
    fn purchase_equality_ignores_local_expiry() {
        let a = purchase("a");
        let mut b = a.clone();
        b.local_time_expiry = Some(Utc::now());

        assert_eq!(a, b);
        assert_ne!(a, purchase("b"));
    }

    #[test]
    fn local_expiry_is_not_serialized() {
        let mut p = purchase("a");
        p.local_time_expiry = Some(Utc::now());

        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("localTimeExpiry").is_none());
        assert_eq!(json["class"], "speed-boost");
        assert!(json["serverTimeExpiry"].is_string());
    }

    #[test]
    fn expiry_uses_local_time() {
        let now = Utc::now();
        let mut p = purchase("a");
        assert!(!p.is_expired(now));

        p.local_time_expiry = Some(now - TimeDelta::seconds(1));
        assert!(p.is_expired(now));

        p.local_time_expiry = Some(now + TimeDelta::seconds(1));
        assert!(!p.is_expired(now));
    }

    #[test]
    fn token_types_serialize_lowercase() {
        let mut tokens = AuthTokens::new();
        tokens.insert(TokenType::Earner, "e".into());
        let json = serde_json::to_string(&tokens).unwrap();
        assert_eq!(json, r#"{"earner":"e"}"#);
        assert_eq!(TokenType::Spender.to_string(), "spender");
    }
}
