//! Identifiers and reference types shared by the plan model and the caches.
//!
//! Everything in here is small, cheaply clonable and (de)serializable, since it ends up both in
//! cache keys and in the serialized plan envelopes of the shared cache.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A versioned identifier of a stored object, such as a view definition or portfolio.
///
/// Formats as `scheme~value` or `scheme~value~version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    pub scheme: Arc<str>,
    pub value: Arc<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Arc<str>>,
}

impl UniqueId {
    pub fn of(scheme: &str, value: &str) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.scheme, self.value)?;
        if let Some(ref version) = self.version {
            write!(f, "~{version}")?;
        }
        Ok(())
    }
}

/// The resolution-time context that identifiers are resolved at.
///
/// `None` for either instant means "latest".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionCorrection {
    pub version_as_of: Option<DateTime<Utc>>,
    pub corrected_to: Option<DateTime<Utc>>,
}

impl VersionCorrection {
    /// Resolves to the latest version and latest correction.
    pub const LATEST: Self = Self {
        version_as_of: None,
        corrected_to: None,
    };
}

impl fmt::Display for VersionCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version_as_of {
            Some(v) => write!(f, "V{}", v.to_rfc3339())?,
            None => f.write_str("VLATEST")?,
        }
        match self.corrected_to {
            Some(c) => write!(f, ".C{}", c.to_rfc3339()),
            None => f.write_str(".CLATEST"),
        }
    }
}

/// An opaque token describing one market data provider consulted by a view.
///
/// Two providers that yield the same hint are assumed to make the same data available, so a
/// plan compiled against one can be reused with the other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderHint(Arc<str>);

impl ProviderHint {
    pub fn new(hint: impl Into<Arc<str>>) -> Self {
        Self(hint.into())
    }
}

impl AsRef<str> for ProviderHint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderHint {
    fn from(hint: &str) -> Self {
        Self::new(hint)
    }
}

impl fmt::Display for ProviderHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of object a computation target refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Portfolio,
    PortfolioNode,
    Position,
    Trade,
    Security,
    Primitive,
}

impl AsRef<str> for TargetType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Portfolio => "portfolio",
            Self::PortfolioNode => "portfolio_node",
            Self::Position => "position",
            Self::Trade => "trade",
            Self::Security => "security",
            Self::Primitive => "primitive",
        }
    }
}

/// A reference to a computation target, prior to resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetReference {
    pub target_type: TargetType,
    pub identifier: Arc<str>,
}

impl TargetReference {
    pub fn new(target_type: TargetType, identifier: &str) -> Self {
        Self {
            target_type,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for TargetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type.as_ref(), self.identifier)
    }
}

/// A view definition, as stored in the configuration source.
///
/// Plans only carry this by reference when serialized, it is resolved again on read-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    pub unique_id: UniqueId,
    pub name: String,
    pub market_data_user: String,
    pub portfolio_id: Option<UniqueId>,
    pub calculation_configurations: Vec<String>,
}

/// A portfolio, as stored in the position source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portfolio {
    pub unique_id: UniqueId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_unique_id_display() {
        let id = UniqueId::of("DbCfg", "view-1");
        assert_eq!(id.to_string(), "DbCfg~view-1");
        assert_eq!(id.with_version("3").to_string(), "DbCfg~view-1~3");
    }

    #[test]
    fn test_version_correction_display() {
        assert_eq!(VersionCorrection::LATEST.to_string(), "VLATEST.CLATEST");

        let t = Utc.with_ymd_and_hms(2013, 2, 1, 12, 0, 0).unwrap();
        let vc = VersionCorrection {
            version_as_of: Some(t),
            corrected_to: None,
        };
        assert_eq!(vc.to_string(), "V2013-02-01T12:00:00+00:00.CLATEST");
    }
}
