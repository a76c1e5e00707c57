//! Stock locations and location resolution.
//!
//! Choosing the *best* location for an order is a routing concern outside the
//! engine. The engine only asks a [`LocationResolver`] which location a line
//! without an explicit location should act on.

use crate::types::LocationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical place that holds stock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Location id
    pub id: LocationId,
    /// Short unique code ("MAIN", "WH-2")
    pub code: String,
    /// Display name
    pub name: String,
    /// Whether this is the location used when none is requested
    pub is_default: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Location {
    /// Creates a new default location
    #[must_use]
    pub fn new_default(code: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: LocationId::new(),
            code: code.into(),
            name: name.into(),
            is_default: true,
            created_at: now,
        }
    }
}

/// Decides which location services a line.
pub trait LocationResolver: Send + Sync {
    /// Location for a line, given what the caller asked for.
    fn resolve(&self, requested: Option<LocationId>) -> LocationId;
}

/// Uses the requested location, falling back to a default resolved at startup.
#[derive(Clone, Copy, Debug)]
pub struct DefaultLocationResolver {
    default_location: LocationId,
}

impl DefaultLocationResolver {
    /// Creates a new `DefaultLocationResolver`
    #[must_use]
    pub const fn new(default_location: LocationId) -> Self {
        Self { default_location }
    }

    /// The fallback location
    #[must_use]
    pub const fn default_location(&self) -> LocationId {
        self.default_location
    }
}

impl LocationResolver for DefaultLocationResolver {
    fn resolve(&self, requested: Option<LocationId>) -> LocationId {
        requested.unwrap_or(self.default_location)
    }
}
