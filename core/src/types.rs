//! Identifiers and request value objects for the stock ledger.
//!
//! Every identifier is a thin `Uuid` newtype so that a `ProductId` can never be
//! passed where a `VariantId` or `LocationId` is expected.

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Catalog product identifier (owned by the catalog feature)
    ProductId
);
uuid_id!(
    /// Catalog variant identifier (owned by the catalog feature)
    VariantId
);
uuid_id!(
    /// Physical stock location
    LocationId
);
uuid_id!(
    /// Identifier of a stock record row
    StockRecordId
);
uuid_id!(
    /// Identifier of an adjustment ledger entry
    AdjustmentId
);
uuid_id!(
    /// Order identifier (owned by the order feature)
    OrderId
);
uuid_id!(
    /// Cart identifier (owned by the cart feature)
    CartId
);
uuid_id!(
    /// Cart line identifier (owned by the cart feature)
    CartLineId
);
uuid_id!(
    /// Opaque token minted for every cart hold
    HoldToken
);

/// Identity of whoever caused a ledger mutation.
///
/// Actors are validated at the API boundary: a malformed or nil id is rejected
/// with [`LedgerError::InvalidActor`] instead of being replaced by some other
/// identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    /// Creates a new random `ActorId` (for service identities and tests)
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validate a `Uuid` as an actor identity.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidActor`] for the nil UUID.
    pub fn from_uuid(uuid: Uuid) -> Result<Self, LedgerError> {
        if uuid.is_nil() {
            return Err(LedgerError::InvalidActor(
                "nil UUID is not an attributable actor".to_string(),
            ));
        }
        Ok(Self(uuid))
    }

    /// Parse a caller-supplied actor id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidActor`] if the string is not a UUID or is nil.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let uuid = Uuid::parse_str(raw.trim())
            .map_err(|e| LedgerError::InvalidActor(format!("'{raw}' is not a valid actor id: {e}")))?;
        Self::from_uuid(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Item references
// ============================================================================

/// The thing being stocked: a product or one of its variants, never both.
///
/// Ordering (products before variants, then by UUID) is the lock order used
/// by every multi-row transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ItemRef {
    /// A product without variants
    Product(ProductId),
    /// A specific product variant
    Variant(VariantId),
}

impl ItemRef {
    /// Product id, if this references a product.
    #[must_use]
    pub const fn product_id(&self) -> Option<ProductId> {
        match self {
            Self::Product(id) => Some(*id),
            Self::Variant(_) => None,
        }
    }

    /// Variant id, if this references a variant.
    #[must_use]
    pub const fn variant_id(&self) -> Option<VariantId> {
        match self {
            Self::Product(_) => None,
            Self::Variant(id) => Some(*id),
        }
    }

    /// Rebuild an item reference from nullable storage columns.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when both or neither column is set.
    pub fn from_columns(product_id: Option<Uuid>, variant_id: Option<Uuid>) -> Result<Self, LedgerError> {
        match (product_id, variant_id) {
            (Some(product), None) => Ok(Self::Product(ProductId::from_uuid(product))),
            (None, Some(variant)) => Ok(Self::Variant(VariantId::from_uuid(variant))),
            (Some(_), Some(_)) => Err(LedgerError::Storage(
                "stock row references both a product and a variant".to_string(),
            )),
            (None, None) => Err(LedgerError::Storage(
                "stock row references neither a product nor a variant".to_string(),
            )),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product(id) => write!(f, "product:{id}"),
            Self::Variant(id) => write!(f, "variant:{id}"),
        }
    }
}

/// Unique key of a stock record: one item at one location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    /// Product or variant
    pub item: ItemRef,
    /// Location holding the stock
    pub location_id: LocationId,
}

impl StockKey {
    /// Creates a new `StockKey`
    #[must_use]
    pub const fn new(item: ItemRef, location_id: LocationId) -> Self {
        Self { item, location_id }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.item, self.location_id)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// One requested (item, quantity) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product or variant
    pub item: ItemRef,
    /// Requested units (must be positive)
    pub quantity: u32,
    /// Location to act on; `None` uses the resolver's default
    pub location_id: Option<LocationId>,
}

impl LineItem {
    /// Line item at the default location
    #[must_use]
    pub const fn new(item: ItemRef, quantity: u32) -> Self {
        Self {
            item,
            quantity,
            location_id: None,
        }
    }

    /// Line item pinned to a location
    #[must_use]
    pub const fn at(item: ItemRef, quantity: u32, location_id: LocationId) -> Self {
        Self {
            item,
            quantity,
            location_id: Some(location_id),
        }
    }
}

/// Order identity as the engine sees it.
///
/// `order_number` is the human-facing key written into ledger references.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef {
    /// Order identifier
    pub order_id: OrderId,
    /// Order number shown to staff and customers
    pub order_number: String,
}

impl OrderRef {
    /// Creates a new `OrderRef`
    #[must_use]
    pub fn new(order_id: OrderId, order_number: impl Into<String>) -> Self {
        Self {
            order_id,
            order_number: order_number.into(),
        }
    }
}

/// A cart line that can carry a hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CartLineRef {
    /// Owning cart
    pub cart_id: CartId,
    /// The line itself
    pub cart_line_id: CartLineId,
}

impl CartLineRef {
    /// Creates a new `CartLineRef`
    #[must_use]
    pub const fn new(cart_id: CartId, cart_line_id: CartLineId) -> Self {
        Self {
            cart_id,
            cart_line_id,
        }
    }
}
