use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures raised by the fast-store adapter.
///
/// The adapter performs no retries; callers decide whether a failure is
/// worth another attempt. Optimistic-transaction conflicts are not errors,
/// they surface as [`crate::store::TxnOutcome::Conflict`].
#[derive(Debug, Error)]
pub enum FastStoreError {
    /// Transport-level problem: the store cannot be reached at all.
    #[error("fast store unavailable: {0}")]
    Unavailable(String),
    /// The store answered, but with something we cannot use.
    #[error("fast store backend error: {0}")]
    Backend(String),
}

/// Failures raised by the durable store.
#[derive(Debug, Error)]
pub enum DurableError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row violates the canonical vocabulary (e.g. an order state
    /// outside `pending_payment | paid | cancelled`).
    #[error("corrupt durable record: {0}")]
    Corrupt(String),
}

impl DurableError {
    /// Deadlock-class errors are retried by callers up to policy; everything
    /// else propagates immediately. Postgres signals these as SQLSTATE
    /// `40001` (serialization failure) and `40P01` (deadlock detected).
    pub fn is_deadlock(&self) -> bool {
        match self {
            DurableError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

/// The checkout error taxonomy.
///
/// User-level variants map to 4xx responses at the (out-of-scope) handler
/// boundary; infrastructure variants are retried per policy and surface as
/// 5xx only after exhaustion.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("hold {hold_id} not found")]
    HoldNotFound { hold_id: String },

    #[error("hold {hold_id} has already been used")]
    HoldAlreadyUsed { hold_id: String },

    #[error("hold expired at {expires_at}")]
    HoldExpired { expires_at: DateTime<Utc> },

    #[error("hold does not expire until {expires_at} ({seconds_remaining}s remaining)")]
    HoldNotExpired {
        expires_at: DateTime<Utc>,
        seconds_remaining: i64,
    },

    #[error("invalid hold: {reason}")]
    HoldInvalid { reason: String },

    #[error("requested quantity {qty} is out of range")]
    InvalidQuantity { qty: i64 },

    /// Carries the stock snapshot observed at rejection time so clients can
    /// retry informedly.
    #[error("insufficient stock: available={available} reserved={reserved} version={version}")]
    InsufficientStock {
        available: i64,
        reserved: i64,
        version: i64,
    },

    #[error("invalid release: reserved={reserved} requested={requested}")]
    InvalidRelease { reserved: i64, requested: i64 },

    /// Optimistic retries exhausted without a commit.
    #[error("concurrent modification, retries exhausted")]
    ConcurrentModification,

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: i64 },

    #[error("product {product_id} not found")]
    ProductNotFound { product_id: i64 },

    #[error("state conflict: {reason}")]
    StateConflict { reason: String },

    #[error("fast store unavailable")]
    FastStoreUnavailable,

    #[error("fast store failure: {0}")]
    FastStore(FastStoreError),

    #[error("durable store failure: {0}")]
    Durable(#[from] DurableError),
}

impl From<FastStoreError> for CheckoutError {
    fn from(err: FastStoreError) -> Self {
        match err {
            FastStoreError::Unavailable(_) => CheckoutError::FastStoreUnavailable,
            other => CheckoutError::FastStore(other),
        }
    }
}

impl CheckoutError {
    /// HTTP status family for the handler boundary.
    pub fn status_class(&self) -> u16 {
        match self {
            CheckoutError::HoldNotFound { .. }
            | CheckoutError::OrderNotFound { .. }
            | CheckoutError::ProductNotFound { .. } => 404,
            CheckoutError::HoldExpired { .. } => 410,
            CheckoutError::StateConflict { .. } => 409,
            CheckoutError::HoldAlreadyUsed { .. }
            | CheckoutError::HoldNotExpired { .. }
            | CheckoutError::HoldInvalid { .. }
            | CheckoutError::InvalidQuantity { .. }
            | CheckoutError::InsufficientStock { .. }
            | CheckoutError::InvalidRelease { .. } => 400,
            CheckoutError::FastStoreUnavailable => 503,
            CheckoutError::ConcurrentModification
            | CheckoutError::FastStore(_)
            | CheckoutError::Durable(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_store_unavailable_maps_to_dedicated_variant() {
        let err: CheckoutError = FastStoreError::Unavailable("refused".into()).into();
        assert!(matches!(err, CheckoutError::FastStoreUnavailable));
        assert_eq!(err.status_class(), 503);

        let err: CheckoutError = FastStoreError::Backend("bad reply".into()).into();
        assert!(matches!(err, CheckoutError::FastStore(_)));
        assert_eq!(err.status_class(), 500);
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(
            CheckoutError::HoldNotFound {
                hold_id: "h".into()
            }
            .status_class(),
            404
        );
        assert_eq!(
            CheckoutError::InsufficientStock {
                available: 0,
                reserved: 1,
                version: 3
            }
            .status_class(),
            400
        );
        assert_eq!(
            CheckoutError::HoldExpired {
                expires_at: Utc::now()
            }
            .status_class(),
            410
        );
        assert_eq!(
            CheckoutError::StateConflict {
                reason: "x".into()
            }
            .status_class(),
            409
        );
    }
}
