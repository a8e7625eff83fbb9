use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckoutError;

/// Hold lifecycle status.
///
/// `Active` is the only live state; the rest are terminal. A terminal hold
/// is deleted from the fast store by the transition that terminalizes it,
/// so terminal statuses are normally only observed in the durable ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Used,
    Expired,
    PaymentFailed,
}

impl HoldStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Used => "used",
            HoldStatus::Expired => "expired",
            HoldStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn parse(s: &str) -> Option<HoldStatus> {
        match s {
            "active" => Some(HoldStatus::Active),
            "used" => Some(HoldStatus::Used),
            "expired" => Some(HoldStatus::Expired),
            "payment_failed" => Some(HoldStatus::PaymentFailed),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Active)
    }
}

impl std::fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation against a product, as materialized in the fast store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub id: String,
    pub product_id: i64,
    pub qty: i64,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Expiry as integer epoch-seconds; the sorted-index score and the
    /// value every expiry comparison runs against.
    pub expires_at_epoch: i64,
    /// Stock version captured at creation.
    pub version: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Hold {
    /// Expiry comparison is inclusive: a hold whose deadline equals `now`
    /// is already expired.
    pub fn is_expired_at(&self, now_epoch: i64) -> bool {
        self.expires_at_epoch <= now_epoch
    }

    /// Field layout of the `hold:{id}` hash.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("product_id".into(), self.product_id.to_string()),
            ("qty".into(), self.qty.to_string()),
            ("status".into(), self.status.as_str().into()),
            ("created_at".into(), self.created_at.to_rfc3339()),
            ("expires_at".into(), self.expires_at.to_rfc3339()),
            ("expires_at_epoch".into(), self.expires_at_epoch.to_string()),
            ("version".into(), self.version.to_string()),
        ];
        if let Some(at) = self.last_accessed_at {
            fields.push(("last_accessed_at".into(), at.to_rfc3339()));
        }
        fields
    }

    /// Rehydrate from a hash record, normalizing numeric fields. A record
    /// missing required fields or carrying non-numeric values surfaces
    /// `HoldInvalid` rather than a panic.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Hold, CheckoutError> {
        fn int(fields: &HashMap<String, String>, name: &str) -> Result<i64, CheckoutError> {
            fields
                .get(name)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| CheckoutError::HoldInvalid {
                    reason: format!("malformed hold field `{name}`"),
                })
        }
        fn time(
            fields: &HashMap<String, String>,
            name: &str,
        ) -> Result<DateTime<Utc>, CheckoutError> {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| CheckoutError::HoldInvalid {
                    reason: format!("malformed hold field `{name}`"),
                })
        }

        let status = fields
            .get("status")
            .and_then(|s| HoldStatus::parse(s))
            .ok_or_else(|| CheckoutError::HoldInvalid {
                reason: "malformed hold field `status`".into(),
            })?;

        Ok(Hold {
            id: id.to_string(),
            product_id: int(fields, "product_id")?,
            qty: int(fields, "qty")?,
            status,
            created_at: time(fields, "created_at")?,
            expires_at: time(fields, "expires_at")?,
            expires_at_epoch: int(fields, "expires_at_epoch")?,
            version: int(fields, "version")?,
            last_accessed_at: fields
                .get("last_accessed_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Per-product stock counters as observed in the fast store.
///
/// `version` increases strictly with every mutation and doubles as the
/// optimistic-concurrency signal returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub available: i64,
    pub reserved: i64,
    pub version: i64,
}

/// Durable order state. Transitions only move forward:
/// `PendingPayment -> Paid | Cancelled`, never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    PendingPayment,
    Paid,
    Cancelled,
}

impl OrderState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderState::PendingPayment => "pending_payment",
            OrderState::Paid => "paid",
            OrderState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderState> {
        match s {
            "pending_payment" => Some(OrderState::PendingPayment),
            "paid" => Some(OrderState::Paid),
            "cancelled" => Some(OrderState::Cancelled),
            _ => None,
        }
    }

    pub const fn is_final(&self) -> bool {
        !matches!(self, OrderState::PendingPayment)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment processor verdict carried by a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Success,
    Failure,
}

/// Status recorded on the idempotency log at first-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Paid,
    Failed,
}

impl IdempotencyStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Paid => "paid",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<IdempotencyStatus> {
        match s {
            "paid" => Some(IdempotencyStatus::Paid),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

impl From<WebhookStatus> for IdempotencyStatus {
    fn from(status: WebhookStatus) -> Self {
        match status {
            WebhookStatus::Success => IdempotencyStatus::Paid,
            WebhookStatus::Failure => IdempotencyStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_hold() -> Hold {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let expires = created + chrono::Duration::seconds(120);
        Hold {
            id: "4f7c2b1e-aaaa-bbbb-cccc-000000000001".into(),
            product_id: 7,
            qty: 3,
            status: HoldStatus::Active,
            created_at: created,
            expires_at: expires,
            expires_at_epoch: expires.timestamp(),
            version: 5,
            last_accessed_at: None,
        }
    }

    #[test]
    fn test_hold_fields_round_trip() {
        let hold = sample_hold();
        let map: HashMap<String, String> = hold.to_fields().into_iter().collect();
        let back = Hold::from_fields(&hold.id, &map).unwrap();
        assert_eq!(back, hold);
    }

    #[test]
    fn test_hold_malformed_numeric_field_is_invalid() {
        let hold = sample_hold();
        let mut map: HashMap<String, String> = hold.to_fields().into_iter().collect();
        map.insert("qty".into(), "three".into());
        let err = Hold::from_fields(&hold.id, &map).unwrap_err();
        assert!(matches!(err, CheckoutError::HoldInvalid { .. }));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let hold = sample_hold();
        assert!(!hold.is_expired_at(hold.expires_at_epoch - 1));
        assert!(hold.is_expired_at(hold.expires_at_epoch));
        assert!(hold.is_expired_at(hold.expires_at_epoch + 1));
    }

    #[test]
    fn test_order_state_vocabulary_is_canonical() {
        assert_eq!(OrderState::parse("pending_payment"), Some(OrderState::PendingPayment));
        // The seeder vocabulary from the legacy system is rejected.
        assert_eq!(OrderState::parse("pending"), None);
        assert_eq!(OrderState::parse("processing"), None);
        assert_eq!(OrderState::parse("completed"), None);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            HoldStatus::Active,
            HoldStatus::Used,
            HoldStatus::Expired,
            HoldStatus::PaymentFailed,
        ] {
            assert_eq!(HoldStatus::parse(status.as_str()), Some(status));
        }
    }
}
