pub mod durable;
pub mod fast;
pub mod memdb;
pub mod memory;
pub mod postgres;
pub mod redis;

pub use durable::{DurableStore, DurableTxn, HoldRow, IdempotencyRecord, OrderRecord, ProductRow};
pub use fast::{
    AtomicOutcome, AtomicProgram, Expectation, FastStore, Guard, GuardedWrite, TxnOutcome,
    WatchKey, WriteOp,
};
pub use memdb::MemDb;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use redis::RedisStore;

/// Literal wire key naming. Every key the crate touches is minted here.
pub mod keys {
    pub fn hold(hold_id: &str) -> String {
        format!("hold:{hold_id}")
    }

    pub fn available_stock(product_id: i64) -> String {
        format!("available_stock:{product_id}")
    }

    pub fn reserved_stock(product_id: i64) -> String {
        format!("reserved_stock:{product_id}")
    }

    pub fn stock_version(product_id: i64) -> String {
        format!("stock_version:{product_id}")
    }

    /// Lazy-initialization guard lease for a product's counters.
    pub fn stock_init(product_id: i64) -> String {
        format!("stock_init:{product_id}")
    }

    /// Aggregate quantity currently held across a product's active holds.
    pub fn active_holds(product_id: i64) -> String {
        format!("active_holds:{product_id}")
    }

    pub fn product_holds(product_id: i64) -> String {
        format!("product_holds:{product_id}")
    }

    /// Sorted set of hold ids scored by expiry epoch-seconds.
    pub fn expiring_index(product_id: i64) -> String {
        format!("expiring_index:{product_id}")
    }

    pub const EXPIRING_INDEX_PATTERN: &str = "expiring_index:*";
    pub const STOCK_VERSION_PATTERN: &str = "stock_version:*";
    pub const HOLD_PATTERN: &str = "hold:*";

    pub fn holds_by_status(status: &str) -> String {
        format!("holds_by_status:{status}")
    }

    pub fn expire_lock(hold_id: &str) -> String {
        format!("expire_lock:{hold_id}")
    }

    /// Product id back out of an `expiring_index:{p}` key.
    pub fn product_of_expiring_index(key: &str) -> Option<i64> {
        key.strip_prefix("expiring_index:")
            .and_then(|raw| raw.parse().ok())
    }

    /// Product id back out of a `stock_version:{p}` key.
    pub fn product_of_stock_version(key: &str) -> Option<i64> {
        key.strip_prefix("stock_version:")
            .and_then(|raw| raw.parse().ok())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_key_shapes() {
            assert_eq!(hold("abc"), "hold:abc");
            assert_eq!(available_stock(7), "available_stock:7");
            assert_eq!(reserved_stock(7), "reserved_stock:7");
            assert_eq!(stock_version(7), "stock_version:7");
            assert_eq!(active_holds(7), "active_holds:7");
            assert_eq!(product_holds(7), "product_holds:7");
            assert_eq!(expiring_index(7), "expiring_index:7");
            assert_eq!(holds_by_status("active"), "holds_by_status:active");
            assert_eq!(expire_lock("abc"), "expire_lock:abc");
        }

        #[test]
        fn test_product_of_expiring_index() {
            assert_eq!(product_of_expiring_index("expiring_index:42"), Some(42));
            assert_eq!(product_of_expiring_index("product_holds:42"), None);
            assert_eq!(product_of_expiring_index("expiring_index:x"), None);
        }
    }
}
