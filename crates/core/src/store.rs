//! Read-Only Pharmacy Data Store
//!
//! The persisted dataset is a JSON array of orders. It is loaded once at
//! startup and indexed by canonical order id and canonical member id.

use crate::identifier::normalize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read pharmacy data from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse pharmacy data: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A single prescription line on an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prescription {
    pub rx_id: String,
    pub name: String,
    pub refills_remaining: u32,
}

/// One order record as persisted in the dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub order_id: String,
    pub member_id: String,
    pub status: String,
    /// Free-form timing information, passed through to the dialogue as-is.
    pub timing: serde_json::Value,
    #[serde(default)]
    pub prescriptions: Vec<Prescription>,
}

/// Result of looking up an order on behalf of a member.
#[derive(Debug, PartialEq)]
pub enum OrderAccess<'a> {
    /// The order exists and belongs to the member.
    Verified(&'a OrderRecord),
    /// The order exists but belongs to someone else.
    MemberMismatch,
    NotFound,
}

#[derive(Debug, Default)]
pub struct OrderStore {
    orders: Vec<OrderRecord>,
    by_order: HashMap<String, usize>,
    by_member: HashMap<String, Vec<usize>>,
}

impl OrderStore {
    pub fn new(orders: Vec<OrderRecord>) -> Self {
        let mut by_order = HashMap::new();
        let mut by_member: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, order) in orders.iter().enumerate() {
            // First record wins when an order id is duplicated.
            by_order.entry(normalize(&order.order_id)).or_insert(idx);
            by_member
                .entry(normalize(&order.member_id))
                .or_default()
                .push(idx);
        }
        Self {
            orders,
            by_order,
            by_member,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let orders: Vec<OrderRecord> = serde_json::from_str(json)?;
        Ok(Self::new(orders))
    }

    /// Loads the dataset from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn member_exists(&self, member_id: &str) -> bool {
        self.by_member.contains_key(&normalize(member_id))
    }

    /// All orders belonging to a member, in dataset order.
    pub fn member_orders(&self, member_id: &str) -> Vec<&OrderRecord> {
        self.by_member
            .get(&normalize(member_id))
            .map(|indices| indices.iter().map(|&i| &self.orders[i]).collect())
            .unwrap_or_default()
    }

    pub fn order(&self, order_id: &str) -> Option<&OrderRecord> {
        self.by_order
            .get(&normalize(order_id))
            .map(|&i| &self.orders[i])
    }

    /// Looks up an order and checks that it belongs to `member_id`.
    pub fn order_for_member(&self, order_id: &str, member_id: &str) -> OrderAccess<'_> {
        match self.order(order_id) {
            Some(order) if normalize(&order.member_id) == normalize(member_id) => {
                OrderAccess::Verified(order)
            }
            Some(_) => OrderAccess::MemberMismatch,
            None => OrderAccess::NotFound,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_DATA: &str = r#"[
        {
            "order_id": "ORD001",
            "member_id": "M1001",
            "status": "Ready for pickup",
            "timing": "Ready since this morning",
            "prescriptions": [
                {"rx_id": "RX1001", "name": "Lisinopril 10mg", "refills_remaining": 3},
                {"rx_id": "RX1002", "name": "Metformin 500mg", "refills_remaining": 0}
            ]
        },
        {
            "order_id": "ORD002",
            "member_id": "M1002",
            "status": "Processing",
            "timing": {"estimated_ready": "Tomorrow after 2 PM"},
            "prescriptions": [
                {"rx_id": "RX2001", "name": "Atorvastatin 20mg", "refills_remaining": 5}
            ]
        },
        {
            "order_id": "ORD003",
            "member_id": "M1002",
            "status": "Shipped",
            "timing": "Delivered in 2-3 business days",
            "prescriptions": []
        }
    ]"#;

    pub(crate) fn sample_store() -> OrderStore {
        OrderStore::from_json(SAMPLE_DATA).expect("sample data should parse")
    }

    #[test]
    fn test_lookup_normalizes_ids() {
        let store = sample_store();
        assert_eq!(store.len(), 3);
        assert!(store.member_exists("m one zero zero one"));
        assert!(!store.member_exists("M9999"));
        assert_eq!(
            store.order("o r d zero zero two").map(|o| o.member_id.as_str()),
            Some("M1002")
        );
    }

    #[test]
    fn test_member_orders_preserve_dataset_order() {
        let store = sample_store();
        let ids: Vec<_> = store
            .member_orders("M-1-0-0-2")
            .iter()
            .map(|o| o.order_id.as_str())
            .collect();
        assert_eq!(ids, ["ORD002", "ORD003"]);
        assert!(store.member_orders("M4040").is_empty());
    }

    #[test]
    fn test_order_for_member_policy() {
        let store = sample_store();
        assert!(matches!(
            store.order_for_member("ORD001", "m1001"),
            OrderAccess::Verified(order) if order.order_id == "ORD001"
        ));
        assert_eq!(
            store.order_for_member("ORD001", "M1002"),
            OrderAccess::MemberMismatch
        );
        assert_eq!(
            store.order_for_member("ORD404", "M1001"),
            OrderAccess::NotFound
        );
    }

    #[test]
    fn test_malformed_dataset_is_rejected() {
        let err = OrderStore::from_json(r#"[{"order_id": "ORD001"}]"#).unwrap_err();
        assert!(matches!(err, StoreError::Parse(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = OrderStore::load(Path::new("/nonexistent/pharmacy-data.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pharmacy-data.json"));
    }
}
