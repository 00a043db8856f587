//! Pharmacy Tools
//!
//! The dialogue engine may call exactly five tools. Each request is parsed into
//! the closed [`ToolCall`] enum, which validates the arguments against the
//! tool's parameter struct, and is then executed against the [`OrderStore`].
//! Failures never propagate: an unknown function or malformed arguments become
//! an `{"error": ...}` payload the engine can react to conversationally.

use crate::{
    conversation::{ToolCallRequest, ToolResult},
    identifier::normalize,
    store::{OrderAccess, OrderRecord, OrderStore, Prescription},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

// --- Parameters ---

#[derive(Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct MemberArgs {
    /// The member ID (e.g., M1001)
    pub member_id: String,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct OrderArgs {
    /// The order ID (e.g., ORD001)
    pub order_id: String,
    /// The member ID the order should belong to
    pub member_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Invalid arguments for {function}: {source}")]
    InvalidArguments {
        function: &'static str,
        source: serde_json::Error,
    },
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    VerifyMemberId(MemberArgs),
    ListMemberOrders(MemberArgs),
    GetOrderDetails(OrderArgs),
    GetOrderTiming(OrderArgs),
    GetOrderRefills(OrderArgs),
}

impl ToolCall {
    pub const VERIFY_MEMBER_ID: &'static str = "verify_member_id";
    pub const LIST_MEMBER_ORDERS: &'static str = "list_member_orders";
    pub const GET_ORDER_DETAILS: &'static str = "get_order_details";
    pub const GET_ORDER_TIMING: &'static str = "get_order_timing";
    pub const GET_ORDER_REFILLS: &'static str = "get_order_refills";

    /// Validates a named invocation against the tool's parameter schema.
    pub fn parse(name: &str, arguments: &Map<String, Value>) -> Result<Self, ToolError> {
        match name {
            Self::VERIFY_MEMBER_ID => {
                parse_args(Self::VERIFY_MEMBER_ID, arguments).map(Self::VerifyMemberId)
            }
            Self::LIST_MEMBER_ORDERS => {
                parse_args(Self::LIST_MEMBER_ORDERS, arguments).map(Self::ListMemberOrders)
            }
            Self::GET_ORDER_DETAILS => {
                parse_args(Self::GET_ORDER_DETAILS, arguments).map(Self::GetOrderDetails)
            }
            Self::GET_ORDER_TIMING => {
                parse_args(Self::GET_ORDER_TIMING, arguments).map(Self::GetOrderTiming)
            }
            Self::GET_ORDER_REFILLS => {
                parse_args(Self::GET_ORDER_REFILLS, arguments).map(Self::GetOrderRefills)
            }
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifyMemberId(_) => Self::VERIFY_MEMBER_ID,
            Self::ListMemberOrders(_) => Self::LIST_MEMBER_ORDERS,
            Self::GetOrderDetails(_) => Self::GET_ORDER_DETAILS,
            Self::GetOrderTiming(_) => Self::GET_ORDER_TIMING,
            Self::GetOrderRefills(_) => Self::GET_ORDER_REFILLS,
        }
    }
}

fn parse_args<T: DeserializeOwned>(
    function: &'static str,
    arguments: &Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(arguments.clone()))
        .map_err(|source| ToolError::InvalidArguments { function, source })
}

// --- Schema ---

/// A tool definition advertised to the dialogue engine.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema of the parameters object.
    pub parameters: Value,
}

fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

static TOOL_SCHEMA: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    vec![
        ToolSpec {
            name: ToolCall::VERIFY_MEMBER_ID,
            description: "Verify if a member ID exists in the system",
            parameters: parameters_schema::<MemberArgs>(),
        },
        ToolSpec {
            name: ToolCall::LIST_MEMBER_ORDERS,
            description: "List all orders for a member. Use when asked 'what orders do I have?'",
            parameters: parameters_schema::<MemberArgs>(),
        },
        ToolSpec {
            name: ToolCall::GET_ORDER_DETAILS,
            description: "Get medication details for an order. Use when asked 'what medication?'",
            parameters: parameters_schema::<OrderArgs>(),
        },
        ToolSpec {
            name: ToolCall::GET_ORDER_TIMING,
            description: "Get timing info for an order. Use when asked 'when will it be ready?'",
            parameters: parameters_schema::<OrderArgs>(),
        },
        ToolSpec {
            name: ToolCall::GET_ORDER_REFILLS,
            description: "Get refill info for an order. Use when asked 'do I have refills?'",
            parameters: parameters_schema::<OrderArgs>(),
        },
    ]
});

/// The fixed set of tools offered on every dialogue call.
pub fn tool_schema() -> &'static [ToolSpec] {
    &TOOL_SCHEMA
}

// --- Outcomes ---

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemberVerification {
    pub found: bool,
    pub member_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderSummary {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemberOrders {
    pub found: bool,
    pub member_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<Vec<OrderSummary>>,
}

/// An order-scoped answer. `data` is only present when the order exists and
/// belongs to the requesting member.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderLookup<T> {
    pub found: bool,
    pub verified: bool,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> OrderLookup<T> {
    fn from_access(access: OrderAccess<'_>, project: impl FnOnce(&OrderRecord) -> T) -> Self {
        match access {
            OrderAccess::Verified(order) => Self {
                found: true,
                verified: true,
                data: Some(project(order)),
            },
            OrderAccess::MemberMismatch => Self {
                found: true,
                verified: false,
                data: None,
            },
            OrderAccess::NotFound => Self {
                found: false,
                verified: false,
                data: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderDetails {
    pub order_id: String,
    pub prescriptions: Vec<Prescription>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderTiming {
    pub order_id: String,
    pub status: String,
    pub timing: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefillInfo {
    pub medication: String,
    pub rx_id: String,
    pub refills_remaining: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderRefills {
    pub order_id: String,
    pub refills: Vec<RefillInfo>,
}

/// The outcome of one dispatched tool call.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ToolOutcome {
    Member(MemberVerification),
    Orders(MemberOrders),
    Details(OrderLookup<OrderDetails>),
    Timing(OrderLookup<OrderTiming>),
    Refills(OrderLookup<OrderRefills>),
    Failed { error: String },
}

impl ToolOutcome {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": format!("Failed to encode tool result: {e}") })
        })
    }
}

// --- Dispatcher ---

/// Executes tool calls against the read-only order store.
#[derive(Clone)]
pub struct ToolDispatcher {
    store: Arc<OrderStore>,
}

impl ToolDispatcher {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }

    /// Validates and runs one request from the dialogue engine.
    pub fn dispatch(&self, request: &ToolCallRequest) -> ToolOutcome {
        info!(function = %request.name, arguments = ?request.arguments, "Calling tool");
        let outcome = match ToolCall::parse(&request.name, &request.arguments) {
            Ok(call) => self.execute(&call),
            Err(e) => {
                warn!(function = %request.name, error = %e, "Rejected tool call");
                ToolOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        info!(function = %request.name, result = ?outcome, "Tool result");
        outcome
    }

    /// Runs a request and wraps the outcome as the matching tool result.
    pub fn dispatch_to_result(&self, request: &ToolCallRequest) -> (ToolOutcome, ToolResult) {
        let outcome = self.dispatch(request);
        let result = ToolResult {
            tool_call_id: request.id.clone(),
            payload: outcome.to_payload(),
        };
        (outcome, result)
    }

    pub fn execute(&self, call: &ToolCall) -> ToolOutcome {
        match call {
            ToolCall::VerifyMemberId(args) => {
                ToolOutcome::Member(self.verify_member_id(&args.member_id))
            }
            ToolCall::ListMemberOrders(args) => {
                ToolOutcome::Orders(self.list_member_orders(&args.member_id))
            }
            ToolCall::GetOrderDetails(args) => {
                ToolOutcome::Details(self.get_order_details(&args.order_id, &args.member_id))
            }
            ToolCall::GetOrderTiming(args) => {
                ToolOutcome::Timing(self.get_order_timing(&args.order_id, &args.member_id))
            }
            ToolCall::GetOrderRefills(args) => {
                ToolOutcome::Refills(self.get_order_refills(&args.order_id, &args.member_id))
            }
        }
    }

    pub fn verify_member_id(&self, member_id: &str) -> MemberVerification {
        MemberVerification {
            found: self.store.member_exists(member_id),
            member_id: normalize(member_id),
        }
    }

    pub fn list_member_orders(&self, member_id: &str) -> MemberOrders {
        let orders = self.store.member_orders(member_id);
        let member_id = normalize(member_id);
        if orders.is_empty() {
            return MemberOrders {
                found: false,
                member_id,
                order_count: None,
                orders: None,
            };
        }
        MemberOrders {
            found: true,
            member_id,
            order_count: Some(orders.len()),
            orders: Some(
                orders
                    .into_iter()
                    .map(|o| OrderSummary {
                        order_id: o.order_id.clone(),
                        status: o.status.clone(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn get_order_details(&self, order_id: &str, member_id: &str) -> OrderLookup<OrderDetails> {
        OrderLookup::from_access(self.store.order_for_member(order_id, member_id), |order| {
            OrderDetails {
                order_id: order.order_id.clone(),
                prescriptions: order.prescriptions.clone(),
            }
        })
    }

    pub fn get_order_timing(&self, order_id: &str, member_id: &str) -> OrderLookup<OrderTiming> {
        OrderLookup::from_access(self.store.order_for_member(order_id, member_id), |order| {
            OrderTiming {
                order_id: order.order_id.clone(),
                status: order.status.clone(),
                timing: order.timing.clone(),
            }
        })
    }

    pub fn get_order_refills(&self, order_id: &str, member_id: &str) -> OrderLookup<OrderRefills> {
        OrderLookup::from_access(self.store.order_for_member(order_id, member_id), |order| {
            OrderRefills {
                order_id: order.order_id.clone(),
                refills: order
                    .prescriptions
                    .iter()
                    .map(|rx| RefillInfo {
                        medication: rx.name.clone(),
                        rx_id: rx.rx_id.clone(),
                        refills_remaining: rx.refills_remaining,
                    })
                    .collect(),
            }
        })
    }
}
