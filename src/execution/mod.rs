// Order submission and in-flight order tracking
pub mod gateway;
pub mod order_tracker;
pub mod paper;

pub use gateway::{ExecutionGateway, GatewayError, OrderHandle, OrderState, SellLimitOrder};
pub use order_tracker::{AdmitRejection, Admission, OrderTracker};
pub use paper::PaperGateway;
