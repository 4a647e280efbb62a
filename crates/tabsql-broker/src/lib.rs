pub mod hub;
pub mod messages;
pub mod service;

pub use hub::{ClientPort, Hub, PortDelivery};
pub use messages::{BrokerMessage, RpcRequest, RpcResponse, random_id};
pub use service::{AttachState, ServiceHandler, SharedService};
