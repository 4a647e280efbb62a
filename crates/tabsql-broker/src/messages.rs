//! Broker wire messages.
//!
//! Everything crossing the shared pub/sub channel or a dedicated port is one
//! of these tagged variants, matched exhaustively at every receiver. There
//! is no stringly-typed dispatch.

use serde_json::Value;

/// Messages carried over the shared broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    /// A client announces itself and asks the current provider (if any) to
    /// re-announce.
    Client {
        /// Service the client is interested in.
        service: String,
    },
    /// The current provider announces leadership.
    Provider {
        /// Service being provided.
        service: String,
        /// Identity of the providing context.
        provider_id: String,
    },
    /// A client asks the provider for a dedicated port.
    Request {
        /// Service being requested.
        service: String,
        /// Requesting context's identity.
        client_id: String,
        /// Nonce tying the eventual port delivery to this request.
        nonce: String,
    },
}

/// A method call sent over a dedicated port.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Per-call nonce; the response echoes it.
    pub nonce: String,
    /// Method name on the shared connection object.
    pub method: String,
    /// Call arguments.
    pub args: Value,
}

/// A call result sent back over a dedicated port.
///
/// Responses may arrive out of order; the nonce pairs each response with its
/// request.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    /// Nonce of the request being answered.
    pub nonce: String,
    /// The outcome: a value, or the provider-side error message.
    pub result: Result<Value, String>,
}

/// Generate a fresh random identifier (client ids, call nonces).
#[must_use]
pub fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
