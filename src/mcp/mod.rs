//! Model Context Protocol surface: JSON-RPC framing over stdio, the tool
//! table, and the concurrent request loop.
//!
//! ```text
//! stdin ─▶ transport ─▶ server ─▶ dispatcher ─┬─▶ search
//!                         │                   └─▶ orchestrator
//! stdout ◀─ transport ◀───┘ (single writer)
//! ```

pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod transport;

pub use dispatcher::{tool_definitions, validate, Dispatcher, ToolCall, ToolName};
pub use server::McpServer;
