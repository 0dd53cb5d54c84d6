//! HTTP and websocket handlers for the Call Service.

pub mod calls;
pub mod ws;

pub use calls::list_user_calls;
pub use ws::ws_handler;
