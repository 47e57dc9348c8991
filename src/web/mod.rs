mod handlers;
mod peer;
mod routes;
mod ws;

pub use peer::{device_ws_handler, viewer_ws_handler};
pub use routes::create_router;
pub use ws::events_ws_handler;
