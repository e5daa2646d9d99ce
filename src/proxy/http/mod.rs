pub(crate) mod body;
pub(crate) mod codec;
mod forward;
mod respond;
mod server;

pub use body::BodyTooLarge;
pub use server::handle_http;
