//! Control channel serving: accept loop plus the default command handler

pub mod handler;
pub mod listener;
pub mod protocol;

pub use handler::CommandHandler;
pub use listener::{
    ControlChannel, ControlListener, ListenerError, ListenerHandle, RequestHandler,
};
