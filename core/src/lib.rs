pub mod context;
pub mod convid;
pub mod dispatcher;
pub mod guest;
pub mod handlers;
pub mod ports;
pub mod registry;
pub mod session;
