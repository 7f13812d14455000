pub mod display;
pub mod message;
pub mod pending;
pub mod session;
pub mod wire;

pub use display::*;
pub use message::*;
pub use pending::*;
pub use session::*;
pub use wire::*;
