pub mod client;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod screen;
pub mod session;

pub use client::PtyClient;
pub use daemon::Daemon;
pub use error::{PtyMasterError, Result};
pub use protocol::ControlFrame;
pub use screen::ScreenBuffer;
pub use session::Session;
