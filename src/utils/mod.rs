pub use session_executor::{SessionExecutor, SessionKey};

mod session_executor;
