pub mod refresher;
pub mod resolver;

pub use refresher::{RefreshError, TokenRefresher};
pub use resolver::{EXPIRY_BUFFER_MINUTES, ResolveError, TokenResolver};
