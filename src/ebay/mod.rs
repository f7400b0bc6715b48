pub mod auth;
pub mod token;

pub use auth::{EbayAuthError, EbayOAuthClient, TokenEndpoint, TokenGrant};
pub use token::EbayToken;
