use std::fmt;

/// Auth'n'Auth tokens all start with this marker; OAuth user tokens do not.
pub const LEGACY_TOKEN_PREFIX: &str = "AgAAAA";

/// An eBay credential, tagged once when it enters the system.
#[derive(Clone, PartialEq, Eq)]
pub enum EbayToken {
    /// Long-lived Auth'n'Auth token. Never refreshed, never expiry-checked.
    Legacy(String),
    OAuth(String),
}

impl EbayToken {
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with(LEGACY_TOKEN_PREFIX) {
            Self::Legacy(raw)
        } else {
            Self::OAuth(raw)
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::Legacy(token) | Self::OAuth(token) => token,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

// Tokens end up in log fields; never print the secret.
impl fmt::Debug for EbayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_legacy() { "Legacy" } else { "OAuth" };
        write!(f, "EbayToken::{kind}(len={})", self.secret().len())
    }
}
