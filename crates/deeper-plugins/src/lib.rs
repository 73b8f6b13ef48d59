//! Built-in derivational plugins for the deeper engine.
//!
//! Everything here works offline: these plugins derive new traces from the
//! structure of the input value alone. Plugins that call third-party
//! services implement the same [`Plugin`](deeper_core::plugin::Plugin)
//! trait in their own crates.

pub mod email;
pub mod social;
pub mod url;

use std::sync::Arc;

use deeper_core::error::AppError;
use deeper_core::plugin::Registry;

pub use email::{MailHostExtractor, UsernameExtractor};
pub use social::SocialProfileMapper;
pub use url::{UrlBuilder, UrlHostExtractor};

/// Register every built-in plugin, in a stable order.
pub fn register_builtins(registry: &mut Registry) -> Result<(), AppError> {
    registry.register(Arc::new(UsernameExtractor))?;
    registry.register(Arc::new(MailHostExtractor))?;
    registry.register(Arc::new(UrlHostExtractor))?;
    registry.register(Arc::new(UrlBuilder))?;
    registry.register(Arc::new(SocialProfileMapper))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deeper_core::trace::TraceKind;

    #[test]
    fn test_builtins_register_cleanly() {
        let mut registry = Registry::new();
        register_builtins(&mut registry).unwrap();

        assert_eq!(registry.len(), 5);
        assert_eq!(
            registry.names_for(TraceKind::Email),
            vec!["username-extractor", "mail-host"]
        );
        assert_eq!(registry.names_for(TraceKind::Url), vec!["url-host"]);
        assert_eq!(registry.names_for(TraceKind::Domain), vec!["url-builder"]);
        assert_eq!(
            registry.names_for(TraceKind::Username),
            vec!["social-profiles"]
        );
    }
}
