//! Social profile candidates for a username.

use async_trait::async_trait;

use deeper_core::error::AppError;
use deeper_core::plugin::Plugin;
use deeper_core::trace::{Trace, TraceKind};

/// Profile URL templates, Sherlock-style: `{}` is replaced by the username.
const NETWORKS: [(&str, TraceKind); 3] = [
    ("https://github.com/{}", TraceKind::SocialGithub),
    ("https://twitter.com/{}", TraceKind::SocialTwitter),
    ("https://instagram.com/{}", TraceKind::SocialInstagram),
];

/// username → social profile URLs.
///
/// Emits every candidate unverified; checking which profiles actually
/// exist is a network-plugin concern and the built-ins stay offline.
pub struct SocialProfileMapper;

#[async_trait]
impl Plugin for SocialProfileMapper {
    fn name(&self) -> &str {
        "social-profiles"
    }

    fn input_kind(&self) -> TraceKind {
        TraceKind::Username
    }

    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
        let username = trace.value.trim_start_matches('@');
        if username.is_empty() {
            return Ok(Vec::new());
        }
        Ok(NETWORKS
            .iter()
            .map(|(template, kind)| Trace::new(template.replace("{}", username), *kind))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_one_candidate_per_network() {
        let out = SocialProfileMapper
            .expand(&Trace::new("somebody", TraceKind::Username))
            .await
            .unwrap();
        assert_eq!(out.len(), NETWORKS.len());
        assert!(out.contains(&Trace::new(
            "https://github.com/somebody",
            TraceKind::SocialGithub
        )));
    }

    #[tokio::test]
    async fn test_leading_at_sign_stripped() {
        let out = SocialProfileMapper
            .expand(&Trace::new("@somebody", TraceKind::Username))
            .await
            .unwrap();
        assert!(out.iter().all(|t| !t.value.contains('@')));
    }
}
