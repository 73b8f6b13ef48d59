//! Traces and the input classifier.
//!
//! A [`Trace`] is a typed piece of information `(value, kind)` — both the
//! input to plugins and the output they emit. The classifier infers a
//! [`TraceKind`] from a raw seed string using anchored patterns tried in a
//! fixed priority order; partial matches never classify.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::AppError;

/// Maximum accepted length of a trace value in bytes.
pub const MAX_VALUE_LEN: usize = 64 * 1024;

/// Closed enumeration of trace kinds. Extensible only at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceKind {
    Email,
    Phone,
    Address,
    Ip,
    Domain,
    Url,
    Username,
    Name,
    Company,
    Mac,
    BitcoinAddress,
    Subdomain,
    Whois,
    Geolocation,
    DnsA,
    DnsAaaa,
    DnsMx,
    DnsNs,
    DnsTxt,
    DnsCname,
    DnsSoa,
    DnsPtr,
    DnsSrv,
    DnsCaa,
    Repository,
    SocialTwitter,
    SocialGithub,
    SocialLinkedin,
    SocialInstagram,
    SocialFacebook,
    DataBreach,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::Email => "email",
            TraceKind::Phone => "phone",
            TraceKind::Address => "address",
            TraceKind::Ip => "ip",
            TraceKind::Domain => "domain",
            TraceKind::Url => "url",
            TraceKind::Username => "username",
            TraceKind::Name => "name",
            TraceKind::Company => "company",
            TraceKind::Mac => "mac",
            TraceKind::BitcoinAddress => "bitcoin-address",
            TraceKind::Subdomain => "subdomain",
            TraceKind::Whois => "whois",
            TraceKind::Geolocation => "geolocation",
            TraceKind::DnsA => "dns-a",
            TraceKind::DnsAaaa => "dns-aaaa",
            TraceKind::DnsMx => "dns-mx",
            TraceKind::DnsNs => "dns-ns",
            TraceKind::DnsTxt => "dns-txt",
            TraceKind::DnsCname => "dns-cname",
            TraceKind::DnsSoa => "dns-soa",
            TraceKind::DnsPtr => "dns-ptr",
            TraceKind::DnsSrv => "dns-srv",
            TraceKind::DnsCaa => "dns-caa",
            TraceKind::Repository => "repository",
            TraceKind::SocialTwitter => "social-twitter",
            TraceKind::SocialGithub => "social-github",
            TraceKind::SocialLinkedin => "social-linkedin",
            TraceKind::SocialInstagram => "social-instagram",
            TraceKind::SocialFacebook => "social-facebook",
            TraceKind::DataBreach => "databreach",
        }
    }

    /// All kinds, in declaration order. Used by introspection commands.
    pub fn all() -> &'static [TraceKind] {
        use TraceKind::*;
        &[
            Email,
            Phone,
            Address,
            Ip,
            Domain,
            Url,
            Username,
            Name,
            Company,
            Mac,
            BitcoinAddress,
            Subdomain,
            Whois,
            Geolocation,
            DnsA,
            DnsAaaa,
            DnsMx,
            DnsNs,
            DnsTxt,
            DnsCname,
            DnsSoa,
            DnsPtr,
            DnsSrv,
            DnsCaa,
            Repository,
            SocialTwitter,
            SocialGithub,
            SocialLinkedin,
            SocialInstagram,
            SocialFacebook,
            DataBreach,
        ]
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TraceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraceKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| AppError::InvalidInput(format!("unknown trace kind: {s}")))
    }
}

impl serde::Serialize for TraceKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for TraceKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A typed piece of information. Immutable after creation; equality and
/// hashing cover `(value, kind)`, which makes it the seen-set element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Trace {
    pub value: String,
    pub kind: TraceKind,
}

impl Trace {
    pub fn new(value: impl Into<String>, kind: TraceKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    /// Classify a raw input string into a trace.
    ///
    /// Patterns are anchored and tried in priority order:
    /// email → phone → ip → url → domain → address → social handle →
    /// bitcoin-address → mac → username. Ambiguity resolves to the first
    /// match; no network probing. Fails only on empty, oversized, or
    /// non-printable input — the worst case is `username`.
    pub fn classify(value: &str) -> Result<Self, AppError> {
        if value.is_empty() {
            return Err(AppError::InvalidInput("empty input".into()));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(AppError::InvalidInput(format!(
                "input exceeds {MAX_VALUE_LEN} bytes"
            )));
        }
        if value.chars().any(|c| c.is_control()) {
            return Err(AppError::InvalidInput(
                "input contains non-printable characters".into(),
            ));
        }

        Ok(Self::new(value, guess_kind(value)))
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.kind)
    }
}

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\+?\d{1,3})?[-. ]?(\(?\d{3}\)?[-. ]?)?\d{3}[-. ]?\d{4}$").unwrap()
});

static IP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").unwrap());

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}(:\d+)?(/\S*)?$").unwrap()
});

static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$").unwrap());

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s+[A-Za-z]+(\s+[A-Za-z]+)+$").unwrap());

// A bare @handle matches several social-network patterns; the first one in
// priority order wins. This mirrors the source behaviour rather than
// attempting smarter disambiguation.
static SOCIAL_HANDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@[A-Za-z0-9_.]{1,30}$").unwrap());

static BITCOIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(bc1[a-z0-9]{25,62}|[13][a-km-zA-HJ-NP-Z1-9]{25,34})$").unwrap()
});

static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").unwrap());

fn guess_kind(value: &str) -> TraceKind {
    if EMAIL_RE.is_match(value) {
        TraceKind::Email
    } else if PHONE_RE.is_match(value) {
        TraceKind::Phone
    } else if IP_RE.is_match(value) {
        TraceKind::Ip
    } else if URL_RE.is_match(value) {
        TraceKind::Url
    } else if DOMAIN_RE.is_match(value) {
        TraceKind::Domain
    } else if ADDRESS_RE.is_match(value) {
        TraceKind::Address
    } else if SOCIAL_HANDLE_RE.is_match(value) {
        TraceKind::SocialTwitter
    } else if BITCOIN_RE.is_match(value) {
        TraceKind::BitcoinAddress
    } else if MAC_RE.is_match(value) {
        TraceKind::Mac
    } else {
        TraceKind::Username
    }
}
