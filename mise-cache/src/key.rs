//! Tenant-scoped cache keys and invalidation patterns.
//!
//! The key insight is that neither `CacheKey` nor `KeyPattern` can be built
//! without a tenant. Every key is the ordered tuple
//! `(domain, tenant_id, qualifiers...)`, so a pattern can only ever address
//! one tenant's slice of a domain.

use mise_core::{DomainName, TenantId};
use std::fmt;

/// Separator between segments in the encoded form.
const SEPARATOR: char = '/';

/// A concrete cache key: `(domain, tenant_id, qualifiers...)`.
///
/// # Design
///
/// The private inner struct ensures a `CacheKey` can ONLY be constructed
/// via [`CacheKey::new`], which requires a tenant.
///
/// # Ordering
///
/// Keys order by domain, then tenant, then qualifiers segment by segment.
/// All keys matched by a [`KeyPattern`] are therefore contiguous in an
/// ordered map, starting at the pattern itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: KeyInner,
}

/// A key prefix. Matches every [`CacheKey`] whose leading segments equal
/// the pattern's segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPattern {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct KeyInner {
    domain: DomainName,
    tenant_id: TenantId,
    qualifiers: Vec<String>,
}

impl KeyInner {
    fn new<I, S>(domain: DomainName, tenant_id: TenantId, qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain,
            tenant_id,
            qualifiers: qualifiers.into_iter().map(Into::into).collect(),
        }
    }

    fn encode(&self) -> String {
        let mut out = escape_segment(self.domain.as_str());
        out.push(SEPARATOR);
        out.push_str(&escape_segment(self.tenant_id.as_str()));
        for qualifier in &self.qualifiers {
            out.push(SEPARATOR);
            out.push_str(&escape_segment(qualifier));
        }
        out
    }
}

impl CacheKey {
    /// Create a new tenant-scoped cache key.
    pub fn new<I, S>(domain: DomainName, tenant_id: TenantId, qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: KeyInner::new(domain, tenant_id, qualifiers),
        }
    }

    pub fn domain(&self) -> &DomainName {
        &self.inner.domain
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.inner.qualifiers
    }

    /// Encode as `domain/tenant/q1/q2`, percent-escaping `%` and `/`
    /// inside segments.
    pub fn encode(&self) -> String {
        self.inner.encode()
    }

    /// Decode the form produced by [`CacheKey::encode`].
    ///
    /// Returns `None` if fewer than two segments are present, a segment is
    /// empty, or an escape sequence is malformed.
    pub fn decode(encoded: &str) -> Option<Self> {
        let mut segments = encoded.split(SEPARATOR).map(unescape_segment);
        let domain = segments.next()??;
        let tenant_id = segments.next()??;
        let qualifiers = segments.collect::<Option<Vec<_>>>()?;

        if domain.is_empty() || tenant_id.is_empty() {
            return None;
        }

        Some(Self::new(
            DomainName::new(domain),
            TenantId::new(tenant_id),
            qualifiers,
        ))
    }
}

impl KeyPattern {
    /// Create a pattern from explicit segments.
    pub fn new<I, S>(domain: DomainName, tenant_id: TenantId, qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: KeyInner::new(domain, tenant_id, qualifiers),
        }
    }

    /// Everything a tenant has cached under one domain.
    pub fn tenant_domain(domain: DomainName, tenant_id: TenantId) -> Self {
        Self::new(domain, tenant_id, std::iter::empty::<String>())
    }

    /// A pattern matching exactly `key` and anything nested below it.
    pub fn from_key(key: &CacheKey) -> Self {
        Self {
            inner: key.inner.clone(),
        }
    }

    pub fn domain(&self) -> &DomainName {
        &self.inner.domain
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.inner.qualifiers
    }

    /// Segment-wise prefix match. `R1` never matches `R10`.
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.inner.domain == key.inner.domain
            && self.inner.tenant_id == key.inner.tenant_id
            && key.inner.qualifiers.starts_with(&self.inner.qualifiers)
    }

    /// The smallest key this pattern can match, the start of a range scan.
    pub fn range_start(&self) -> CacheKey {
        CacheKey {
            inner: self.inner.clone(),
        }
    }

    pub fn encode(&self) -> String {
        self.inner.encode()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn unescape_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let escape: String = chars.by_ref().take(2).collect();
        match escape.as_str() {
            "25" => out.push('%'),
            "2F" | "2f" => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(domain: &str, tenant: &str, qualifiers: &[&str]) -> CacheKey {
        CacheKey::new(
            DomainName::new(domain),
            TenantId::new(tenant),
            qualifiers.iter().copied(),
        )
    }

    fn pattern(domain: &str, tenant: &str, qualifiers: &[&str]) -> KeyPattern {
        KeyPattern::new(
            DomainName::new(domain),
            TenantId::new(tenant),
            qualifiers.iter().copied(),
        )
    }

    #[test]
    fn test_new_and_getters() {
        let k = key("payments", "R1", &["detail", "P9"]);
        assert_eq!(k.domain().as_str(), "payments");
        assert_eq!(k.tenant_id().as_str(), "R1");
        assert_eq!(k.qualifiers(), &["detail".to_string(), "P9".to_string()]);
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(key("payments", "R1", &["detail", "P9"]).encode(), "payments/R1/detail/P9");
        assert_eq!(pattern("orders", "R1", &[]).encode(), "orders/R1");
    }

    #[test]
    fn test_encode_escapes_separator() {
        let k = key("payments", "R/1", &["50%"]);
        assert_eq!(k.encode(), "payments/R%2F1/50%25");
        assert_eq!(CacheKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(CacheKey::decode("payments").is_none());
        assert!(CacheKey::decode("/R1").is_none());
        assert!(CacheKey::decode("payments/R1/%zz").is_none());
    }

    #[test]
    fn test_tenant_domain_matches_whole_slice() {
        let p = KeyPattern::tenant_domain(DomainName::new("payments"), TenantId::new("R1"));
        assert!(p.matches(&key("payments", "R1", &[])));
        assert!(p.matches(&key("payments", "R1", &["list"])));
        assert!(p.matches(&key("payments", "R1", &["detail", "P9"])));
        assert!(!p.matches(&key("orders", "R1", &["list"])));
    }

    #[test]
    fn test_different_tenants_never_match() {
        let p = pattern("payments", "R1", &[]);
        assert!(!p.matches(&key("payments", "R2", &["list"])));
        // Segment-wise, not string prefix
        assert!(!p.matches(&key("payments", "R10", &["list"])));
    }

    #[test]
    fn test_qualifier_prefix_is_segment_wise() {
        let p = pattern("payments", "R1", &["detail"]);
        assert!(p.matches(&key("payments", "R1", &["detail", "P9"])));
        assert!(!p.matches(&key("payments", "R1", &["details"])));
        assert!(!p.matches(&key("payments", "R1", &[])));
    }

    #[test]
    fn test_from_key_matches_itself() {
        let k = key("payments", "R1", &["detail", "P9"]);
        let p = KeyPattern::from_key(&k);
        assert!(p.matches(&k));
        assert_eq!(p.range_start(), k);
    }
}
