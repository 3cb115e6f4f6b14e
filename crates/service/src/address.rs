use std::{cmp::Ordering, fmt, str::FromStr};

/// An overlay identity of the form `resource@domain`, or just `domain`.
///
/// The resource half usually names a user, but also names abstract entities
/// or roles. An address with an empty domain is anonymous.
///
/// # Test
///
/// ```
/// use q2q_server_service::address::Address;
///
/// let addr: Address = "glyph@example.com".parse().unwrap();
/// assert_eq!(addr.resource.as_deref(), Some("glyph"));
/// assert_eq!(addr.domain_address().to_string(), "example.com");
/// assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub domain: String,
    pub resource: Option<String>,
}

impl Address {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            resource: None,
        }
    }

    pub fn user(resource: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            resource: Some(resource.into()),
        }
    }

    /// The anonymous address: no domain, no resource.
    pub fn anonymous() -> Self {
        Self::domain("")
    }

    pub fn is_anonymous(&self) -> bool {
        self.domain.is_empty()
    }

    /// The same address with only the domain half set.
    pub fn domain_address(&self) -> Self {
        Self::domain(self.domain.clone())
    }

    /// Whether `name` (a certificate common name) claims this address. The
    /// anonymous identity is spelled `@` in certificates.
    pub fn claimed_by(&self, name: &str) -> bool {
        if self.is_anonymous() {
            return name == "@";
        }

        name == self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}@{}", resource, self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

impl Address {
    /// Parse the textual form. Any string is a valid address, so unlike
    /// [`FromStr`] this needs no `Result`.
    pub fn parse_str(value: &str) -> Self {
        match value.split_once('@') {
            Some((resource, domain)) if !resource.is_empty() => Self::user(resource, domain),
            Some((_, domain)) => Self::domain(domain),
            None => Self::domain(value),
        }
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_str(value))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.domain, &self.resource).cmp(&(&other.domain, &other.resource))
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn textual_form_is_reversible() {
        for text in ["example.com", "bob@other.org", ""] {
            let addr: Address = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
            assert_eq!(addr.to_string().contains('@'), addr.resource.is_some());
        }
    }

    #[test]
    fn splits_on_the_first_at_sign() {
        let addr: Address = "weird@user@example.com".parse().unwrap();
        assert_eq!(addr.resource.as_deref(), Some("weird"));
        assert_eq!(addr.domain, "user@example.com");
    }

    #[test]
    fn anonymous_claims_the_at_identity() {
        assert!(Address::anonymous().claimed_by("@"));
        assert!(!Address::anonymous().claimed_by("example.com"));
        assert!(Address::domain("example.com").claimed_by("example.com"));
    }

    #[test]
    fn ordering_is_lexicographic_over_the_pair() {
        let mut addrs: Vec<Address> = ["b.org", "alice@a.org", "a.org"]
            .iter()
            .map(|t| t.parse().unwrap())
            .collect();
        addrs.sort();

        let texts: Vec<String> = addrs.iter().map(Address::to_string).collect();
        assert_eq!(texts, ["a.org", "alice@a.org", "b.org"]);
    }
}
