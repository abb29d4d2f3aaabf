//! Service-type parsing: `_name._proto` and subtype `_sub._sub._name._proto` forms.

use anyhow::{bail, Result};

/// A parsed `_name._proto` pair, with an optional subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    pub name: String,
    pub protocol: String,
    pub subtype: Option<String>,
}

impl ServiceType {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        ServiceType { name: name.into(), protocol: protocol.into(), subtype: None }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Parse `_name._proto` or `_sub._sub._name._proto`.
    pub fn parse(s: &str) -> Result<Self> {
        let labels: Vec<&str> = s
            .trim()
            .split('.')
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.strip_prefix('_').unwrap_or(l))
            .collect();

        if labels.is_empty() {
            bail!("InvalidServiceType: empty service type '{}'", s);
        }

        if let Some(sub_pos) = labels.iter().position(|l| *l == "sub") {
            if sub_pos == 0 {
                bail!("InvalidServiceType: 'sub' marker cannot be first label in '{}'", s);
            }
            let subtype = labels[sub_pos - 1];
            let rest = &labels[sub_pos + 1..];
            if rest.len() < 2 {
                bail!("InvalidServiceType: missing name/protocol in '{}'", s);
            }
            let name = rest[0];
            let protocol = rest[1];
            if name.is_empty() || protocol.is_empty() {
                bail!("InvalidServiceType: empty name or protocol in '{}'", s);
            }
            return Ok(ServiceType {
                name: name.to_owned(),
                protocol: protocol.to_owned(),
                subtype: Some(subtype.to_owned()),
            });
        }

        if labels.len() < 2 {
            bail!("InvalidServiceType: missing name/protocol in '{}'", s);
        }
        let name = labels[0];
        let protocol = labels[1];
        if name.is_empty() || protocol.is_empty() {
            bail!("InvalidServiceType: empty name or protocol in '{}'", s);
        }
        Ok(ServiceType { name: name.to_owned(), protocol: protocol.to_owned(), subtype: None })
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(sub) = &self.subtype {
            write!(f, "_{}._sub._{}._{}", sub, self.name, self.protocol)
        } else {
            write!(f, "_{}._{}", self.name, self.protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_type() {
        let t = ServiceType::parse("_http._tcp").unwrap();
        assert_eq!(t, ServiceType::new("http", "tcp"));
    }

    #[test]
    fn parses_subtype() {
        let t = ServiceType::parse("_printer._sub._http._tcp").unwrap();
        assert_eq!(t, ServiceType::new("http", "tcp").with_subtype("printer"));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(ServiceType::parse("").is_err());
        assert!(ServiceType::parse("   ").is_err());
    }

    #[test]
    fn rejects_leading_sub() {
        assert!(ServiceType::parse("_sub._http._tcp").is_err());
    }

    #[test]
    fn round_trips_every_shape() {
        for t in [
            ServiceType::new("http", "tcp"),
            ServiceType::new("http", "tcp").with_subtype("printer"),
            ServiceType::new("a", "udp"),
        ] {
            let s = t.to_string();
            assert_eq!(ServiceType::parse(&s).unwrap(), t);
        }
    }

    #[test]
    fn display_matches_dns_sd_convention() {
        assert_eq!(ServiceType::new("http", "tcp").to_string(), "_http._tcp");
        assert_eq!(
            ServiceType::new("http", "tcp").with_subtype("printer").to_string(),
            "_printer._sub._http._tcp"
        );
    }
}
