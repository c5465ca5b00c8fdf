// src/core/auth/methods.rs

//! Authentication methods as a tagged variant, each carrying its own
//! configuration sub-record, dispatched by exhaustive match.

use crate::core::errors::PoolError;
use std::collections::HashMap;

/// Characters that must never reach an LDAP search filter.
const LDAP_FORBIDDEN: &[char] = &['*', '(', ')', '\\', '/'];

/// PAM options from the HBA `key=value` tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PamOptions {
    pub service: String,
}

/// LDAP options from the HBA `key=value` tail. Either simple-bind
/// (prefix/suffix) or search+bind (basedn et al.) may be configured, not
/// both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapOptions {
    pub server: String,
    pub port: u16,
    pub prefix: String,
    pub suffix: String,
    pub base_dn: String,
    pub bind_dn: String,
    pub bind_passwd: String,
    pub search_attribute: String,
    pub search_filter: String,
    pub scheme: String,
    pub tls: bool,
}

impl LdapOptions {
    pub fn is_search_bind(&self) -> bool {
        !self.base_dn.is_empty()
    }

    /// Rejects user names whose characters would change filter semantics.
    pub fn check_username(user: &str) -> Result<(), PoolError> {
        if user.chars().any(|c| LDAP_FORBIDDEN.contains(&c)) {
            return Err(PoolError::AuthFailed {
                detail: format!(
                    "LDAP user name \"{user}\" contains a character not permitted in a filter"
                ),
            });
        }
        Ok(())
    }

    /// The DN used for a simple bind: `prefix || user || suffix`.
    pub fn simple_bind_dn(&self, user: &str) -> String {
        format!("{}{}{}", self.prefix, user, self.suffix)
    }

    /// The search filter for search+bind; a custom filter substitutes
    /// `$username`, otherwise `(attribute=user)` with `uid` as the default
    /// attribute.
    pub fn search_filter_for(&self, user: &str) -> String {
        if !self.search_filter.is_empty() {
            self.search_filter.replace("$username", user)
        } else {
            let attribute = if self.search_attribute.is_empty() {
                "uid"
            } else {
                &self.search_attribute
            };
            format!("({attribute}={user})")
        }
    }
}

/// One authentication method, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Trust,
    Reject,
    /// Cleartext password.
    Password,
    Md5,
    ScramSha256,
    /// TLS client certificate; the CN is the role.
    Cert,
    Pam(PamOptions),
    Ldap(LdapOptions),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Trust => "trust",
            AuthMethod::Reject => "reject",
            AuthMethod::Password => "password",
            AuthMethod::Md5 => "md5",
            AuthMethod::ScramSha256 => "scram-sha-256",
            AuthMethod::Cert => "cert",
            AuthMethod::Pam(_) => "pam",
            AuthMethod::Ldap(_) => "ldap",
        }
    }

    /// Builds a method from its HBA token and the trailing options.
    pub fn from_token(
        token: &str,
        options: &HashMap<String, String>,
    ) -> Result<Self, PoolError> {
        let get = |key: &str| options.get(key).cloned().unwrap_or_default();
        match token {
            "trust" => Ok(AuthMethod::Trust),
            "reject" => Ok(AuthMethod::Reject),
            "password" => Ok(AuthMethod::Password),
            "md5" => Ok(AuthMethod::Md5),
            "scram-sha-256" => Ok(AuthMethod::ScramSha256),
            "cert" => Ok(AuthMethod::Cert),
            "pam" => Ok(AuthMethod::Pam(PamOptions {
                service: if options.contains_key("pamservice") {
                    get("pamservice")
                } else {
                    "postgresql".to_string()
                },
            })),
            "ldap" => {
                let ldap = LdapOptions {
                    server: get("ldapserver"),
                    port: options
                        .get("ldapport")
                        .map(|p| p.parse())
                        .transpose()
                        .map_err(|_| PoolError::Config("invalid ldapport".into()))?
                        .unwrap_or(389),
                    prefix: get("ldapprefix"),
                    suffix: get("ldapsuffix"),
                    base_dn: get("ldapbasedn"),
                    bind_dn: get("ldapbinddn"),
                    bind_passwd: get("ldapbindpasswd"),
                    search_attribute: get("ldapsearchattribute"),
                    search_filter: get("ldapsearchfilter"),
                    scheme: get("ldapscheme"),
                    tls: options.get("ldaptls").map(|v| v == "1").unwrap_or(false),
                };
                if ldap.server.is_empty() {
                    return Err(PoolError::Config(
                        "ldap method requires an ldapserver option".into(),
                    ));
                }
                let simple = !ldap.prefix.is_empty() || !ldap.suffix.is_empty();
                if simple && ldap.is_search_bind() {
                    return Err(PoolError::Config(
                        "ldapprefix/ldapsuffix cannot be combined with ldapbasedn".into(),
                    ));
                }
                Ok(AuthMethod::Ldap(ldap))
            }
            other => Err(PoolError::Config(format!(
                "unknown authentication method \"{other}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ldap_username_sanitizing() {
        assert!(LdapOptions::check_username("alice").is_ok());
        for bad in ["a*lice", "a(lice", "a)lice", "a\\lice", "a/lice"] {
            assert!(LdapOptions::check_username(bad).is_err());
        }
    }

    #[test]
    fn ldap_filter_substitution() {
        let opts = LdapOptions {
            search_filter: "(|(uid=$username)(mail=$username))".into(),
            ..Default::default()
        };
        assert_eq!(
            opts.search_filter_for("alice"),
            "(|(uid=alice)(mail=alice))"
        );

        let plain = LdapOptions {
            search_attribute: "sAMAccountName".into(),
            ..Default::default()
        };
        assert_eq!(plain.search_filter_for("alice"), "(sAMAccountName=alice)");

        let default_attr = LdapOptions::default();
        assert_eq!(default_attr.search_filter_for("alice"), "(uid=alice)");
    }

    #[test]
    fn simple_bind_dn_concatenates() {
        let opts = LdapOptions {
            prefix: "uid=".into(),
            suffix: ",dc=example,dc=net".into(),
            ..Default::default()
        };
        assert_eq!(
            opts.simple_bind_dn("alice"),
            "uid=alice,dc=example,dc=net"
        );
    }

    #[test]
    fn prefix_and_basedn_conflict() {
        let mut options = HashMap::new();
        options.insert("ldapserver".to_string(), "ldap.example.net".to_string());
        options.insert("ldapprefix".to_string(), "uid=".to_string());
        options.insert("ldapbasedn".to_string(), "dc=example".to_string());
        assert!(AuthMethod::from_token("ldap", &options).is_err());
    }
}
