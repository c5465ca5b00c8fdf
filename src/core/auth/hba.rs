// src/core/auth/hba.rs

//! Host-based authentication rules: tokenizer, parser and first-match
//! lookup. Rules are loaded once into an immutable list; a reload builds a
//! new list and swaps it atomically, keeping the old one on error.

use super::ip::{self, AddressMatch};
use super::methods::AuthMethod;
use crate::core::errors::PoolError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// The connection-type column of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Local,
    Host,
    HostSsl,
    HostNoSsl,
}

/// One token from the HBA file, remembering whether it was quoted: quoting
/// turns keywords like `all` into literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaToken {
    pub value: String,
    pub quoted: bool,
}

impl HbaToken {
    fn keyword(&self, word: &str) -> bool {
        !self.quoted && self.value == word
    }
}

/// A parsed rule, in file order.
#[derive(Debug, Clone)]
pub struct HbaRule {
    pub line_number: usize,
    pub conn_type: ConnType,
    pub databases: Vec<HbaToken>,
    pub roles: Vec<HbaToken>,
    pub address: AddressMatch,
    pub method: AuthMethod,
}

/// What the gate knows about a connecting client when it consults the rules.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// True for AF_UNIX clients.
    pub is_local: bool,
    pub addr: Option<IpAddr>,
    pub tls: bool,
    pub database: String,
    pub user: String,
}

/// The immutable rule list.
#[derive(Debug, Clone, Default)]
pub struct HbaRules {
    rules: Vec<HbaRule>,
}

impl HbaRules {
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("cannot read HBA file {path:?}: {e}")))?;
        Self::parse(&contents, path.parent().unwrap_or(Path::new(".")))
    }

    pub fn parse(contents: &str, include_dir: &Path) -> Result<Self, PoolError> {
        let mut rules = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line_number = idx + 1;
            let fields = tokenize_line(line, include_dir)
                .map_err(|e| PoolError::Config(format!("HBA line {line_number}: {e}")))?;
            if fields.is_empty() {
                continue;
            }
            let rule = parse_rule(line_number, &fields)
                .map_err(|e| PoolError::Config(format!("HBA line {line_number}: {e}")))?;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First-match lookup; `None` is an implicit reject.
    pub async fn find_match(&self, client: &ClientInfo) -> Option<&HbaRule> {
        for rule in &self.rules {
            if rule_matches(rule, client).await {
                return Some(rule);
            }
        }
        None
    }
}

async fn rule_matches(rule: &HbaRule, client: &ClientInfo) -> bool {
    // Connection type and TLS state must agree before anything else.
    match rule.conn_type {
        ConnType::Local => {
            if !client.is_local {
                return false;
            }
        }
        ConnType::Host => {
            if client.is_local {
                return false;
            }
        }
        ConnType::HostSsl => {
            if client.is_local || !client.tls {
                return false;
            }
        }
        ConnType::HostNoSsl => {
            if client.is_local || client.tls {
                return false;
            }
        }
    }

    if !database_matches(&rule.databases, client) || !role_matches(&rule.roles, client) {
        return false;
    }

    match rule.conn_type {
        ConnType::Local => true,
        _ => match client.addr {
            Some(addr) => rule.address.matches(addr).await,
            None => false,
        },
    }
}

fn database_matches(tokens: &[HbaToken], client: &ClientInfo) -> bool {
    tokens.iter().any(|t| {
        if t.keyword("all") {
            true
        } else if t.keyword("sameuser") {
            client.database == client.user
        } else {
            t.value == client.database
        }
    })
}

fn role_matches(tokens: &[HbaToken], client: &ClientInfo) -> bool {
    tokens
        .iter()
        .any(|t| t.keyword("all") || t.value == client.user)
}

/// Splits one line into fields. A field is a comma-separated token list;
/// `#` starts a comment, `"` quotes, `\` escapes the next character and
/// `@file` inlines the tokens of another file.
fn tokenize_line(line: &str, include_dir: &Path) -> Result<Vec<Vec<HbaToken>>, String> {
    let mut fields: Vec<Vec<HbaToken>> = Vec::new();
    let mut chars = line.chars().peekable();

    'outer: loop {
        // Skip leading whitespace before a field.
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('#') => break,
            _ => {}
        }

        let mut field: Vec<HbaToken> = Vec::new();
        loop {
            let mut value = String::new();
            let mut quoted = false;
            let mut in_quotes = false;
            let mut trailing_comma = false;

            while let Some(&c) = chars.peek() {
                if in_quotes {
                    chars.next();
                    match c {
                        '"' => in_quotes = false,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        _ => value.push(c),
                    }
                } else {
                    match c {
                        '"' => {
                            chars.next();
                            in_quotes = true;
                            quoted = true;
                        }
                        '\\' => {
                            chars.next();
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        ',' => {
                            chars.next();
                            trailing_comma = true;
                            break;
                        }
                        '#' => break,
                        c if c.is_whitespace() => break,
                        _ => {
                            chars.next();
                            value.push(c);
                        }
                    }
                }
            }
            if in_quotes {
                return Err("unterminated quoted token".to_string());
            }

            if !quoted && value.starts_with('@') {
                let file = value[1..].to_string();
                let included = std::fs::read_to_string(include_dir.join(&file))
                    .map_err(|e| format!("cannot read included file \"{file}\": {e}"))?;
                for word in included.split_whitespace() {
                    for part in word.split(',').filter(|p| !p.is_empty()) {
                        field.push(HbaToken {
                            value: part.to_string(),
                            quoted: false,
                        });
                    }
                }
            } else if !value.is_empty() || quoted {
                field.push(HbaToken { value, quoted });
            }

            if trailing_comma {
                // A comma continues the field, possibly across whitespace.
                while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                    chars.next();
                }
                continue;
            }
            if !field.is_empty() {
                fields.push(field);
            }
            match chars.peek() {
                None | Some('#') => break 'outer,
                _ => break,
            }
        }
    }
    Ok(fields)
}

fn single_value<'a>(field: &'a [HbaToken], what: &str) -> Result<&'a HbaToken, String> {
    match field {
        [token] => Ok(token),
        _ => Err(format!("expected a single {what} token")),
    }
}

fn parse_rule(line_number: usize, fields: &[Vec<HbaToken>]) -> Result<HbaRule, String> {
    if fields.len() < 4 {
        return Err("too few fields".to_string());
    }
    let conn_token = single_value(&fields[0], "connection type")?;
    let conn_type = match conn_token.value.as_str() {
        "local" => ConnType::Local,
        "host" => ConnType::Host,
        "hostssl" => ConnType::HostSsl,
        "hostnossl" => ConnType::HostNoSsl,
        other => return Err(format!("unknown connection type \"{other}\"")),
    };

    let databases = fields[1].clone();
    let roles = fields[2].clone();
    for token in databases.iter().chain(roles.iter()) {
        if !token.quoted && token.value.starts_with('+') {
            return Err("group syntax (\"+\") is not supported".to_string());
        }
    }

    let (address, method_index) = match conn_type {
        ConnType::Local => (AddressMatch::All, 3),
        _ => {
            let addr_token = single_value(&fields[3], "address")?;
            match addr_token.value.as_str() {
                "all" if !addr_token.quoted => (AddressMatch::All, 4),
                "samehost" if !addr_token.quoted => (AddressMatch::SameHost, 4),
                "samenet" if !addr_token.quoted => (AddressMatch::SameNet, 4),
                value => {
                    if let Some((addr_part, prefix_part)) = value.split_once('/') {
                        let net: IpAddr = addr_part
                            .parse()
                            .map_err(|_| format!("invalid address \"{addr_part}\""))?;
                        let prefix: u8 = prefix_part
                            .parse()
                            .map_err(|_| format!("invalid prefix \"{prefix_part}\""))?;
                        let mask = ip::mask_from_prefix(prefix, net.is_ipv6())
                            .map_err(|e| e.to_string())?;
                        (AddressMatch::Cidr { net, mask }, 4)
                    } else if let Ok(net) = value.parse::<IpAddr>() {
                        // A bare address needs a separate mask field.
                        let mask_field = fields
                            .get(4)
                            .ok_or_else(|| "address requires a netmask".to_string())?;
                        let mask_token = single_value(mask_field, "netmask")?;
                        let mask: IpAddr = mask_token
                            .value
                            .parse()
                            .map_err(|_| format!("invalid netmask \"{}\"", mask_token.value))?;
                        if mask.is_ipv4() != net.is_ipv4() {
                            return Err("netmask family does not match address".to_string());
                        }
                        (AddressMatch::Cidr { net, mask }, 5)
                    } else {
                        (AddressMatch::Hostname(value.to_string()), 4)
                    }
                }
            }
        }
    };

    let method_field = fields
        .get(method_index)
        .ok_or_else(|| "missing authentication method".to_string())?;
    let method_token = single_value(method_field, "method")?;

    let mut options = HashMap::new();
    for field in &fields[method_index + 1..] {
        for token in field {
            let (key, value) = token
                .value
                .split_once('=')
                .ok_or_else(|| format!("malformed option \"{}\"", token.value))?;
            options.insert(key.to_string(), value.to_string());
        }
    }

    let method =
        AuthMethod::from_token(&method_token.value, &options).map_err(|e| e.to_string())?;

    Ok(HbaRule {
        line_number,
        conn_type,
        databases,
        roles,
        address,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> HbaRules {
        HbaRules::parse(text, Path::new(".")).unwrap()
    }

    fn network_client(addr: &str, db: &str, user: &str, tls: bool) -> ClientInfo {
        ClientInfo {
            is_local: false,
            addr: Some(addr.parse().unwrap()),
            tls,
            database: db.into(),
            user: user.into(),
        }
    }

    #[tokio::test]
    async fn first_match_wins() {
        let rules = parse(
            "host all alice 10.0.0.0/8 trust\n\
             host all all   10.0.0.0/8 md5\n",
        );
        let client = network_client("10.1.2.3", "appdb", "alice", false);
        let rule = rules.find_match(&client).await.unwrap();
        assert_eq!(rule.method, AuthMethod::Trust);

        let other = network_client("10.1.2.3", "appdb", "bob", false);
        let rule = rules.find_match(&other).await.unwrap();
        assert_eq!(rule.method, AuthMethod::Md5);
    }

    #[tokio::test]
    async fn no_match_is_implicit_reject() {
        let rules = parse("host all all 10.0.0.0/8 trust\n");
        let client = network_client("192.168.0.1", "appdb", "alice", false);
        assert!(rules.find_match(&client).await.is_none());
    }

    #[tokio::test]
    async fn sameuser_and_quoted_all() {
        let rules = parse(
            "host sameuser all 0.0.0.0/0 trust\n\
             host \"all\"  all 0.0.0.0/0 md5\n",
        );
        let same = network_client("1.2.3.4", "alice", "alice", false);
        assert_eq!(
            rules.find_match(&same).await.unwrap().method,
            AuthMethod::Trust
        );
        // "all" quoted is a literal database name, not the keyword.
        let all_db = network_client("1.2.3.4", "all", "bob", false);
        assert_eq!(
            rules.find_match(&all_db).await.unwrap().method,
            AuthMethod::Md5
        );
        let other = network_client("1.2.3.4", "appdb", "bob", false);
        assert!(rules.find_match(&other).await.is_none());
    }

    #[tokio::test]
    async fn hostssl_requires_tls_state() {
        let rules = parse(
            "hostssl all all 0.0.0.0/0 md5\n\
             hostnossl all all 0.0.0.0/0 password\n",
        );
        let tls = network_client("1.2.3.4", "db", "u", true);
        assert_eq!(
            rules.find_match(&tls).await.unwrap().method,
            AuthMethod::Md5
        );
        let plain = network_client("1.2.3.4", "db", "u", false);
        assert_eq!(
            rules.find_match(&plain).await.unwrap().method,
            AuthMethod::Password
        );
    }

    #[tokio::test]
    async fn local_matches_only_unix_clients() {
        let rules = parse("local all all trust\n");
        let unix = ClientInfo {
            is_local: true,
            addr: None,
            tls: false,
            database: "db".into(),
            user: "u".into(),
        };
        assert!(rules.find_match(&unix).await.is_some());
        let net = network_client("127.0.0.1", "db", "u", false);
        assert!(rules.find_match(&net).await.is_none());
    }

    #[test]
    fn group_syntax_is_rejected() {
        let err = HbaRules::parse("host all +admins 0.0.0.0/0 trust\n", Path::new("."));
        assert!(err.is_err());
    }

    #[test]
    fn comma_lists_and_comments() {
        let rules = parse(
            "# leading comment\n\
             host db1,db2 alice,bob 10.0.0.0/8 trust # trailing comment\n",
        );
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn separate_netmask_field() {
        let rules = parse("host all all 10.0.0.0 255.0.0.0 trust\n");
        assert_eq!(rules.len(), 1);
        match &rules.rules[0].address {
            AddressMatch::Cidr { net, mask } => {
                assert_eq!(net.to_string(), "10.0.0.0");
                assert_eq!(mask.to_string(), "255.0.0.0");
            }
            other => panic!("expected CIDR, got {other:?}"),
        }
    }
}
