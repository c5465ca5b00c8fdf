use pgflock::core::auth::hba::{ClientInfo, HbaRules};
use pgflock::core::auth::methods::AuthMethod;
use std::net::IpAddr;
use std::path::Path;

fn client(addr: &str, db: &str, user: &str) -> ClientInfo {
    ClientInfo {
        is_local: false,
        addr: Some(addr.parse::<IpAddr>().unwrap()),
        tls: false,
        database: db.to_string(),
        user: user.to_string(),
    }
}

#[tokio::test]
async fn chosen_method_is_the_first_matching_rule() {
    // Ordering is the whole point of the rule list: a later, broader rule
    // must never shadow an earlier, narrower one.
    let rules = HbaRules::parse(
        "host appdb  alice 10.0.0.0/8     reject\n\
         host all    alice 10.0.0.0/8     trust\n\
         host all    all   10.0.0.0/8     md5\n\
         host all    all   0.0.0.0/0      scram-sha-256\n",
        Path::new("."),
    )
    .unwrap();

    let alice_appdb = client("10.1.1.1", "appdb", "alice");
    assert_eq!(
        rules.find_match(&alice_appdb).await.unwrap().method,
        AuthMethod::Reject
    );

    let alice_other = client("10.1.1.1", "otherdb", "alice");
    assert_eq!(
        rules.find_match(&alice_other).await.unwrap().method,
        AuthMethod::Trust
    );

    let bob_inside = client("10.1.1.1", "appdb", "bob");
    assert_eq!(
        rules.find_match(&bob_inside).await.unwrap().method,
        AuthMethod::Md5
    );

    let bob_outside = client("192.0.2.1", "appdb", "bob");
    assert_eq!(
        rules.find_match(&bob_outside).await.unwrap().method,
        AuthMethod::ScramSha256
    );
}

#[tokio::test]
async fn unmatched_client_has_no_rule() {
    let rules = HbaRules::parse("host all all 10.0.0.0/8 trust\n", Path::new(".")).unwrap();
    let outsider = client("203.0.113.9", "db", "user");
    assert!(rules.find_match(&outsider).await.is_none());
}

#[tokio::test]
async fn included_file_contributes_tokens() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dbs.txt"), "appdb\nreports\n").unwrap();
    let rules = HbaRules::parse(
        "host @dbs.txt all 0.0.0.0/0 trust\n",
        dir.path(),
    )
    .unwrap();

    assert!(rules.find_match(&client("1.2.3.4", "appdb", "x")).await.is_some());
    assert!(rules.find_match(&client("1.2.3.4", "reports", "x")).await.is_some());
    assert!(rules.find_match(&client("1.2.3.4", "secrets", "x")).await.is_none());
}

#[tokio::test]
async fn quoted_tokens_are_literals() {
    let rules = HbaRules::parse(
        "host \"strange db\" all 0.0.0.0/0 trust\n",
        Path::new("."),
    )
    .unwrap();
    assert!(
        rules
            .find_match(&client("1.2.3.4", "strange db", "x"))
            .await
            .is_some()
    );
}

#[test]
fn malformed_lines_are_load_errors() {
    for bad in [
        "host all\n",
        "unknown all all 0.0.0.0/0 trust\n",
        "host all all 0.0.0.0/0 no-such-method\n",
        "host all all 10.0.0.0/99 trust\n",
        "host all +group 0.0.0.0/0 trust\n",
    ] {
        assert!(
            HbaRules::parse(bad, Path::new(".")).is_err(),
            "line {bad:?} must be rejected"
        );
    }
}

#[tokio::test]
async fn ipv6_rules_match_ipv6_clients() {
    let rules = HbaRules::parse("host all all fe80::/10 trust\n", Path::new(".")).unwrap();
    assert!(
        rules
            .find_match(&client("fe80::1234", "db", "u"))
            .await
            .is_some()
    );
    assert!(rules.find_match(&client("2001:db8::1", "db", "u")).await.is_none());
}
