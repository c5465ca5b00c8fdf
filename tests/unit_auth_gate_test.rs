use pgflock::core::auth::gate::{AuthContext, authenticate_client};
use pgflock::core::auth::hba::{ClientInfo, HbaRules};
use pgflock::core::auth::md5;
use pgflock::core::auth::passwd::PasswordStore;
use pgflock::core::auth::scram::{SCRAM_SHA_256, ScramClient};
use pgflock::core::errors::PoolError;
use pgflock::core::protocol::message;
use std::path::Path;
use std::sync::Arc;

fn context(hba: &str, passwd_lines: &str) -> (AuthContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let passwd_path = dir.path().join("pool_passwd");
    std::fs::write(&passwd_path, passwd_lines).unwrap();
    let ctx = AuthContext {
        hba: Arc::new(HbaRules::parse(hba, Path::new(".")).unwrap()),
        passwd: Arc::new(PasswordStore::load(&passwd_path).unwrap()),
        key: None,
    };
    (ctx, dir)
}

fn network_client(user: &str, database: &str) -> ClientInfo {
    ClientInfo {
        is_local: false,
        addr: Some("10.0.0.7".parse().unwrap()),
        tls: false,
        database: database.to_string(),
        user: user.to_string(),
    }
}

#[tokio::test]
async fn trust_admits_without_any_exchange() {
    let (ctx, _dir) = context("host all all 10.0.0.0/8 trust\n", "");
    let (mut server_side, _client_side) = tokio::io::duplex(4096);
    let client = network_client("alice", "appdb");
    authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn implicit_reject_when_no_rule_matches() {
    let (ctx, _dir) = context("host all all 192.168.0.0/16 trust\n", "");
    let (mut server_side, _client_side) = tokio::io::duplex(4096);
    let client = network_client("alice", "appdb");
    let err = authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AuthFailed { .. }));
    // The client-facing rendering is always the same uniform message.
    assert_eq!(err.to_string(), "client authentication failed");
}

#[tokio::test]
async fn md5_challenge_accepts_the_right_password() {
    let stored = md5::encrypt_password("wonderland", "alice");
    let (ctx, _dir) = context(
        "host all all 10.0.0.0/8 md5\n",
        &format!("alice:{stored}\n"),
    );
    let (mut server_side, mut client_side) = tokio::io::duplex(4096);
    let client = network_client("alice", "appdb");

    let driver = tokio::spawn(async move {
        // Expect the salted challenge, answer it like a libpq client.
        let challenge = message::read_message(&mut client_side).await.unwrap();
        assert_eq!(challenge.tag, b'R');
        let (code, extra) = message::parse_auth_code(&challenge.body).unwrap();
        assert_eq!(code, message::AUTH_MD5_PASSWORD);
        let salt = [extra[0], extra[1], extra[2], extra[3]];
        let response = md5::salted_response(
            md5::strip_prefix(&md5::encrypt_password("wonderland", "alice")).unwrap(),
            &salt,
        );
        message::write_message(
            &mut client_side,
            b'p',
            &message::password_message_body(&response),
        )
        .await
        .unwrap();
        client_side
    });

    authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap();
    driver.await.unwrap();
}

#[tokio::test]
async fn md5_challenge_rejects_the_wrong_password() {
    let stored = md5::encrypt_password("wonderland", "alice");
    let (ctx, _dir) = context(
        "host all all 10.0.0.0/8 md5\n",
        &format!("alice:{stored}\n"),
    );
    let (mut server_side, mut client_side) = tokio::io::duplex(4096);
    let client = network_client("alice", "appdb");

    let driver = tokio::spawn(async move {
        let challenge = message::read_message(&mut client_side).await.unwrap();
        let (_, extra) = message::parse_auth_code(&challenge.body).unwrap();
        let salt = [extra[0], extra[1], extra[2], extra[3]];
        let response = md5::salted_response(
            md5::strip_prefix(&md5::encrypt_password("not-wonderland", "alice")).unwrap(),
            &salt,
        );
        message::write_message(
            &mut client_side,
            b'p',
            &message::password_message_body(&response),
        )
        .await
        .unwrap();
    });

    let err = authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AuthFailed { .. }));
    driver.await.unwrap();
}

#[tokio::test]
async fn scram_exchange_succeeds_against_stored_verifier() {
    let verifier = pgflock::core::auth::scram::ScramVerifier::build("wonderland");
    let (ctx, _dir) = context(
        "host all all 10.0.0.0/8 scram-sha-256\n",
        &format!("alice:{}\n", verifier.serialize()),
    );
    let (mut server_side, mut client_side) = tokio::io::duplex(4096);
    let client = network_client("alice", "appdb");

    let driver = tokio::spawn(async move {
        let mut scram = ScramClient::new("wonderland");

        let sasl = message::read_message(&mut client_side).await.unwrap();
        let (code, _) = message::parse_auth_code(&sasl.body).unwrap();
        assert_eq!(code, message::AUTH_SASL);
        let first = scram.client_first();
        message::write_message(
            &mut client_side,
            b'p',
            &message::sasl_initial_response_body(SCRAM_SHA_256, first.as_bytes()),
        )
        .await
        .unwrap();

        let cont = message::read_message(&mut client_side).await.unwrap();
        let (code, data) = message::parse_auth_code(&cont.body).unwrap();
        assert_eq!(code, message::AUTH_SASL_CONTINUE);
        let client_final = scram
            .handle_server_first(std::str::from_utf8(data).unwrap())
            .unwrap();
        message::write_message(&mut client_side, b'p', client_final.as_bytes())
            .await
            .unwrap();

        let fin = message::read_message(&mut client_side).await.unwrap();
        let (code, data) = message::parse_auth_code(&fin.body).unwrap();
        assert_eq!(code, message::AUTH_SASL_FINAL);
        scram
            .handle_server_final(std::str::from_utf8(data).unwrap())
            .unwrap();
    });

    authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap();
    driver.await.unwrap();
}

#[tokio::test]
async fn cert_method_compares_the_common_name() {
    let (ctx, _dir) = context("hostssl all all 10.0.0.0/8 cert\n", "");
    let mut client = network_client("alice", "appdb");
    client.tls = true;

    let (mut server_side, _client_side) = tokio::io::duplex(4096);
    authenticate_client(&mut server_side, &client, &ctx, Some("alice"))
        .await
        .unwrap();

    let (mut server_side, _client_side) = tokio::io::duplex(4096);
    let err = authenticate_client(&mut server_side, &client, &ctx, Some("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AuthFailed { .. }));
}

#[tokio::test]
async fn ldap_forbidden_characters_fail_before_any_bind() {
    let (ctx, _dir) = context(
        "host all all 10.0.0.0/8 ldap ldapserver=ldap.example.net ldapprefix=uid= ldapsuffix=,dc=example\n",
        "",
    );
    let (mut server_side, _client_side) = tokio::io::duplex(4096);
    let client = network_client("al(ice", "appdb");
    let err = authenticate_client(&mut server_side, &client, &ctx, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AuthFailed { .. }));
}
