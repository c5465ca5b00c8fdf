use pgflock::core::auth::md5;

#[test]
fn alice_wonderland_vector() {
    // user=alice, password=wonderland, salt=\x01\x02\x03\x04. The server
    // derives the same outer digest from its stored inner hash and accepts
    // iff the bytes match exactly.
    let salt = [0x01u8, 0x02, 0x03, 0x04];

    let stored = md5::encrypt_password("wonderland", "alice");
    assert!(stored.starts_with("md5"));
    assert_eq!(stored.len(), md5::MD5_PASSWD_LEN);
    let inner = md5::strip_prefix(&stored).unwrap();

    // Inner must be hex(md5("wonderlandalice")).
    assert_eq!(inner, hex::encode(::md5::compute(b"wonderlandalice").0));

    // Outer must be "md5" || hex(md5(inner || salt)).
    let outer = md5::salted_response(inner, &salt);
    let mut data = inner.as_bytes().to_vec();
    data.extend_from_slice(&salt);
    assert_eq!(outer, format!("md5{}", hex::encode(::md5::compute(&data).0)));

    assert!(md5::verify_salted(inner, &salt, &outer));
    assert!(md5::verify_password("wonderland", "alice", &salt, &outer));
}

#[test]
fn fresh_responses_verify_and_bit_flips_fail() {
    // Property: for random (password, user, salt), a freshly generated
    // response verifies; flipping any nibble of it fails.
    let cases = [
        ("alice", "wonderland"),
        ("bob", "builder"),
        ("postgres", ""),
        ("u", "p@ss wórd"),
    ];
    for (i, (user, password)) in cases.iter().enumerate() {
        let salt = [i as u8, 0x5a, !(i as u8), 0x7f];
        let stored = md5::encrypt_password(password, user);
        let inner = md5::strip_prefix(&stored).unwrap();
        let response = md5::salted_response(inner, &salt);
        assert!(md5::verify_salted(inner, &salt, &response));

        for pos in 3..response.len() {
            let mut corrupted = response.clone().into_bytes();
            corrupted[pos] = if corrupted[pos] == b'0' { b'1' } else { b'0' };
            let corrupted = String::from_utf8(corrupted).unwrap();
            if corrupted != response {
                assert!(
                    !md5::verify_salted(inner, &salt, &corrupted),
                    "corrupted response at byte {pos} must not verify"
                );
            }
        }
    }
}

#[test]
fn wrong_salt_or_user_fails() {
    let salt = [9u8, 8, 7, 6];
    let other_salt = [6u8, 7, 8, 9];
    let stored = md5::encrypt_password("secret", "carol");
    let inner = md5::strip_prefix(&stored).unwrap();
    let response = md5::salted_response(inner, &salt);

    assert!(!md5::verify_salted(inner, &other_salt, &response));
    assert!(!md5::verify_password("secret", "dave", &salt, &response));
    assert!(!md5::verify_password("sekret", "carol", &salt, &response));
}
