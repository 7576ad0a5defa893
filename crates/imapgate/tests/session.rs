/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use tokio::net::TcpStream;

mod common;

use common::{
    assert_contains, assert_not_contains, b64, spawn_mock_auth, spawn_gateway, ImapConnection,
    Options,
};

async fn connect(server: &common::TestServer) -> ImapConnection<TcpStream> {
    ImapConnection::new(TcpStream::connect(server.addr).await.unwrap())
}

#[tokio::test]
async fn capability_and_logout() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;

    let greeting = imap.expect_line().await;
    assert!(greeting.starts_with("* OK [CAPABILITY "), "{:?}", greeting);
    assert!(greeting.contains("IMAP4rev1"), "{:?}", greeting);
    assert!(greeting.ends_with("imapgate ready."), "{:?}", greeting);
    // Loopback peers are secured: plaintext mechanisms are advertised even
    // though plaintext auth is disabled for unsecured transports.
    assert!(greeting.contains("AUTH=PLAIN"), "{:?}", greeting);
    assert!(!greeting.contains("LOGINDISABLED"), "{:?}", greeting);
    // No TLS material configured.
    assert!(!greeting.contains("STARTTLS"), "{:?}", greeting);

    imap.send("CAPABILITY").await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "* CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN");
    assert_contains(&lines, "OK Capability completed.");

    imap.send("NOOP").await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK NOOP completed.");

    imap.send("LOGOUT").await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "* BYE Logging out");
    assert_contains(&lines, "OK Logout completed.");
    imap.expect_eof().await;
}

#[tokio::test]
async fn bad_command_flood() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    for _ in 0..9 {
        imap.send("NOTACOMMAND").await;
        let lines = imap.assert_tagged("BAD").await;
        assert_contains(&lines, "BAD Error in IMAP command received by server.");
    }

    // The tenth bad command still gets its tagged reply, then the session
    // is torn down.
    imap.send("NOTACOMMAND").await;
    let lines = imap.assert_tagged("BAD").await;
    assert_contains(&lines, "BAD Error in IMAP command received by server.");
    assert_eq!(
        imap.expect_line().await,
        "* BYE Too many invalid IMAP commands."
    );
    imap.expect_eof().await;
}

#[tokio::test]
async fn login_success_hands_off() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("LOGIN alice secret").await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
    imap.expect_eof().await;

    let handoffs = server.handoffs.lock().unwrap().clone();
    assert_eq!(handoffs, vec![("alice".to_string(), "PLAIN".to_string())]);
}

#[tokio::test]
async fn login_failure_keeps_session() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("LOGIN alice wrong").await;
    let lines = imap.assert_tagged("NO").await;
    assert_contains(&lines, "NO Authentication failed.");

    // The session is still usable.
    imap.send("NOOP").await;
    imap.assert_tagged("OK").await;
    assert!(server.handoffs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn login_with_literals() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("LOGIN {5}").await;
    assert_eq!(imap.expect_line().await, "+ Ready for 5 bytes.");
    imap.send_raw("alice {6}").await;
    assert_eq!(imap.expect_line().await, "+ Ready for 6 bytes.");
    imap.send_raw("secret").await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
}

#[tokio::test]
async fn login_argument_errors_are_bad() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("LOGIN alice").await;
    let lines = imap.assert_tagged("BAD").await;
    assert_contains(&lines, "BAD Missing arguments.");

    imap.send("LOGIN alice secret extra").await;
    let lines = imap.assert_tagged("BAD").await;
    assert_contains(&lines, "BAD Too many arguments.");
}

#[tokio::test]
async fn authenticate_plain_with_initial_response() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send(&format!("AUTHENTICATE PLAIN {}", b64("\0alice\0secret")))
        .await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
    imap.expect_eof().await;

    let handoffs = server.handoffs.lock().unwrap().clone();
    assert_eq!(handoffs, vec![("alice".to_string(), "PLAIN".to_string())]);
}

#[tokio::test]
async fn authenticate_plain_with_continuation() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("AUTHENTICATE PLAIN").await;
    assert_eq!(imap.expect_line().await, "+ ");
    imap.send_raw(&b64("\0alice\0secret")).await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
}

#[tokio::test]
async fn authenticate_login_two_rounds() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("AUTHENTICATE LOGIN").await;
    assert_eq!(imap.expect_line().await, "+ VXNlcm5hbWU6");
    imap.send_raw(&b64("alice")).await;
    assert_eq!(imap.expect_line().await, "+ UGFzc3dvcmQ6");
    imap.send_raw(&b64("secret")).await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
    imap.expect_eof().await;

    let handoffs = server.handoffs.lock().unwrap().clone();
    assert_eq!(handoffs, vec![("alice".to_string(), "LOGIN".to_string())]);
}

#[tokio::test]
async fn authenticate_cancelled_with_star() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("AUTHENTICATE PLAIN").await;
    assert_eq!(imap.expect_line().await, "+ ");
    imap.send_raw("*").await;
    let lines = imap.assert_tagged("BAD").await;
    assert_contains(&lines, "BAD Authentication aborted");

    imap.send("NOOP").await;
    imap.assert_tagged("OK").await;
}

#[tokio::test]
async fn authenticate_unknown_mechanism() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send("AUTHENTICATE CRAM-MD5").await;
    let lines = imap.assert_tagged("NO").await;
    assert_contains(&lines, "NO Unsupported authentication mechanism.");
}

#[tokio::test]
async fn empty_tag_is_a_command_error() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    imap.send_raw("* NOOP").await;
    assert_eq!(
        imap.expect_line().await,
        "* BAD Error in IMAP command received by server."
    );

    imap.send("NOOP").await;
    imap.assert_tagged("OK").await;
}

#[tokio::test]
async fn line_length_boundary() {
    let server = spawn_gateway(Options::default()).await;

    // Exactly 8192 bytes parses; it is answered like any malformed LOGIN.
    // No single argument may exceed 4096 bytes, so the line is padded with
    // three of them.
    let mut imap = connect(&server).await;
    imap.expect_line().await;
    let filler = 8192 - "t1 LOGIN ".len() - 4000 - 1 - 4000 - 1 - 2;
    imap.send(&format!(
        "LOGIN {} {} {}",
        "x".repeat(4000),
        "y".repeat(4000),
        "z".repeat(filler)
    ))
    .await;
    let lines = imap.assert_tagged("BAD").await;
    assert_contains(&lines, "BAD Too many arguments.");

    // One byte more is fatal.
    let mut imap = connect(&server).await;
    imap.expect_line().await;
    let filler = 8193 - "t1 LOGIN ".len() - 4000 - 1 - 4000 - 1 - 2;
    imap.send(&format!(
        "LOGIN {} {} {}",
        "x".repeat(4000),
        "y".repeat(4000),
        "z".repeat(filler)
    ))
    .await;
    assert_eq!(
        imap.expect_line().await,
        "* BYE Input buffer full, aborting"
    );
    imap.expect_eof().await;
}

#[tokio::test]
async fn auth_service_down_blocks_then_resumes() {
    let server = spawn_gateway(Options {
        start_auth: false,
        ..Options::default()
    })
    .await;
    let mut imap = connect(&server).await;

    // Greeting advertises no mechanisms while the service is unreachable.
    let greeting = imap.expect_line().await;
    assert!(!greeting.contains("AUTH="), "{:?}", greeting);

    imap.send("LOGIN alice secret").await;
    assert_eq!(
        imap.expect_line().await,
        "* OK Waiting for authentication process to respond.."
    );

    // Bring the service up; the blocked input is replayed.
    spawn_mock_auth(server.auth_path.clone());
    server.wait_auth_connected().await;
    let lines = imap.assert_tagged("OK").await;
    assert_contains(&lines, "OK Logged in.");
}

#[tokio::test]
async fn idle_clients_are_disconnected() {
    let server = spawn_gateway(Options {
        idle_timeout: Duration::from_secs(1),
        ..Options::default()
    })
    .await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    assert_eq!(
        imap.expect_line().await,
        "* BYE Disconnected for inactivity."
    );
    imap.expect_eof().await;
}

#[tokio::test]
async fn connection_queue_full_evicts_oldest() {
    let max = 17;
    let server = spawn_gateway(Options {
        max_logging_users: max,
        ..Options::default()
    })
    .await;

    let mut connections = Vec::new();
    for _ in 0..max {
        let mut imap = connect(&server).await;
        imap.expect_line().await;
        connections.push(imap);
    }

    // One more admission kills a batch of 16 of the oldest sessions,
    // without a BYE.
    let mut newest = connect(&server).await;
    newest.expect_line().await;

    let mut evicted = 0;
    for mut imap in connections {
        if imap.eof_within(Duration::from_secs(2)).await {
            evicted += 1;
        }
    }
    assert_eq!(evicted, 16);

    newest.send("NOOP").await;
    newest.assert_tagged("OK").await;
}

#[tokio::test]
async fn noop_does_not_advance_bad_counter() {
    let server = spawn_gateway(Options::default()).await;
    let mut imap = connect(&server).await;
    imap.expect_line().await;

    // Interleave valid commands with 9 bad ones; the counter must not
    // reset, but the 10th valid command must not disconnect either.
    for _ in 0..9 {
        imap.send("NOTACOMMAND").await;
        imap.assert_tagged("BAD").await;
        imap.send("NOOP").await;
        imap.assert_tagged("OK").await;
    }
    imap.send("NOTACOMMAND").await;
    let lines = imap.assert_tagged("BAD").await;
    assert_not_contains(&lines, "* BYE");
    assert_eq!(
        imap.expect_line().await,
        "* BYE Too many invalid IMAP commands."
    );
    imap.expect_eof().await;
}
