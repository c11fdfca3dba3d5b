//! End-to-end scenarios 1, 2, and 4: a single command, a registered
//! handler that writes inline data, and an unregistered verb.

use std::thread;

use assuan::client;
use assuan::context::Context;
use assuan::server;

#[test]
fn scenario_1_nop() {
    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    client::send_raw(&mut client_ctx, "NOP").unwrap();
    assert_eq!(
        client::receive_line(&mut client_ctx).unwrap(),
        Some("OK".to_string())
    );
    client::send_raw(&mut client_ctx, "BYE").unwrap();
    assert_eq!(
        client::receive_line(&mut client_ctx).unwrap(),
        Some("OK".to_string())
    );

    server_thread.join().unwrap();
}

#[test]
fn scenario_2_echo_handler_writes_inline_data() {
    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();
    server_ctx
        .register_command("ECHO", |h, args| h.write_data(args.as_bytes()), None)
        .unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    let mut received = Vec::new();
    let mut sink = |bytes: &[u8]| -> assuan::Result<()> {
        received.extend_from_slice(bytes);
        Ok(())
    };
    client::transact(&mut client_ctx, "ECHO hello world", Some(&mut sink), None, None).unwrap();
    assert_eq!(received, b"hello world");

    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
}

#[test]
fn scenario_4_unknown_command() {
    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    let err = client::transact(&mut client_ctx, "UNKNOWN foo", None, None, None).unwrap_err();
    assert_eq!(err.code(), assuan::ErrorCode::UnknownCommand);
    assert_eq!(err.code().code(), 275);

    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
}
