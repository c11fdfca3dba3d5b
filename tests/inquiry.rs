//! End-to-end scenarios 3 and 5: a handler-initiated inquiry answered with
//! percent-encoded data, and a client cancel mid-inquiry.

use std::thread;

use assuan::client::{self, InquiryResponder};
use assuan::context::Context;
use assuan::server;
use assuan::ErrorCode;

#[test]
fn scenario_3_inquiry_round_trip_with_percent_encoding() {
    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();
    server_ctx
        .register_command(
            "GETDATA",
            |h, _args| {
                let payload = h.inquire("NEED", "3")?;
                assert_eq!(payload, b"ab%c\r");
                Ok(())
            },
            None,
        )
        .unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    let answer = |_kw: &str, _args: &str, r: &mut InquiryResponder<'_>| -> assuan::Result<()> {
        // "ab%c\r" split across two D lines, the second carrying an
        // encoded trailing CR, exactly as worked through in the literal
        // scenario.
        r.write_data(b"ab%c")?;
        r.write_data(b"\r")
    };
    client::transact(&mut client_ctx, "GETDATA", None, Some(&answer), None).unwrap();

    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
}

#[test]
fn scenario_5_cancel_mid_inquiry_yields_err_canceled() {
    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();
    server_ctx
        .register_command("GETDATA", |h, _args| h.inquire("NEED", "3").map(|_| ()), None)
        .unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    // Emulate a peer that aborts the inquiry instead of answering it.
    client::send_raw(&mut client_ctx, "GETDATA").unwrap();
    assert_eq!(
        client::receive_line(&mut client_ctx).unwrap(),
        Some("INQUIRE NEED 3".to_string())
    );
    client::send_raw(&mut client_ctx, "CAN").unwrap();

    match client::receive_line(&mut client_ctx).unwrap() {
        Some(line) => {
            assert!(line.starts_with("ERR 99 "), "expected ERR 99 ..., got {line:?}");
        }
        None => panic!("expected a reply line, got eof"),
    }

    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
    assert_eq!(ErrorCode::Canceled.code(), 99);
}
