//! End-to-end scenario 6: a payload well past the per-line budget arrives
//! as several `D` lines and reassembles into the original bytes.

use std::thread;

use assuan::client;
use assuan::context::Context;
use assuan::server;

#[test]
fn scenario_6_large_payload_spans_multiple_d_lines() {
    let payload = vec![b'x'; 5_000];
    let expected = payload.clone();

    let (mut server_ctx, mut client_ctx) = Context::socketpair_pair().unwrap();
    server_ctx
        .register_command(
            "BIGDATA",
            move |h, _args| h.write_data(&payload),
            None,
        )
        .unwrap();

    let server_thread = thread::spawn(move || {
        server::process(&mut server_ctx).unwrap();
    });

    let mut received = Vec::new();
    let mut sink = |bytes: &[u8]| -> assuan::Result<()> {
        received.extend_from_slice(bytes);
        Ok(())
    };
    client::transact(&mut client_ctx, "BIGDATA", Some(&mut sink), None, None).unwrap();
    assert_eq!(received, expected);

    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
}
