//! `new_server_socket`/`new_client_socket` over a real local socket path,
//! including peer-credential capture and the nonce-auth handshake.

use std::thread;

use assuan::client;
use assuan::config::GlobalConfig;
use assuan::context::Context;
use assuan::server;
use assuan::transport::NonceAuth;

fn socket_path() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assuan-test.sock");
    (dir, path)
}

#[test]
fn client_and_server_connect_over_a_named_socket() {
    let (_dir, path) = socket_path();
    let config = GlobalConfig::snapshot();
    let listen_fd = config.vtable.socket(&path).unwrap();

    let server_thread = thread::spawn(move || {
        let mut ctx = Context::new_server_socket(listen_fd).unwrap();
        server::process(&mut ctx).unwrap();
    });

    // Give the listener a moment to be ready to accept; the connect below
    // retries briefly since the accept() call races this thread's start.
    let mut client_ctx = None;
    for _ in 0..50 {
        match Context::new_client_socket(&path, None) {
            Ok(ctx) => {
                client_ctx = Some(ctx);
                break;
            }
            Err(_) => thread::sleep(std::time::Duration::from_millis(20)),
        }
    }
    let mut client_ctx = client_ctx.expect("server never started listening");

    client::transact(&mut client_ctx, "NOP", None, None, None).unwrap();
    client::send_raw(&mut client_ctx, "BYE").unwrap();
    client::receive_line(&mut client_ctx).unwrap();
    server_thread.join().unwrap();
}

#[test]
fn nonce_file_round_trips_through_write_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let nonce_path = dir.path().join("nonce");
    let written = NonceAuth::write(&nonce_path).unwrap();
    let read_back = NonceAuth::read(&nonce_path).unwrap();
    assert_eq!(written, read_back);
}
