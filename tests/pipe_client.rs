//! `new_client_pipe` against a real spawned child: a shell one-liner that
//! speaks just enough of the reply grammar to answer one command.

use std::path::Path;

use assuan::client;
use assuan::context::Context;

#[test]
fn client_pipe_talks_to_a_spawned_child() {
    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "read _line; printf 'OK\\n'".to_string(),
    ];
    let (mut ctx, pid) = Context::new_client_pipe(Path::new("/bin/sh"), &argv, &[]).unwrap();
    assert!(pid > 0);

    client::transact(&mut ctx, "NOP", None, None, None).unwrap();
}
