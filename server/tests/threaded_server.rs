mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use common::*;
use unisock_common::{ErrorCode, Handle, SecurityMode};
use unisock_server::{start_threaded_server, ServerOptions, ThreadedServer};

const PAYLOAD_LEN: usize = 256 * 1024;

#[test]
fn plain_connection_is_echoed_and_closed() {
    let server = spawn_server(bound_listener(None), echo_line, Arc::new(()));

    let mut client = connect(server.port, None);
    client.send_all(b"hello threaded server\n").unwrap();
    assert_eq!(read_to_close(&mut client), b"hello threaded server\n");

    server.stop().unwrap();
}

#[test]
fn tls_connection_is_echoed() {
    let certs = test_certs("tls-echo");
    let server = spawn_server(bound_listener(Some(&certs)), echo_line, Arc::new(()));

    let mut client = connect(server.port, Some(&certs));
    assert_eq!(client.security(), SecurityMode::Tls);
    assert!(client.handshake_complete());
    client.send_all(b"over tls\n").unwrap();
    assert_eq!(read_to_close(&mut client), b"over tls\n");

    server.stop().unwrap();
}

#[test]
fn concurrent_handlers_do_not_interleave() {
    let served = Arc::new(AtomicUsize::new(0));
    let server = spawn_server(
        bound_listener(None),
        |client: &mut Handle, served: &AtomicUsize| {
            let mut buf = [0u8; 8];
            if client.receive_line(&mut buf) != 2 {
                return;
            }
            served.fetch_add(1, Ordering::SeqCst);
            let payload = vec![buf[0]; PAYLOAD_LEN];
            client.send_all(&payload).unwrap();
        },
        Arc::clone(&served),
    );

    let port = server.port;
    let clients: Vec<_> = [b'a', b'b']
        .into_iter()
        .map(|tag| {
            thread::spawn(move || {
                let mut client = connect(port, None);
                client.send_all(&[tag, b'\n']).unwrap();
                (tag, read_to_close(&mut client))
            })
        })
        .collect();

    for client in clients {
        let (tag, received) = client.join().unwrap();
        assert_eq!(received.len(), PAYLOAD_LEN);
        assert!(received.iter().all(|&b| b == tag));
    }
    assert_eq!(served.load(Ordering::SeqCst), 2);
    server.stop().unwrap();
}

#[test]
fn failed_handshake_still_reaches_handler() {
    let certs = test_certs("bad-handshake");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_server(
        bound_listener(Some(&certs)),
        |client: &mut Handle, seen: &Mutex<Vec<(bool, Option<ErrorCode>)>>| {
            seen.lock()
                .unwrap()
                .push((client.handshake_complete(), client.last_error().cloned()));
        },
        Arc::clone(&seen),
    );

    // A plain client speaking garbage instead of a ClientHello.
    let mut client = connect(server.port, None);
    client.send_all(b"definitely not tls\r\n\r\n").unwrap();
    let mut buf = [0u8; 512];
    while let Ok((n, _)) = client.receive(&mut buf) {
        if n == 0 {
            break;
        }
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (established, error) = &seen[0];
    assert!(!established);
    assert!(error.is_some());
    server.stop().unwrap();
}

#[test]
fn panicking_handler_still_closes_connection() {
    let server = spawn_server(
        bound_listener(None),
        |client: &mut Handle, _: &()| {
            let mut buf = [0u8; 16];
            if client.receive_line(&mut buf) > 0 && buf.starts_with(b"boom") {
                panic!("handler failure");
            }
            let _ = client.send_all(b"fine\n");
        },
        Arc::new(()),
    );

    let mut doomed = connect(server.port, None);
    doomed.send_all(b"boom\n").unwrap();
    assert!(read_to_close(&mut doomed).is_empty());

    // The accept loop survives the panic.
    let mut next = connect(server.port, None);
    next.send_all(b"hi\n").unwrap();
    assert_eq!(read_to_close(&mut next), b"fine\n");

    server.stop().unwrap();
}

#[test]
fn client_timeout_bounds_handler_reads() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let options = ServerOptions::new()
        .with_client_timeout(Some(Duration::from_millis(100)))
        .with_thread_name_prefix("timeout-test");
    let mut server = ThreadedServer::new(bound_listener(None), options).unwrap();
    let port = server.local_addr().unwrap().port();

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let context = Arc::clone(&errors);
    let accept_loop = thread::spawn(move || {
        server.run_until(
            flag,
            |client: &mut Handle, errors: &Mutex<Vec<Option<ErrorCode>>>| {
                let mut buf = [0u8; 16];
                let n = client.receive_line(&mut buf);
                errors
                    .lock()
                    .unwrap()
                    .push(client.last_error().cloned().filter(|_| n == 0));
            },
            context,
        )
    });

    // Connect and stay silent until the server gives up on us.
    let mut client = connect(port, None);
    assert!(read_to_close(&mut client).is_empty());

    let recorded = errors.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(recorded[0], Some(ErrorCode::Os(_))));

    running.store(false, Ordering::SeqCst);
    accept_loop.join().unwrap().unwrap();
}

#[test]
fn missing_certificate_is_generated_on_demand() {
    if !openssl_available() {
        eprintln!("openssl not found, skipping certificate generation test");
        return;
    }
    let certs = unisock_common::CertPath::from_dir(scratch_dir("generated"));
    assert!(!certs.cert_path.exists());

    let server = spawn_server(bound_listener(Some(&certs)), echo_line, Arc::new(()));
    assert!(certs.cert_path.exists());
    assert!(certs.key_path.exists());

    let mut client = connect(server.port, Some(&certs));
    assert!(client.handshake_complete());
    client.send_all(b"generated\n").unwrap();
    assert_eq!(read_to_close(&mut client), b"generated\n");

    server.stop().unwrap();
}

#[test]
fn start_threaded_server_serves_forever() {
    let listener = bound_listener(None);
    let port = listener.local_addr().unwrap().port();
    // Never returns; the thread ends with the test process.
    thread::spawn(move || start_threaded_server(listener, 8, echo_line, Arc::new(())));

    for line in [&b"first\n"[..], &b"second\n"[..]] {
        let mut client = connect(port, None);
        client.send_all(line).unwrap();
        assert_eq!(read_to_close(&mut client), line);
    }
}

#[test]
fn double_close_is_harmless() {
    let server = spawn_server(bound_listener(None), echo_line, Arc::new(()));
    let mut client = connect(server.port, None);
    client.close();
    client.close();
    assert!(client.is_closed());
    assert!(client.send_all(b"x").is_err());
    server.stop().unwrap();
}
