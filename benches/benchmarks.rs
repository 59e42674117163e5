use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use criterion::{criterion_group, criterion_main, Criterion};

use keeperd::pipeline::{self, SynthSessionIds};
use keeperd::raft_adapter::RaftAdapter;
use keeperd::server::{Server, ServerContext};
use keeperd::Config;

const PERM_ALL: i32 = 0b11111;

/// Starts a single-node cluster (no peers) on a fixed port backed by a fresh temp dir, drives the
/// `connect` handshake, and hands back the live stream ready to take client frames.
fn start_single_node() -> (tempfile::TempDir, TcpStream) {
    let data_dir = tempfile::tempdir().unwrap();
    let client_port = 22810;
    let toml = format!(
        r#"
        [server]
        my_id = 1
        endpoint = "127.0.0.1:{client_port}"
        data_dir = "{data_dir}"
        "#,
        client_port = client_port,
        data_dir = data_dir.path().display(),
    );
    let config_path = data_dir.path().join("keeperd.toml");
    std::fs::write(&config_path, toml).unwrap();
    let config = Config::load(&config_path).unwrap();

    let adapter = RaftAdapter::open(&config).unwrap();
    let connection_directory = pipeline::new_connection_directory();
    let synth_session_ids = Arc::new(SynthSessionIds::new());
    let cluster = keeperd::cluster::start(&config, adapter, connection_directory.clone()).unwrap();

    keeperd::forwarder::start_server(
        cluster.forwarder_incoming,
        cluster.write_sink.clone(),
        cluster.store.clone(),
    );
    keeperd::session_manager::start(
        &config,
        cluster.store.clone(),
        Arc::clone(&cluster.role),
        cluster.write_sink.clone(),
        cluster.forwarder.clone(),
        connection_directory.clone(),
    );

    let ctx = ServerContext::new(
        &config,
        cluster.store.clone(),
        cluster.write_sink.clone(),
        Arc::clone(&cluster.role),
        connection_directory,
        synth_session_ids,
    );
    let server = Server::new(config.server.endpoint.clone(), ctx);
    server.start();

    // A lone node becomes its own leader as soon as its election timeout fires; give that a
    // moment before attempting the handshake.
    std::thread::sleep(Duration::from_millis(1200));

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", client_port)).unwrap();
    stream.set_nodelay(true).unwrap();

    let mut body = Vec::new();
    body.write_i32::<BigEndian>(0).unwrap(); // protocol_version
    body.write_i64::<BigEndian>(0).unwrap(); // last_zxid_seen
    body.write_i32::<BigEndian>(10_000).unwrap(); // timeout_ms
    body.write_i64::<BigEndian>(0).unwrap(); // session_id
    body.write_i32::<BigEndian>(-1).unwrap(); // password: absent
    write_request(&mut stream, 0, 0, &body);
    let (_xid, _zxid, err, _body) = read_response(&mut stream);
    assert_eq!(err, 0, "connect handshake failed");

    (data_dir, stream)
}

fn write_request(stream: &mut TcpStream, xid: i64, opcode: i32, body: &[u8]) {
    let payload_len = 8 + 4 + body.len();
    let mut frame = Vec::with_capacity(4 + payload_len);
    frame.write_i32::<BigEndian>(payload_len as i32).unwrap();
    frame.write_i64::<BigEndian>(xid).unwrap();
    frame.write_i32::<BigEndian>(opcode).unwrap();
    frame.extend_from_slice(body);
    stream.write_all(&frame).unwrap();
}

fn read_response(stream: &mut TcpStream) -> (i64, i64, i32, Vec<u8>) {
    let len = stream.read_i32::<BigEndian>().unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    let mut cursor = &buf[..];
    let xid = cursor.read_i64::<BigEndian>().unwrap();
    let zxid = cursor.read_i64::<BigEndian>().unwrap();
    let err = cursor.read_i32::<BigEndian>().unwrap();
    (xid, zxid, err, cursor.to_vec())
}

fn write_wire_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_i32::<BigEndian>(s.len() as i32).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn create_body(path: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write_wire_string(&mut body, path);
    body.write_i32::<BigEndian>(data.len() as i32).unwrap();
    body.extend_from_slice(data);
    body.write_i32::<BigEndian>(1).unwrap(); // one ACL entry: world:anyone, all perms
    body.write_i32::<BigEndian>(PERM_ALL).unwrap();
    write_wire_string(&mut body, "world");
    write_wire_string(&mut body, "anyone");
    body.write_i32::<BigEndian>(0).unwrap(); // create flags: persistent
    body
}

fn path_only_body(path: &str) -> Vec<u8> {
    let mut body = Vec::new();
    write_wire_string(&mut body, path);
    body.write_u8(0).unwrap(); // watch = false
    body
}

fn delete_body(path: &str, version: i32) -> Vec<u8> {
    let mut body = Vec::new();
    write_wire_string(&mut body, path);
    body.write_i32::<BigEndian>(version).unwrap();
    body
}

fn criterion_benchmarks(c: &mut Criterion) {
    let (_data_dir, mut stream) = start_single_node();
    let mut xid = 1i64;

    c.bench_function("create, getData and delete", |b| {
        b.iter(|| {
            xid += 1;
            write_request(&mut stream, xid, 1, &create_body("/bench", b"value"));
            let (_, _, err, _) = read_response(&mut stream);
            assert_eq!(err, 0);

            xid += 1;
            write_request(&mut stream, xid, 4, &path_only_body("/bench"));
            let (_, _, err, _) = read_response(&mut stream);
            assert_eq!(err, 0);

            xid += 1;
            write_request(&mut stream, xid, 2, &delete_body("/bench", -1));
            let (_, _, err, _) = read_response(&mut stream);
            assert_eq!(err, 0);
        });
    });
}

criterion_group!(benches, criterion_benchmarks);
criterion_main!(benches);
