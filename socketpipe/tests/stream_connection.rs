//! Integration tests for `StreamConnection` over real loopback TCP
//! sockets (spec §4.5, scenarios S1/S5/S6).

use compio::net::{TcpListener, TcpStream};
use socketpipe::connection::{StreamConnection, StreamConnectionOptions};

/// Enable `RUST_LOG`-driven tracing output for debugging a failing run;
/// a no-op otherwise.
fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

fn rt() -> compio::runtime::Runtime {
    init_tracing();
    compio::runtime::Runtime::new().unwrap()
}

async fn write_all(conn: &StreamConnection, data: &[u8]) {
    let writer = conn.send_writer();
    let mut buf = writer.get_memory(data.len()).unwrap();
    buf[..data.len()].copy_from_slice(data);
    writer.advance(&buf, data.len()).unwrap();
    writer.flush_async().await.unwrap();
}

/// Writes `data` as consecutive chunks no larger than `chunk_size`,
/// `advance`-ing each before a single trailing `flush_async` — spec S6's
/// "3 separate `advance(...)` blocks" committed into one scatter-gather
/// send.
async fn write_chunked(conn: &StreamConnection, data: &[u8], chunk_size: usize) {
    let writer = conn.send_writer();
    for chunk in data.chunks(chunk_size) {
        let mut buf = writer.get_memory(chunk.len()).unwrap();
        buf[..chunk.len()].copy_from_slice(chunk);
        writer.advance(&buf, chunk.len()).unwrap();
    }
    writer.flush_async().await.unwrap();
}

async fn read_all(conn: &StreamConnection) -> Vec<u8> {
    let reader = conn.receive_reader();
    let mut collected = Vec::new();
    loop {
        let result = reader.read_async().await.unwrap();
        collected.extend_from_slice(&result.sequence.to_vec());
        let done = result.is_completed && result.sequence.is_empty();
        reader.advance_to(result.sequence.end(), None).unwrap();
        if done {
            break;
        }
    }
    collected
}

#[test]
fn echo_round_trip_over_loopback_tcp() {
    rt().block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = StreamConnection::new(stream, StreamConnectionOptions::default()).unwrap();
            let received = read_all(&conn).await;
            write_all(&conn, &received).await;
            conn.send_writer().complete(None);
            conn.dispose();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = StreamConnection::new(stream, StreamConnectionOptions::default()).unwrap();
        write_all(&client, b"hello socketpipe").await;
        client.send_writer().complete(None);

        let echoed = read_all(&client).await;
        assert_eq!(echoed, b"hello socketpipe");

        client.dispose();
        server.await;
    });
}

#[test]
fn peer_eof_is_observed_as_read_eof() {
    rt().block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = StreamConnection::new(stream, StreamConnectionOptions::default()).unwrap();
            write_all(&conn, b"bye").await;
            conn.send_writer().complete(None);
            conn.dispose();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = StreamConnection::new(stream, StreamConnectionOptions::default()).unwrap();
        let received = read_all(&client).await;
        assert_eq!(received, b"bye");

        client.dispose();
        server.await;

        assert!(client.shutdown_state().is_shutdown());
    });
}

#[test]
fn large_payload_spanning_multiple_blocks_survives_scatter_gather_send() {
    rt().block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = StreamConnection::new(
                stream,
                StreamConnectionOptions::default().with_block_size(1024),
            )
            .unwrap();
            let received = read_all(&conn).await;
            conn.dispose();
            received
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = StreamConnection::new(
            stream,
            StreamConnectionOptions::default().with_block_size(1024),
        )
        .unwrap();
        write_chunked(&client, &payload, 1024).await;
        client.send_writer().complete(None);
        client.dispose();

        let received = server.await;
        assert_eq!(received, expected);
        assert_eq!(client.bytes_sent(), expected.len() as u64);
    });
}
