//! Integration tests for `FrameChannel` over loopback UDP (spec §4.6,
//! scenario S3).

use socketpipe::frame::Utf8Int32Marshaller;
use socketpipe::frame_channel::{frame_channel, FrameChannelOptions};
use socketpipe::socket_options::bind_udp_socket;

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

#[test]
fn server_echoes_client_datagrams_with_monotonic_local_index() {
    rt().block_on(async {
        let server_addr = "127.0.0.1:0".parse().unwrap();
        let server_socket = bind_udp_socket(server_addr).unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let client_addr = "127.0.0.1:0".parse().unwrap();
        let client_socket = bind_udp_socket(client_addr).unwrap();

        let (server_tx, server_rx) = frame_channel(
            server_socket,
            Utf8Int32Marshaller,
            FrameChannelOptions::default().server(),
        );

        let (client_tx, client_rx) = frame_channel(
            client_socket,
            Utf8Int32Marshaller,
            FrameChannelOptions::default().client(server_addr),
        );

        let server_task = compio::runtime::spawn(async move {
            for _ in 0..3 {
                let frame = server_rx.recv().await.unwrap();
                server_tx.send_to(frame.payload * 2, frame.peer).await.unwrap();
            }
        });

        for value in [1, 2, 3] {
            client_tx.send(value).await.unwrap();
            let echoed = client_rx.recv().await.unwrap();
            assert_eq!(echoed.payload, value * 2);
        }

        server_task.await;
    });
}
