//! Shared setup for integration tests: a mock server on a random port.

use std::net::SocketAddr;

/// Start the mock server on its own thread and runtime. The listener is bound
/// before returning, so requests can be sent immediately.
pub fn spawn_server() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
    });

    addr
}

#[allow(dead_code)]
pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}
