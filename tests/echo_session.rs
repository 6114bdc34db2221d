//! End-to-end sessions between the console client and a live server.

use eotb_echo::client::{self, read_reply, send_message, ClientConfig};
use eotb_echo::config::Config;
use eotb_echo::runtime::Server;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use tokio::io::BufReader;
use tokio::net::TcpStream;

fn spawn_server() -> SocketAddr {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Config::default()
    };

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let server = Server::bind(&config).unwrap();
        tx.send(server.local_addr().unwrap()).unwrap();
        let _ = server.run();
    });
    rx.recv().unwrap()
}

#[tokio::test]
async fn test_console_session() {
    let addr = spawn_server();
    let config = ClientConfig::new("127.0.0.1", addr.port() as i64, "quit").unwrap();

    let mut output = Vec::new();
    let replies = client::run(&config, &b"hello\nsecond line\nquit\n"[..], &mut output)
        .await
        .unwrap();

    assert_eq!(replies, 2);
    assert_eq!(
        String::from_utf8(output).unwrap(),
        "Sending:hello\nresponse:hello\n\
         Sending:second line\nresponse:second line\n\
         Sending:quit\n"
    );
}

#[tokio::test]
async fn test_two_clients_independent_lifecycle() {
    let addr = spawn_server();

    let (a_read, mut a_write) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut a_read = BufReader::new(a_read);
    let (b_read, mut b_write) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut b_read = BufReader::new(b_read);

    send_message(&mut a_write, b"hello").await.unwrap();
    assert_eq!(read_reply(&mut a_read).await.unwrap().unwrap(), "hello");

    send_message(&mut b_write, b"quit").await.unwrap();
    assert_eq!(read_reply(&mut b_read).await.unwrap(), None);

    send_message(&mut a_write, b"hello").await.unwrap();
    assert_eq!(read_reply(&mut a_read).await.unwrap().unwrap(), "hello");
}
