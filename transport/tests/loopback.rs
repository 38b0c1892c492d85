//! End-to-end loopback scenarios driven through the public `Listener`/
//! `Socket` facade: real `UdpSocket`s on 127.0.0.1, real worker threads.

use std::net::SocketAddr;
use std::time::Duration;

use transport::{Config, Listener, Socket, State, TransType};

fn any_local() -> SocketAddr {
	"127.0.0.1:0".parse().unwrap()
}

fn file_mode_config() -> Config {
	Config::builder().trans_type(TransType::File).tsbpd_mode(false).build().unwrap()
}

#[test]
fn file_mode_message_round_trip() {
	let listener = Listener::bind(any_local(), file_mode_config()).unwrap();
	let addr = listener.local_addr().unwrap();

	let client_thread = std::thread::spawn(move || {
		let client = Socket::connect(addr, file_mode_config()).unwrap();
		client.write(b"hello, world", -1, true, Some(Duration::from_secs(2))).unwrap();
		client
	});

	let server = listener.accept().unwrap();
	let mut buf = Vec::new();
	let n = server.read(&mut buf, Some(Duration::from_secs(2))).unwrap();
	assert_eq!(n, b"hello, world".len());
	assert_eq!(&buf[..n], b"hello, world");

	let client = client_thread.join().unwrap();
	assert_eq!(client.state(), State::Connected);
}

#[test]
fn multiple_messages_preserve_order() {
	let listener = Listener::bind(any_local(), file_mode_config()).unwrap();
	let addr = listener.local_addr().unwrap();

	let sender = std::thread::spawn(move || {
		let client = Socket::connect(addr, file_mode_config()).unwrap();
		for i in 0..20u32 {
			let msg = format!("message-{i}");
			client.write(msg.as_bytes(), -1, true, Some(Duration::from_secs(2))).unwrap();
		}
		client
	});

	let server = listener.accept().unwrap();
	let mut received = Vec::new();
	while received.len() < 20 {
		let mut buf = Vec::new();
		let n = server.read(&mut buf, Some(Duration::from_secs(2))).unwrap();
		if n > 0 {
			received.push(String::from_utf8(buf[..n].to_vec()).unwrap());
		}
	}

	for (i, msg) in received.iter().enumerate() {
		assert_eq!(msg, &format!("message-{i}"));
	}

	sender.join().unwrap();
}

#[test]
fn live_mode_tsbpd_delivers_after_delay() {
	let server_config = Config::builder().trans_type(TransType::Live).tsbpd_mode(true).rcv_latency_ms(50).build().unwrap();
	let client_config = Config::builder().trans_type(TransType::Live).tsbpd_mode(true).peer_latency_ms(50).build().unwrap();

	let listener = Listener::bind(any_local(), server_config).unwrap();
	let addr = listener.local_addr().unwrap();

	let sender = std::thread::spawn(move || {
		let client = Socket::connect(addr, client_config).unwrap();
		client.write(b"live frame", -1, true, Some(Duration::from_secs(2))).unwrap();
		client
	});

	let server = listener.accept().unwrap();
	let mut buf = Vec::new();
	let n = server.read(&mut buf, Some(Duration::from_secs(3))).unwrap();
	assert_eq!(&buf[..n], b"live frame");

	sender.join().unwrap();
}

#[test]
fn closing_a_socket_reaches_closed_state() {
	let listener = Listener::bind(any_local(), file_mode_config()).unwrap();
	let addr = listener.local_addr().unwrap();

	let client = Socket::connect(addr, file_mode_config()).unwrap();
	let _server = listener.accept().unwrap();

	client.close();
	assert_eq!(client.state(), State::Closing);

	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	while client.state() != State::Closed && std::time::Instant::now() < deadline {
		std::thread::sleep(Duration::from_millis(20));
	}
	assert_eq!(client.state(), State::Closed);
}

#[test]
fn connect_to_unreachable_peer_times_out() {
	// Nothing is bound at this address; the handshake should never complete.
	let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
	let config = Config::builder().trans_type(TransType::File).conn_timeo_ms(300).build().unwrap();
	let result = Socket::connect(unreachable, config);
	assert!(result.is_err());
}
