use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use tsb_transport::tcp::{PollEvent, SendBehavior, TcpConnector};

#[derive(Debug, PartialEq)]
struct TestMsg(u32);

impl TestMsg {
    fn to_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self(u32::from_le_bytes(buf.try_into().unwrap()))
    }
}

#[test]
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24712));

    let mut listener = TcpConnector::default();
    let _listening_token = listener.listen_at(bind_addr).unwrap();

    let server = thread::spawn(move || {
        let mut accepted_stream = None;

        while accepted_stream.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => accepted_stream = Some(stream),
                PollEvent::Message { .. } => panic!("shouldn't have gotten here"),
                _ => {}
            });
        }

        let stream_token = accepted_stream.unwrap();

        let mut recv = None;
        loop {
            listener.poll_with(|event| {
                if let PollEvent::Message { token, payload, .. } = event {
                    assert_eq!(token, stream_token);
                    recv = Some(TestMsg::from_bytes(payload));
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        listener.write_or_enqueue_with(SendBehavior::Single(stream_token), |buf| {
            buf.extend_from_slice(&TestMsg(111).to_bytes());
        });
        listener.poll_with(|event| {
            if let PollEvent::Message { .. } = event {
                panic!("shouldn't have gotten here");
            }
        });
        assert_eq!(recv, Some(TestMsg(222)));
    });

    let client = thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut conn = TcpConnector::default();
        let _tok = conn.connect(bind_addr).unwrap();
        // Then responds
        conn.write_or_enqueue_with(SendBehavior::Single(_tok), |buf| {
            buf.extend_from_slice(&TestMsg(222).to_bytes());
        });

        // Client waits for server message
        let mut recv = None;
        loop {
            conn.poll_with(|event| {
                if let PollEvent::Message { payload, .. } = event {
                    recv = Some(TestMsg::from_bytes(payload));
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        assert_eq!(recv, Some(TestMsg(111)));
    });

    server.join().unwrap();
    client.join().unwrap();
}
