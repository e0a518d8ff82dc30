//! Serial side-channel comparison against the golden output (spec.md
//! §4.3.3: "drains one datagram after the run and compares").

use std::net::UdpSocket;

/// Compare one received datagram against `golden`, treating a recv timeout
/// (configured on the socket, 500ms per spec.md) as "no match".
pub fn matches_golden(socket: &UdpSocket, golden: &[u8]) -> bool {
    let mut buf = vec![0u8; golden.len().max(4096)];
    match socket.recv(&mut buf) {
        Ok(n) => &buf[..n] == golden,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn matches_identical_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello\n", addr).unwrap();

        assert!(matches_golden(&receiver, b"hello\n"));
    }

    #[test]
    fn timeout_is_not_a_match() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        assert!(!matches_golden(&receiver, b"hello\n"));
    }

    #[test]
    fn mismatched_payload_is_not_a_match() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"goodbye\n", addr).unwrap();

        assert!(!matches_golden(&receiver, b"hello\n"));
    }
}
