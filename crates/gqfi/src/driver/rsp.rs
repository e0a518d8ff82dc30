//! GDB Remote Serial Protocol packet framing.
//!
//! Replaces the original's approach of generating `-ex '<python>'` script
//! strings fed to an external `gdb` binary: the driver speaks the wire
//! protocol directly over the emulator's stdio pipe.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{GqfiError, Result};

const ACK: u8 = b'+';
const NAK: u8 = b'-';

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame `payload` as `$payload#cc`.
pub fn encode(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload.as_bytes());
    out.push(b'#');
    out.extend(format!("{:02x}", checksum(payload.as_bytes())).into_bytes());
    out
}

/// A request/response transport over the emulator child's stdio, framed as
/// GDB RSP packets. One command in flight at a time — callers serialize
/// through [`crate::driver::qemu::QemuRspDriver`]'s owning task.
pub struct RspTransport<W, R> {
    writer: W,
    reader: R,
}

impl<W, R> RspTransport<W, R>
where
    W: AsyncWriteExt + Unpin,
    R: AsyncReadExt + Unpin,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self { writer, reader }
    }

    /// Send one command packet, wait for `+` ack, read the response packet,
    /// ack it in turn, and return its payload.
    pub async fn request(&mut self, payload: &str) -> Result<String> {
        let packet = encode(payload);
        self.writer
            .write_all(&packet)
            .await
            .map_err(|e| GqfiError::Emulator(format!("write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| GqfiError::Emulator(format!("flush failed: {e}")))?;

        self.expect_ack().await?;
        let response = self.read_packet().await?;
        self.send_ack().await?;
        Ok(response)
    }

    async fn expect_ack(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        self.reader
            .read_exact(&mut byte)
            .await
            .map_err(|e| GqfiError::Emulator(format!("expected ack, got error: {e}")))?;
        match byte[0] {
            ACK => Ok(()),
            NAK => Err(GqfiError::Emulator("stub rejected packet (nak)".into())),
            other => Err(GqfiError::Emulator(format!(
                "unexpected byte waiting for ack: {other:#x}"
            ))),
        }
    }

    async fn send_ack(&mut self) -> Result<()> {
        self.writer
            .write_all(&[ACK])
            .await
            .map_err(|e| GqfiError::Emulator(format!("ack write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| GqfiError::Emulator(format!("ack flush failed: {e}")))
    }

    async fn read_packet(&mut self) -> Result<String> {
        let mut start = [0u8; 1];
        loop {
            self.reader
                .read_exact(&mut start)
                .await
                .map_err(|e| GqfiError::Emulator(format!("disconnected reading packet: {e}")))?;
            if start[0] == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.reader
                .read_exact(&mut byte)
                .await
                .map_err(|e| GqfiError::Emulator(format!("disconnected mid-packet: {e}")))?;
            if byte[0] == b'#' {
                break;
            }
            payload.push(byte[0]);
        }

        let mut cksum_hex = [0u8; 2];
        self.reader
            .read_exact(&mut cksum_hex)
            .await
            .map_err(|e| GqfiError::Emulator(format!("disconnected reading checksum: {e}")))?;
        let expected = u8::from_str_radix(std::str::from_utf8(&cksum_hex).unwrap_or("00"), 16)
            .map_err(|_| GqfiError::Emulator("malformed checksum".into()))?;
        if expected != checksum(&payload) {
            return Err(GqfiError::Emulator("checksum mismatch".into()));
        }

        String::from_utf8(payload).map_err(|e| GqfiError::Emulator(format!("non-utf8 packet: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_known_checksum() {
        // "OK" checksum is 0x4f + 0x4b = 0x9a
        assert_eq!(encode("OK"), b"$OK#9a".to_vec());
    }

    #[tokio::test]
    async fn request_round_trips_a_command() {
        let (client_w, server_r) = tokio::io::duplex(256);
        let (server_w, client_r) = tokio::io::duplex(256);
        let mut client = RspTransport::new(client_w, client_r);

        tokio::spawn(async move {
            let mut server = RspTransport::new(server_w, server_r);
            // Drive the server side manually to simulate the emulator stub.
            let mut reader = server.reader;
            let mut writer = server.writer;
            let mut start = [0u8; 1];
            reader.read_exact(&mut start).await.unwrap();
            let mut payload = Vec::new();
            let mut b = [0u8; 1];
            loop {
                reader.read_exact(&mut b).await.unwrap();
                if b[0] == b'#' {
                    break;
                }
                payload.push(b[0]);
            }
            let mut cksum = [0u8; 2];
            reader.read_exact(&mut cksum).await.unwrap();
            writer.write_all(&[ACK]).await.unwrap();
            writer.write_all(&encode("OK")).await.unwrap();
            writer.flush().await.unwrap();
            let mut ack = [0u8; 1];
            reader.read_exact(&mut ack).await.unwrap();
        });

        let resp = client.request("qSupported").await.unwrap();
        assert_eq!(resp, "OK");
    }
}
