//! Length-prefixed JSON frames over TCP, used by the star topology's
//! per-process gateway links.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;

use serde::{Deserialize, Serialize};

use crate::agent::production::ItemDef;
use crate::agent::AgentBlueprint;
use crate::error::{Result, SimError};
use crate::packets::Packet;

/// Frames are capped well above any realistic packet; anything larger is a
/// corrupted stream.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// First frame the hub sends a worker process: everything needed to
/// construct its agents locally.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub proc_name: String,
    pub blueprints: Vec<AgentBlueprint>,
    pub items: HashMap<String, ItemDef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Frame {
    Assignment(WorkerAssignment),
    Packet(Packet),
}

pub fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let body = serde_json::to_vec(frame)?;
    let len = u32::try_from(body.len())
        .map_err(|_| SimError::Protocol("frame too large".into()))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&body)?;
    Ok(())
}

pub fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).map_err(|_| SimError::LinkClosed)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(SimError::Protocol(format!("oversized frame ({len} bytes)")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).map_err(|_| SimError::LinkClosed)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{PacketType, Payload};
    use std::net::TcpListener;

    #[test]
    fn test_frame_round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let packet = Packet::new(
                "a",
                "b",
                PacketType::CurrencyTransfer,
                Payload::CurrencyTransfer { payment_id: "p".into(), cents: 10 },
            );
            write_frame(&mut stream, &Frame::Packet(packet)).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        match read_frame(&mut stream).unwrap() {
            Frame::Packet(packet) => {
                assert_eq!(packet.packet_type, PacketType::CurrencyTransfer);
                assert_eq!(packet.sender, "a");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        writer.join().unwrap();

        // Peer hang-up surfaces as LinkClosed.
        assert!(matches!(read_frame(&mut stream), Err(SimError::LinkClosed)));
    }
}
