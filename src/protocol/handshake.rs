//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! Simple variant only: no HMAC digest. S2/C2 echoes are not verified
//! beyond length; the random payload carries no meaning here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Handshake role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Need to send C0C1 (client) or start waiting (server)
    Initial,
    /// Waiting for the peer's C0C1 / S0S1S2
    WaitingForPeerPacket,
    /// Waiting for the peer's echo (C2, server only)
    WaitingForPeerEcho,
    Done,
}

/// Handshake state machine
///
/// Feed inbound bytes through [`Handshake::process`]; whatever it returns
/// goes back on the wire.
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self { role, state: HandshakeState::Initial }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes the next transition needs, for read sizing
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => 1 + 2 * HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Produce the opening bytes: C0+C1 for a client, nothing for a server
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }

        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&generate_packet());
                self.state = HandshakeState::WaitingForPeerPacket;
                Some(buf.freeze())
            }
            HandshakeRole::Server => {
                self.state = HandshakeState::WaitingForPeerPacket;
                None
            }
        }
    }

    /// Consume inbound bytes, returning the response to write (if any)
    ///
    /// Returns `Ok(None)` when more data is needed or nothing has to be
    /// sent. `data` is only advanced past bytes that were consumed.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        match self.state {
            HandshakeState::WaitingForPeerPacket => self.process_peer_packet(data),
            HandshakeState::WaitingForPeerEcho => self.process_peer_echo(data),
            _ => Ok(None),
        }
    }

    fn process_peer_packet(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        match self.role {
            HandshakeRole::Server => {
                // C0 + C1
                if data.remaining() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version).into());
                }

                let mut c1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut c1);

                // S0 + S1 + S2 in one write
                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&generate_packet());
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerEcho;
                Ok(Some(response.freeze()))
            }
            HandshakeRole::Client => {
                // S0 + S1 + S2
                if data.remaining() < 1 + HANDSHAKE_SIZE * 2 {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version).into());
                }

                let mut s1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut s1);
                data.advance(HANDSHAKE_SIZE); // S2, discarded

                let c2 = generate_echo(&s1);
                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&c2)))
            }
        }
    }

    fn process_peer_echo(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        if self.role != HandshakeRole::Server {
            return Err(HandshakeError::InvalidState.into());
        }

        // C2, discarded
        if data.remaining() < HANDSHAKE_SIZE {
            return Ok(None);
        }
        data.advance(HANDSHAKE_SIZE);
        self.state = HandshakeState::Done;
        Ok(None)
    }
}

/// Build a C1/S1 packet: timestamp, zero field, pseudo-random fill
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());
    // bytes 4..8 stay zero: simple handshake marker

    // The random block carries no protocol meaning; an LCG keeps this
    // dependency-free.
    let mut seed = timestamp as u64 | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}

/// Build an echo packet (C2/S2): peer packet with our receive time in
/// bytes 4..8
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());
    echo
}
