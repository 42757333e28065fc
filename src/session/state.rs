//! Session stage machine and wire bookkeeping
//!
//! A connection moves strictly forward:
//!
//! ```text
//! server: HandshakeStart → HandshakeDone → CommandDone → SessionDone
//! client: ClientConnect → HandshakeStart → HandshakeDone → CommandDone → SessionDone
//! ```
//!
//! CommandDone is reached when a publish or play (or, client side, the
//! full connect/createStream/play exchange) succeeds; SessionDone is
//! terminal and triggers teardown.

/// Connection lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Client role only: dialing upstream
    ClientConnect,
    /// Handshake bytes in flight
    HandshakeStart,
    /// Handshake complete, commands flowing
    HandshakeDone,
    /// A publish/play succeeded; media flowing
    CommandDone,
    /// Terminal
    SessionDone,
}

/// Role and wire bookkeeping for one session
#[derive(Debug)]
pub struct SessionState {
    pub id: u64,
    pub stage: Stage,
    pub is_server: bool,
    pub is_publish: bool,
    pub is_play: bool,

    /// Bytes read since the last acknowledgement
    ackn: u64,
    /// Peer's declared window; 0 disables acks
    pub read_ack_size: u32,

    /// Last AMF0 transaction id seen
    pub transaction_id: f64,
    /// Message stream id for a/v on this connection
    pub av_stream_id: u32,
    next_stream_id: u32,
}

impl SessionState {
    pub fn new_server(id: u64) -> Self {
        Self {
            id,
            stage: Stage::HandshakeStart,
            is_server: true,
            is_publish: false,
            is_play: false,
            ackn: 0,
            read_ack_size: 0,
            transaction_id: 0.0,
            av_stream_id: 0,
            next_stream_id: 1,
        }
    }

    pub fn new_client(id: u64) -> Self {
        Self { stage: Stage::ClientConnect, is_server: false, ..Self::new_server(id) }
    }

    pub fn is_closed(&self) -> bool {
        self.stage == Stage::SessionDone
    }

    /// Advance the stage; never moves backwards
    pub fn advance(&mut self, stage: Stage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    pub fn close(&mut self) {
        self.stage = Stage::SessionDone;
    }

    /// Allocate a message stream id for createStream
    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Count inbound bytes; true when an acknowledgement is due
    pub fn add_bytes_received(&mut self, n: u64) -> bool {
        self.ackn += n;
        self.read_ack_size != 0 && self.ackn > self.read_ack_size as u64
    }

    /// Sequence number to put in the acknowledgement; resets the counter
    pub fn take_ack(&mut self) -> u32 {
        let n = self.ackn as u32;
        self.ackn = 0;
        n
    }

    pub fn start_publish(&mut self, stream_id: u32) {
        self.is_publish = true;
        self.av_stream_id = stream_id;
        self.advance(Stage::CommandDone);
    }

    pub fn start_play(&mut self, stream_id: u32) {
        self.is_play = true;
        self.av_stream_id = stream_id;
        self.advance(Stage::CommandDone);
    }
}
