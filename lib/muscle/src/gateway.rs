use crate::buffer::{ByteQueue, IngressOutcome};
use crate::message::{Message, MessageRef, TYPE_RAW};
use crate::pool::ObjectPool;
use crate::support::{Error, Result};
use crate::wire::{self, FRAME_HEADER_SIZE, FRAME_MAGIC};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;
use std::io;

/// What-code of messages synthesized by the raw pass-through gateway.
pub const RAW_DATA: u32 = crate::message::fourcc(*b"rawd");
/// Field carrying the raw bytes in a `RAW_DATA` message.
pub const RAW_DATA_FIELD: &str = "data";

/// Per-connection limits and queueing policy.
#[derive(Debug, Clone, Copy)]
pub struct GatewayPolicy {
    /// Largest acceptable incoming frame body. Oversize headers fault the
    /// connection.
    pub max_incoming_size: u32,
    /// Byte cap on queued outgoing messages.
    pub max_outgoing_bytes: usize,
    /// When the cap is hit: drop the oldest queued updates (true) or report
    /// overflow so the session gets disconnected (false).
    pub drop_oldest: bool,
}

impl Default for GatewayPolicy {
    fn default() -> GatewayPolicy {
        GatewayPolicy {
            max_incoming_size: 4 * 1024 * 1024,
            max_outgoing_bytes: 4 * 1024 * 1024,
            drop_oldest: false,
        }
    }
}

/// Per-connection codec between the byte stream and messages. Implementations
/// must tolerate arbitrary short reads and partial writes.
pub trait Gateway {
    /// Pulls all available bytes off the reader.
    fn receive(&mut self, reader: &mut dyn io::Read) -> Result<IngressOutcome>;

    /// Decodes the next complete message, `Err(Wait)` when more bytes are
    /// needed. After a fault every call reports `BadData`.
    fn next_message(&mut self) -> Result<MessageRef>;

    /// Queues a message for transmission, enforcing the outgoing byte cap.
    fn enqueue(&mut self, msg: MessageRef) -> Result<()>;

    /// Writes queued data until done or the writer would block.
    fn flush(&mut self, writer: &mut dyn io::Write) -> Result<usize>;

    fn has_output(&self) -> bool;

    fn pending_output_bytes(&self) -> usize;

    fn policy_mut(&mut self) -> &mut GatewayPolicy;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DecodeState {
    AwaitHeader,
    AwaitBody { body_size: usize },
    Fault,
}

/// Length-prefixed message framing:
/// `u32 body_size`, `u32 magic`, then the flattened message.
pub struct MessageGateway {
    policy: GatewayPolicy,
    incoming: ByteQueue,
    state: DecodeState,

    // Messages waiting to be encoded, plus their total flattened size
    out_msgs: VecDeque<MessageRef>,
    out_msg_bytes: usize,
    // Encoded bytes in flight
    staged: ByteQueue,

    pool: ObjectPool<Message>,
}

impl MessageGateway {
    pub fn new(policy: GatewayPolicy, pool: ObjectPool<Message>) -> MessageGateway {
        MessageGateway {
            policy,
            incoming: ByteQueue::new(),
            state: DecodeState::AwaitHeader,
            out_msgs: VecDeque::new(),
            out_msg_bytes: 0,
            staged: ByteQueue::new(),
            pool,
        }
    }

    /// Feeds raw bytes into the decoder directly. Tests and the loopback
    /// plumbing use this in place of `receive`.
    pub fn push_incoming(&mut self, bytes: &[u8]) {
        self.incoming.push_slice(bytes);
    }

    fn frame_size(msg: &MessageRef) -> usize {
        FRAME_HEADER_SIZE + wire::flattened_size(msg) as usize
    }

    fn stage_next(&mut self) -> bool {
        match self.out_msgs.pop_front() {
            Some(msg) => {
                let body_size = wire::flattened_size(&msg);
                self.out_msg_bytes -= Self::frame_size(&msg);

                let mut header = [0u8; FRAME_HEADER_SIZE];
                LittleEndian::write_u32(&mut header[0..4], body_size);
                LittleEndian::write_u32(&mut header[4..8], FRAME_MAGIC);
                self.staged.push_slice(&header);

                let mut body = Vec::with_capacity(body_size as usize);
                wire::flatten_into(&msg, &mut body);
                self.staged.push_slice(&body);

                true
            }
            None => false,
        }
    }
}

impl Gateway for MessageGateway {
    fn receive(&mut self, mut reader: &mut dyn io::Read) -> Result<IngressOutcome> {
        self.incoming.ingress(&mut reader).map_err(Into::into)
    }

    fn next_message(&mut self) -> Result<MessageRef> {
        loop {
            match self.state {
                DecodeState::Fault => return Err(Error::BadData),
                DecodeState::AwaitHeader => {
                    let mut header = [0u8; FRAME_HEADER_SIZE];

                    if !self.incoming.pop_exact(&mut header) {
                        return Err(Error::Wait);
                    }

                    let body_size = LittleEndian::read_u32(&header[0..4]);
                    let magic = LittleEndian::read_u32(&header[4..8]);

                    // A flattened message is at least 12 bytes
                    if magic != FRAME_MAGIC || body_size < 12 || body_size > self.policy.max_incoming_size
                    {
                        self.state = DecodeState::Fault;
                        return Err(Error::BadData);
                    }

                    self.state = DecodeState::AwaitBody {
                        body_size: body_size as usize,
                    };
                }
                DecodeState::AwaitBody { body_size } => {
                    if self.incoming.len() < body_size {
                        return Err(Error::Wait);
                    }

                    let mut body = vec![0u8; body_size];
                    self.incoming.pop_exact(&mut body);

                    self.state = DecodeState::AwaitHeader;

                    match wire::unflatten(&body) {
                        Ok(decoded) => {
                            return Ok(self.pool.obtain_with(|slot| *slot = decoded));
                        }
                        Err(_) => {
                            self.state = DecodeState::Fault;
                            return Err(Error::BadData);
                        }
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, msg: MessageRef) -> Result<()> {
        let size = Self::frame_size(&msg);

        if self.pending_output_bytes() + size > self.policy.max_outgoing_bytes {
            if !self.policy.drop_oldest {
                return Err(Error::OutOfMemory);
            }

            while !self.out_msgs.is_empty()
                && self.pending_output_bytes() + size > self.policy.max_outgoing_bytes
            {
                let dropped = self.out_msgs.pop_front().expect("Queue emptied mid-drain");
                self.out_msg_bytes -= Self::frame_size(&dropped);
            }
        }

        self.out_msg_bytes += size;
        self.out_msgs.push_back(msg);

        Ok(())
    }

    fn flush(&mut self, mut writer: &mut dyn io::Write) -> Result<usize> {
        let mut total = 0usize;

        loop {
            total += self.staged.egress(&mut writer)?;

            if !self.staged.is_empty() {
                // Writer is saturated; wait for writable readiness
                break;
            }

            if !self.stage_next() {
                break;
            }
        }

        Ok(total)
    }

    fn has_output(&self) -> bool {
        !self.staged.is_empty() || !self.out_msgs.is_empty()
    }

    fn pending_output_bytes(&self) -> usize {
        self.staged.len() + self.out_msg_bytes
    }

    fn policy_mut(&mut self) -> &mut GatewayPolicy {
        &mut self.policy
    }
}

/// Pass-through codec: inbound byte runs surface as `RAW_DATA` messages,
/// outbound messages are stripped back to their raw blobs.
pub struct RawGateway {
    policy: GatewayPolicy,
    incoming: ByteQueue,
    staged: ByteQueue,
    pool: ObjectPool<Message>,
}

impl RawGateway {
    pub fn new(policy: GatewayPolicy, pool: ObjectPool<Message>) -> RawGateway {
        RawGateway {
            policy,
            incoming: ByteQueue::new(),
            staged: ByteQueue::new(),
            pool,
        }
    }
}

impl Gateway for RawGateway {
    fn receive(&mut self, mut reader: &mut dyn io::Read) -> Result<IngressOutcome> {
        self.incoming.ingress(&mut reader).map_err(Into::into)
    }

    fn next_message(&mut self) -> Result<MessageRef> {
        if self.incoming.is_empty() {
            return Err(Error::Wait);
        }

        let mut bytes = vec![0u8; self.incoming.len()];
        self.incoming.pop_exact(&mut bytes);

        Ok(self.pool.obtain_with(|slot| {
            slot.set_what(RAW_DATA);
            slot.add_data(RAW_DATA_FIELD, TYPE_RAW, &bytes)
                .expect("Fresh message rejected a field");
        }))
    }

    fn enqueue(&mut self, msg: MessageRef) -> Result<()> {
        if let Ok(blobs) = msg.get_data(RAW_DATA_FIELD, TYPE_RAW) {
            let size: usize = blobs.iter().map(Vec::len).sum();

            if self.staged.len() + size > self.policy.max_outgoing_bytes {
                return Err(Error::OutOfMemory);
            }

            for blob in blobs {
                self.staged.push_slice(blob);
            }
        }

        Ok(())
    }

    fn flush(&mut self, mut writer: &mut dyn io::Write) -> Result<usize> {
        self.staged.egress(&mut writer).map_err(Into::into)
    }

    fn has_output(&self) -> bool {
        !self.staged.is_empty()
    }

    fn pending_output_bytes(&self) -> usize {
        self.staged.len()
    }

    fn policy_mut(&mut self) -> &mut GatewayPolicy {
        &mut self.policy
    }
}
