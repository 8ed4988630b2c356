use crate::transport::Transport;

/// Default maximum frame size, fitting a datagram into a typical Ethernet MTU.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Packs newline-terminated lines into frames of bounded size.
///
/// Lines are written in pieces with [`write`](Self::write) and terminated with
/// [`write_line_break`](Self::write_line_break). A frame is sent whenever the next piece would
/// make the buffer reach the maximum size, and on [`flush`](Self::flush). Sent frames never
/// exceed the maximum size and always end with a complete line. A line that does not fit into a
/// frame on its own is dropped.
///
/// Transport errors are logged and the affected frame is dropped.
#[derive(Debug)]
pub struct PacketBatcher<T> {
    transport: T,
    buffer: Vec<u8>,
    max_size: usize,
    /// End of the last complete line in `buffer`.
    complete: usize,
    failing: bool,
}

impl<T: Transport> PacketBatcher<T> {
    /// Creates a batcher sending frames of at most `max_size` bytes.
    pub fn new(transport: T, max_size: usize) -> Self {
        Self {
            transport,
            buffer: Vec::with_capacity(max_size),
            max_size,
            complete: 0,
            failing: false,
        }
    }

    /// The maximum size of a frame.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Appends bytes to the current line.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.buffer.len() + bytes.len() >= self.max_size {
            self.flush();
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Terminates the current line.
    pub fn write_line_break(&mut self) {
        if self.buffer.len() + 1 >= self.max_size {
            self.flush();
        }
        self.buffer.push(b'\n');

        let line_len = self.buffer.len() - self.complete;
        if line_len > self.max_size {
            tally_log::debug!(
                line_len,
                max_size = self.max_size,
                "dropping metric line larger than the maximum packet size"
            );
            self.buffer.truncate(self.complete);
        } else {
            self.complete = self.buffer.len();
        }
    }

    /// Sends all complete lines.
    ///
    /// An incomplete trailing line stays in the buffer.
    pub fn flush(&mut self) {
        if self.complete == 0 {
            return;
        }

        let result = self.transport.send(&self.buffer[..self.complete]);
        match result {
            Ok(()) => self.failing = false,
            Err(error) if !self.failing => {
                self.failing = true;
                tally_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to send metrics"
                );
            }
            Err(error) => {
                tally_log::debug!(
                    error = &error as &dyn std::error::Error,
                    "failed to send metrics"
                );
            }
        }

        self.buffer.drain(..self.complete);
        self.complete = 0;
    }

    /// Returns a reference to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}
