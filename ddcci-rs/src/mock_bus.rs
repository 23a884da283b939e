/* Mock I2C bus for protocol tests: records every write, replays a queue
 * of canned reads.  An i2c bus read always "succeeds" for the full
 * requested length, so replies shorter than the buffer are zero-padded
 * the way a real read of a quiet bus comes back. */

use std::collections::VecDeque;

use nix::errno::Errno;

pub(crate) enum MockAction {
    Reply(Vec<u8>),
    Error(Errno),
}

#[allow(dead_code)]
pub(crate) struct MockBus {
    pub bus_no: u8,
    pub addr: Option<u16>,
    pub writes: Vec<(u16, Vec<u8>)>,
    reads: VecDeque<MockAction>,
}

impl MockBus {
    pub fn new(bus_no: u8) -> Self {
        MockBus { bus_no, addr: None, writes: Vec::new(), reads: VecDeque::new() }
    }

    pub fn push_reply(&mut self, bytes: Vec<u8>) {
        self.reads.push_back(MockAction::Reply(bytes));
    }

    pub fn push_error(&mut self, errno: Errno) {
        self.reads.push_back(MockAction::Error(errno));
    }

    /* Queue the same reply n times. */
    pub fn push_reply_times(&mut self, bytes: Vec<u8>, n: usize) {
        for _ in 0..n {
            self.push_reply(bytes.clone());
        }
    }

    pub fn record_write(&mut self, addr: u16, data: &[u8]) -> Result<(), Errno> {
        self.addr = Some(addr);
        self.writes.push((addr, data.to_vec()));
        Ok(())
    }

    pub fn replay_read(&mut self, addr: u16, buf: &mut [u8]) -> Result<usize, Errno> {
        self.addr = Some(addr);
        match self.reads.pop_front() {
            Some(MockAction::Reply(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                for b in &mut buf[n..] {
                    *b = 0;
                }
                Ok(buf.len())
            }
            Some(MockAction::Error(errno)) => Err(errno),
            /* An exhausted script means the test asked for more exchanges
             * than it staged; fail loudly rather than replaying zeros. */
            None => Err(Errno::ENXIO),
        }
    }

    /* Writes sent to the DDC command address, ignoring EDID traffic. */
    pub fn ddc_writes(&self) -> Vec<&[u8]> {
        self.writes
            .iter()
            .filter(|(addr, _)| *addr == crate::packet::I2C_ADDR_DDC_CI)
            .map(|(_, data)| data.as_slice())
            .collect()
    }
}
