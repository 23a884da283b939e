/* Raw I2C transaction layer over an open /dev/i2c-N fd.
 *
 * Two interchangeable strategies: IOCTL drives I2C_RDWR message arrays
 * (the kernel emits the repeated-START for combined transfers); FILEIO
 * sets the slave with I2C_SLAVE and uses plain read/write syscalls.
 * No retries happen here; failures surface as raw errno. */

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use nix::errno::Errno;
use nix::libc;
use tracing::{debug, warn};

/* i2c-dev ioctl requests, from linux/i2c-dev.h. */
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_RDWR: libc::c_ulong = 0x0707;

/* i2c_msg.flags */
const I2C_M_RD: u16 = 0x0001;

/* Read by the kernel, not by us. */
#[repr(C)]
#[allow(dead_code)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
#[allow(dead_code)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/* How DDC transactions reach the kernel. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cIoStrategy {
    Ioctl,
    Fileio,
}

static IO_STRATEGY: AtomicU8 = AtomicU8::new(0);

pub fn set_i2c_io_strategy(strategy: I2cIoStrategy) {
    let v = match strategy {
        I2cIoStrategy::Ioctl => 0,
        I2cIoStrategy::Fileio => 1,
    };
    IO_STRATEGY.store(v, Ordering::Relaxed);
}

pub fn i2c_io_strategy() -> I2cIoStrategy {
    match IO_STRATEGY.load(Ordering::Relaxed) {
        0 => I2cIoStrategy::Ioctl,
        _ => I2cIoStrategy::Fileio,
    }
}

/* ---------------------------------------------------------------------- */
/* IO event statistics                                                    */
/* ---------------------------------------------------------------------- */

#[derive(Debug, Clone, Copy)]
pub enum IoEventKind {
    Write,
    Read,
    Ioctl,
}

static WRITE_COUNT: AtomicU64 = AtomicU64::new(0);
static READ_COUNT: AtomicU64 = AtomicU64::new(0);
static IOCTL_COUNT: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);
static TOTAL_NANOS: AtomicU64 = AtomicU64::new(0);

/* Counters are read without locking; tearing across fields is acceptable
 * for display purposes. */
#[derive(Debug, Clone, Copy, Default)]
pub struct IoStatsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub ioctls: u64,
    pub errors: u64,
    pub total_nanos: u64,
}

pub fn io_stats() -> IoStatsSnapshot {
    IoStatsSnapshot {
        writes: WRITE_COUNT.load(Ordering::Relaxed),
        reads: READ_COUNT.load(Ordering::Relaxed),
        ioctls: IOCTL_COUNT.load(Ordering::Relaxed),
        errors: ERROR_COUNT.load(Ordering::Relaxed),
        total_nanos: TOTAL_NANOS.load(Ordering::Relaxed),
    }
}

pub(crate) fn reset_io_stats() {
    WRITE_COUNT.store(0, Ordering::Relaxed);
    READ_COUNT.store(0, Ordering::Relaxed);
    IOCTL_COUNT.store(0, Ordering::Relaxed);
    ERROR_COUNT.store(0, Ordering::Relaxed);
    TOTAL_NANOS.store(0, Ordering::Relaxed);
}

fn record_io_event(kind: IoEventKind, location: &'static str, start: Instant, failed: bool) {
    let elapsed = start.elapsed().as_nanos() as u64;
    match kind {
        IoEventKind::Write => WRITE_COUNT.fetch_add(1, Ordering::Relaxed),
        IoEventKind::Read => READ_COUNT.fetch_add(1, Ordering::Relaxed),
        IoEventKind::Ioctl => IOCTL_COUNT.fetch_add(1, Ordering::Relaxed),
    };
    if failed {
        ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
    }
    TOTAL_NANOS.fetch_add(elapsed, Ordering::Relaxed);
    debug!("io event {kind:?} at {location}: {elapsed} ns");
}

/* ---------------------------------------------------------------------- */
/* Bus handle                                                             */
/* ---------------------------------------------------------------------- */

/* An open I2C bus.  The Mock variant records writes and replays canned
 * reads for the protocol tests. */
pub(crate) enum BusIo {
    I2c(I2cDev),
    #[cfg(test)]
    Mock(crate::mock_bus::MockBus),
}

pub(crate) struct I2cDev {
    file: File,
    bus_no: u8,
    strategy: I2cIoStrategy,
    slave: Option<u16>,
}

impl BusIo {
    pub fn open(bus_no: u8) -> Result<Self, Errno> {
        let path = format!("/dev/i2c-{bus_no}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
        debug!("opened {path}");
        Ok(BusIo::I2c(I2cDev { file, bus_no, strategy: i2c_io_strategy(), slave: None }))
    }

    pub fn set_addr(&mut self, addr: u16) -> Result<(), Errno> {
        match self {
            BusIo::I2c(dev) => dev.set_addr(addr),
            #[cfg(test)]
            BusIo::Mock(mock) => {
                mock.addr = Some(addr);
                Ok(())
            }
        }
    }

    pub fn write_bytes(&mut self, addr: u16, data: &[u8]) -> Result<(), Errno> {
        debug!("TX @{addr:#04x} {} bytes: {:02x?}", data.len(), data);
        match self {
            BusIo::I2c(dev) => match dev.strategy {
                I2cIoStrategy::Ioctl => dev.rdwr_write(addr, data),
                I2cIoStrategy::Fileio => {
                    dev.set_addr(addr)?;
                    dev.fileio_write(data)
                }
            },
            #[cfg(test)]
            BusIo::Mock(mock) => mock.record_write(addr, data),
        }
    }

    pub fn read_bytes(&mut self, addr: u16, buf: &mut [u8]) -> Result<usize, Errno> {
        let n = match self {
            BusIo::I2c(dev) => match dev.strategy {
                I2cIoStrategy::Ioctl => dev.rdwr_read(addr, buf)?,
                I2cIoStrategy::Fileio => {
                    dev.set_addr(addr)?;
                    dev.fileio_read(buf)?
                }
            },
            #[cfg(test)]
            BusIo::Mock(mock) => mock.replay_read(addr, buf)?,
        };
        debug!("RX @{addr:#04x} {} bytes: {:02x?}", n, &buf[..n]);
        Ok(n)
    }

    /* Combined write-then-read.  The IOCTL strategy issues both messages
     * in a single I2C_RDWR transaction; FILEIO falls back to the two
     * separate syscalls. */
    pub fn write_then_read(
        &mut self,
        addr: u16,
        data: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Errno> {
        match self {
            BusIo::I2c(dev) if dev.strategy == I2cIoStrategy::Ioctl => {
                debug!("TX+RX @{addr:#04x} {} bytes out: {:02x?}", data.len(), data);
                let n = dev.rdwr_write_read(addr, data, buf)?;
                debug!("RX @{addr:#04x} {} bytes: {:02x?}", n, &buf[..n]);
                Ok(n)
            }
            _ => {
                self.write_bytes(addr, data)?;
                self.read_bytes(addr, buf)
            }
        }
    }
}

impl I2cDev {
    fn set_addr(&mut self, addr: u16) -> Result<(), Errno> {
        if self.slave == Some(addr) {
            return Ok(());
        }
        let start = Instant::now();
        /* SAFETY: the fd is a live i2c-dev descriptor owned by `file`;
         * I2C_SLAVE takes the address as the third argument by value. */
        let res =
            unsafe { libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE, addr as libc::c_ulong) };
        record_io_event(IoEventKind::Ioctl, "set_addr", start, res < 0);
        if res < 0 {
            return Err(Errno::last());
        }
        self.slave = Some(addr);
        Ok(())
    }

    fn fileio_write(&mut self, data: &[u8]) -> Result<(), Errno> {
        let start = Instant::now();
        /* SAFETY: `data` is a live slice for the duration of the call. */
        let res = unsafe {
            libc::write(self.file.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len())
        };
        record_io_event(IoEventKind::Write, "fileio_write", start, res < 0);
        if res < 0 {
            return Err(Errno::last());
        }
        if res as usize != data.len() {
            return Err(Errno::EIO);
        }
        Ok(())
    }

    fn fileio_read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        let start = Instant::now();
        /* SAFETY: `buf` is a live mutable slice; the kernel writes at
         * most `buf.len()` bytes. */
        let res = unsafe {
            libc::read(self.file.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        record_io_event(IoEventKind::Read, "fileio_read", start, res < 0);
        if res < 0 {
            return Err(Errno::last());
        }
        Ok(res as usize)
    }

    fn rdwr_write(&mut self, addr: u16, data: &[u8]) -> Result<(), Errno> {
        let mut msg = I2cMsg {
            addr,
            flags: 0,
            len: data.len() as u16,
            buf: data.as_ptr() as *mut u8,
        };
        self.rdwr_transfer(std::slice::from_mut(&mut msg), "rdwr_write")?;
        Ok(())
    }

    fn rdwr_read(&mut self, addr: u16, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut msg =
            I2cMsg { addr, flags: I2C_M_RD, len: buf.len() as u16, buf: buf.as_mut_ptr() };
        self.rdwr_transfer(std::slice::from_mut(&mut msg), "rdwr_read")?;
        Ok(buf.len())
    }

    fn rdwr_write_read(
        &mut self,
        addr: u16,
        data: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Errno> {
        let mut msgs = [
            I2cMsg { addr, flags: 0, len: data.len() as u16, buf: data.as_ptr() as *mut u8 },
            I2cMsg { addr, flags: I2C_M_RD, len: buf.len() as u16, buf: buf.as_mut_ptr() },
        ];
        self.rdwr_transfer(&mut msgs, "rdwr_write_read")?;
        Ok(buf.len())
    }

    fn rdwr_transfer(&mut self, msgs: &mut [I2cMsg], location: &'static str) -> Result<(), Errno> {
        let mut request =
            I2cRdwrIoctlData { msgs: msgs.as_mut_ptr(), nmsgs: msgs.len() as u32 };
        let start = Instant::now();
        /* SAFETY: `request` and every message buffer outlive the call;
         * message lengths match their buffers. */
        let mut res = unsafe { libc::ioctl(self.file.as_raw_fd(), I2C_RDWR, &mut request) };
        if res < 0 && Errno::last() == Errno::EINVAL {
            /* Some nvidia driver versions reject the first I2C_RDWR on a
             * bus with EINVAL and accept an immediate identical retry. */
            warn!("I2C_RDWR returned EINVAL on /dev/i2c-{}, retrying once", self.bus_no);
            res = unsafe { libc::ioctl(self.file.as_raw_fd(), I2C_RDWR, &mut request) };
        }
        record_io_event(IoEventKind::Ioctl, location, start, res < 0);
        if res < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}
