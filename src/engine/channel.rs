//! Status channel between the attach engine and a controller process, plus the
//! loopback report used once the controller stopped listening on the channel.
//!
//! The channel is a 1024 byte shared memory block named after the debuggee's pid.
//! The controller creates and fills it, the engine reads connection parameters
//! from it and reports progress and errors back.

use crate::engine::error::{ConnError, Error};
use crate::engine::futex::{self, Scope};
use bytes::{BufMut, BytesMut};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::mem::{offset_of, size_of};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub const CHANNEL_SIZE: usize = 1024;
pub const SESSION_ID_SIZE: usize = 64;
pub const OPTIONS_SIZE: usize = 928;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Manual-reset event usable across processes.
#[repr(C, align(8))]
pub struct Event {
    word: AtomicU32,
    _pad: u32,
}

impl Event {
    pub fn set(&self) {
        self.word.store(1, Ordering::Release);
        futex::wake_all(&self.word, Scope::Shared);
    }

    pub fn is_set(&self) -> bool {
        self.word.load(Ordering::Acquire) != 0
    }

    /// Wait until set. Return false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_set() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex::wait(&self.word, 0, Some(deadline - now), Scope::Shared);
        }
        true
    }
}

/// Memory layout of the channel.
#[repr(C)]
pub struct StatusBlock {
    pub port: AtomicI32,
    _pad: u32,
    pub starting: Event,
    pub done: Event,
    pub error: AtomicI32,
    pub version: AtomicI32,
    pub session_id: [u8; SESSION_ID_SIZE],
    pub options: [u8; OPTIONS_SIZE],
}

const _: () = {
    assert!(size_of::<StatusBlock>() == CHANNEL_SIZE);
    assert!(offset_of!(StatusBlock, port) == 0);
    assert!(offset_of!(StatusBlock, starting) == 8);
    assert!(offset_of!(StatusBlock, done) == 16);
    assert!(offset_of!(StatusBlock, error) == 24);
    assert!(offset_of!(StatusBlock, version) == 28);
    assert!(offset_of!(StatusBlock, session_id) == 32);
    assert!(offset_of!(StatusBlock, options) == 96);
};

/// Null-terminated string of a fixed size buffer.
fn read_c_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Copy `s` into `buf` truncated so that a terminating null always fits.
fn write_c_str(buf: &mut [u8], s: &str) {
    let len = s.len().min(buf.len() - 1);
    buf[..len].copy_from_slice(&s.as_bytes()[..len]);
    buf[len..].fill(0);
}

/// Which side of the channel this process is.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Side {
    /// Attach engine, signals "done" on drop.
    Engine,
    /// Controller, removes the channel on drop.
    Controller,
}

pub struct StatusChannel {
    map: MmapMut,
    path: PathBuf,
    side: Side,
}

impl StatusChannel {
    /// Shared memory path of the channel for process `pid`.
    pub fn path_for(pid: u32) -> PathBuf {
        PathBuf::from(format!("/dev/shm/PythonDebuggerMemory{pid}"))
    }

    /// Open the channel of the current process, created by a controller.
    pub fn open(pid: u32) -> Result<Self, Error> {
        let path = Self::path_for(pid);
        if !path.exists() {
            return Err(Error::ChannelNotFound(pid as i32));
        }
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < CHANNEL_SIZE {
            return Err(Error::ChannelTooSmall(len));
        }
        Ok(Self {
            map: Self::map(&file)?,
            path: path.to_path_buf(),
            side: Side::Engine,
        })
    }

    /// Create the channel for process `pid` and fill connection parameters.
    pub fn create(pid: u32, port: i32, session_id: &str, options: &str) -> Result<Self, Error> {
        Self::create_at(&Self::path_for(pid), port, session_id, options)
    }

    pub fn create_at(
        path: &Path,
        port: i32,
        session_id: &str,
        options: &str,
    ) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(CHANNEL_SIZE as u64)?;

        let mut channel = Self {
            map: Self::map(&file)?,
            path: path.to_path_buf(),
            side: Side::Controller,
        };
        channel.map.fill(0);
        channel.block().port.store(port, Ordering::Release);
        let block = channel.block_mut();
        write_c_str(&mut block.session_id, session_id);
        write_c_str(&mut block.options, options);
        Ok(channel)
    }

    fn map(file: &File) -> Result<MmapMut, Error> {
        // SAFETY: the block is only accessed through atomics and fixed size buffers
        Ok(unsafe { MmapMut::map_mut(file)? })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block(&self) -> &StatusBlock {
        // SAFETY: mapping is page aligned and at least `CHANNEL_SIZE` bytes long
        unsafe { &*(self.map.as_ptr() as *const StatusBlock) }
    }

    fn block_mut(&mut self) -> &mut StatusBlock {
        // SAFETY: see `block`
        unsafe { &mut *(self.map.as_mut_ptr() as *mut StatusBlock) }
    }

    pub fn port(&self) -> i32 {
        self.block().port.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> String {
        read_c_str(&self.block().session_id)
    }

    pub fn options(&self) -> String {
        read_c_str(&self.block().options)
    }

    pub fn report(&self, error: ConnError) {
        self.block().error.store(error.code(), Ordering::Release);
    }

    pub fn error(&self) -> Option<ConnError> {
        ConnError::from_repr(self.block().error.load(Ordering::Acquire))
    }

    pub fn set_version(&self, wire: i32) {
        self.block().version.store(wire, Ordering::Release);
    }

    pub fn version(&self) -> i32 {
        self.block().version.load(Ordering::Acquire)
    }

    pub fn signal_starting(&self) {
        self.block().starting.set()
    }

    pub fn signal_done(&self) {
        self.block().done.set()
    }

    pub fn wait_starting(&self, timeout: Duration) -> Result<(), Error> {
        self.block()
            .starting
            .wait(timeout)
            .then_some(())
            .ok_or(Error::EventTimeout("starting"))
    }

    pub fn wait_done(&self, timeout: Duration) -> Result<(), Error> {
        self.block()
            .done
            .wait(timeout)
            .then_some(())
            .ok_or(Error::EventTimeout("done"))
    }
}

impl Drop for StatusChannel {
    fn drop(&mut self) {
        match self.side {
            Side::Engine => self.signal_done(),
            Side::Controller => {
                _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

/// Loopback report frame: `b'A'`, big-endian session id length, session id bytes,
/// big-endian error code.
pub fn encode_report(session_id: &str, error: ConnError) -> BytesMut {
    let id = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(1 + 8 + id.len() + 8);
    buf.put_u8(b'A');
    buf.put_u64(id.len() as u64);
    buf.put_slice(id);
    buf.put_u64(error.code() as u64);
    buf
}

/// Send an error to the controller listening on `127.0.0.1:port`.
pub fn send_report(port: i32, session_id: &str, error: ConnError) -> Result<(), Error> {
    let port = u16::try_from(port)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad port"))?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.write_all(&encode_report(session_id, error))?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pystalker-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_report_frame() {
        let frame = encode_report("abc", ConnError::TimeOut);
        let mut expected = vec![b'A'];
        expected.extend_from_slice(&3u64.to_be_bytes());
        expected.extend_from_slice(b"abc");
        expected.extend_from_slice(&6u64.to_be_bytes());
        assert_eq!(&frame[..], &expected[..]);

        let frame = encode_report("", ConnError::None);
        assert_eq!(frame.len(), 17);
    }

    #[test]
    fn test_controller_and_engine_sides() {
        let path = temp_path("sides");
        let controller = StatusChannel::create_at(&path, 5678, "session-1", "opt=1").unwrap();

        {
            let engine = StatusChannel::open_at(&path).unwrap();
            assert_eq!(engine.port(), 5678);
            assert_eq!(engine.session_id(), "session-1");
            assert_eq!(engine.options(), "opt=1");

            engine.set_version(0x0308);
            engine.report(ConnError::None);
            engine.signal_starting();
            assert!(!controller.block().done.is_set());
        }

        controller
            .wait_starting(Duration::from_millis(100))
            .unwrap();
        // engine side signals "done" when dropped
        controller.wait_done(Duration::from_millis(100)).unwrap();
        assert_eq!(controller.version(), 0x0308);
        assert_eq!(controller.error(), Some(ConnError::None));

        drop(controller);
        assert!(!path.exists());
    }

    #[test]
    fn test_event_wakes_waiter() {
        let path = temp_path("event");
        let controller = StatusChannel::create_at(&path, 1, "", "").unwrap();
        let engine = StatusChannel::open_at(&path).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| controller.wait_starting(Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(20));
            engine.signal_starting();
            waiter.join().unwrap().unwrap();
        });
        assert!(matches!(
            controller.wait_done(Duration::from_millis(10)),
            Err(Error::EventTimeout("done"))
        ));
    }

    #[test]
    fn test_long_parameters_are_truncated() {
        let path = temp_path("truncate");
        let long_id = "x".repeat(100);
        let controller = StatusChannel::create_at(&path, 1, &long_id, "").unwrap();
        assert_eq!(controller.session_id().len(), SESSION_ID_SIZE - 1);
    }

    #[test]
    fn test_too_small_channel() {
        let path = temp_path("small");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            StatusChannel::open_at(&path),
            Err(Error::ChannelTooSmall(16))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_send_report_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port() as i32;

        let reader = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            buf
        });
        send_report(port, "id", ConnError::SysNotFound).unwrap();

        let received = reader.join().unwrap();
        assert_eq!(received, encode_report("id", ConnError::SysNotFound).to_vec());
    }
}
