// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// TCP连接 (Transport connection)
///
/// 一条连接 + 一把锁: 锁覆盖整个 "写请求 → 读完整应答" 过程,
/// 任何时刻最多一个请求在途。连接出现不可恢复的I/O错误后即失效,
/// 重连时创建新的 `Connection`, 不复用旧对象。
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, VisionError};
use crate::protocol::{
    read_frame_response, read_line, read_photo_response, write_command, Command, FrameMetadata,
    Reply, ServerStatus,
};

/// Read timeout used only for the best-effort `QUIT` during teardown
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

struct Link {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

pub struct Connection {
    peer: SocketAddr,
    link: Mutex<Option<Link>>,
    // second handle so a blocked reader can be unblocked without the link lock
    shutdown: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    /// 建立连接: 有界连接超时, 然后切换到较长的稳态读写超时并关闭Nagle。
    pub fn connect(addr: &str, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let connect_err = |source| VisionError::Connect {
            addr: addr.to_string(),
            source,
        };

        let candidates: Vec<SocketAddr> = addr.to_socket_addrs().map_err(connect_err)?.collect();
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        );

        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    let conn = Self::from_stream(stream, read_timeout).map_err(connect_err)?;
                    info!(peer = %conn.peer, "connected");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(connect_err(last_err))
    }

    fn from_stream(stream: TcpStream, read_timeout: Duration) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;

        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        let shutdown = stream.try_clone()?;

        Ok(Self {
            peer,
            link: Mutex::new(Some(Link {
                reader: BufReader::new(stream),
                writer,
            })),
            shutdown: Mutex::new(Some(shutdown)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Runs one full request/response cycle under the link lock. A fatal error
    /// tears the connection down before the lock is released.
    fn with_link<T>(&self, f: impl FnOnce(&mut Link) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.link);
        if !self.is_connected() {
            return Err(VisionError::NotConnected);
        }
        let link = guard.as_mut().ok_or(VisionError::NotConnected)?;

        let result = f(link);
        if let Err(ref e) = result {
            if e.is_fatal() {
                warn!(peer = %self.peer, error = %e, "connection lost");
                guard.take();
                self.close_socket();
            }
        }
        result
    }

    fn close_socket(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = lock(&self.shutdown).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// 发送文本命令并返回一行应答
    pub fn exchange(&self, cmd: Command) -> Result<String> {
        self.with_link(|link| {
            write_command(&mut link.writer, cmd)?;
            read_line(&mut link.reader)
        })
    }

    /// Sends a control command and classifies the reply. `ERR:` becomes
    /// `ProtocolMismatch`.
    pub fn command(&self, cmd: Command) -> Result<String> {
        let line = self.exchange(cmd)?;
        debug!(%cmd, reply = %line, "command");
        Reply::parse(&line).into_result(cmd)
    }

    /// `GET_FRAME` → (元数据, JPEG)
    pub fn request_frame(&self) -> Result<(FrameMetadata, Option<Vec<u8>>)> {
        self.request_frame_if(|| true)?.ok_or(VisionError::NotConnected)
    }

    /// Like [`request_frame`](Self::request_frame), but `ready` is checked
    /// after the link lock is taken; `Ok(None)` means nothing was sent.
    pub fn request_frame_if(
        &self,
        ready: impl FnOnce() -> bool,
    ) -> Result<Option<(FrameMetadata, Option<Vec<u8>>)>> {
        self.with_link(|link| {
            if !ready() {
                return Ok(None);
            }
            write_command(&mut link.writer, Command::GetFrame)?;
            let header = read_line(&mut link.reader)?;
            read_frame_response(&mut link.reader, &header).map(Some)
        })
    }

    /// `TAKE_PHOTO` → JPEG; `None` 表示拍照失败
    pub fn request_photo(&self) -> Result<Option<Vec<u8>>> {
        self.with_link(|link| {
            write_command(&mut link.writer, Command::TakePhoto)?;
            let header = read_line(&mut link.reader)?;
            read_photo_response(&mut link.reader, &header)
        })
    }

    pub fn status(&self) -> Result<ServerStatus> {
        let line = self.exchange(Command::Status)?;
        ServerStatus::parse(&line)
    }

    /// 断开连接, 从不失败。
    ///
    /// Sends `QUIT` if the link is idle and discards the reply, then closes the
    /// socket. If another thread is mid-exchange the `QUIT` is skipped and the
    /// shutdown makes its blocked read fail instead.
    pub fn disconnect(&self) {
        match self.link.try_lock() {
            Ok(mut guard) => {
                if let Some(link) = guard.as_mut() {
                    if self.is_connected() {
                        let _ = link.writer.set_read_timeout(Some(QUIT_TIMEOUT));
                        let bye = write_command(&mut link.writer, Command::Quit)
                            .and_then(|_| read_line(&mut link.reader));
                        debug!(reply = ?bye.ok(), "quit");
                    }
                }
                guard.take();
            }
            Err(TryLockError::WouldBlock) => {
                debug!(peer = %self.peer, "link busy, closing without QUIT");
            }
            Err(TryLockError::Poisoned(p)) => {
                p.into_inner().take();
            }
        }

        if self.is_connected() {
            info!(peer = %self.peer, "disconnected");
        }
        self.close_socket();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_socket();
    }
}
