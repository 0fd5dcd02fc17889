//! 本地 PTY 实现
//!
//! 使用 portable-pty 分配伪终端并在 slave 端启动子进程。
//! master fd 设为非阻塞，由输出转发器统一 poll。

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::command::LaunchConfig;
use crate::rpc::types::WindowSize;
use crate::utils::error::TerminalError;

/// 等待 PTY 可写时单次 poll 的时长
const WRITE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// PTY 输入端
///
/// 持有 master fd 的独立副本，会话注销、master 关闭后 fd 号也不会被复用到别的会话。
#[derive(Debug)]
pub struct PtyWriter {
    file: File,
}

/// 可在注册表锁之外使用的输入端句柄
pub type SharedWriter = Arc<Mutex<PtyWriter>>;

impl PtyWriter {
    fn open(master_fd: RawFd) -> io::Result<Self> {
        // SAFETY: master_fd 由调用方持有的 MasterPty 保持打开
        let fd = unsafe { BorrowedFd::borrow_raw(master_fd) }.try_clone_to_owned()?;
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// 完整写入数据
    ///
    /// PTY 输入缓冲区满时等待子进程读取；PTY 关闭（子进程退出）时返回错误。
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.file.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(self.file.as_raw_fd())?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 尝试写入一次，缓冲区满时返回 `WouldBlock`，不等待
    pub fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }
}

/// 获取输入端锁
pub fn lock_writer(writer: &SharedWriter) -> MutexGuard<'_, PtyWriter> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 本地 PTY 实例
pub struct LocalPty {
    /// PTY master（持有期间 fd 保持打开）
    master: Box<dyn MasterPty + Send>,
    /// PTY reader
    reader: Box<dyn Read + Send>,
    /// PTY writer
    writer: SharedWriter,
    /// 子进程
    child: Box<dyn Child + Send + Sync>,
    master_fd: RawFd,
    pid: u32,
    reaped: bool,
}

impl std::fmt::Debug for LocalPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPty")
            .field("master_fd", &self.master_fd)
            .field("pid", &self.pid)
            .finish()
    }
}

impl LocalPty {
    /// 分配 PTY 并启动配置的命令
    pub fn spawn(config: &LaunchConfig) -> Result<Self, TerminalError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(config.initial_size))
            .map_err(|e| TerminalError::launch("openpty", e))?;

        let mut cmd = CommandBuilder::from_argv(
            config.command.argv().into_iter().map(Into::into).collect(),
        );
        if let Some(dir) = &config.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::launch("spawn", e))?;
        // 父进程不持有 slave，子进程退出后 master 读取才会报错
        drop(pair.slave);

        let mut pty = Self::assemble(pair.master, child)?;
        if let Err(e) = set_non_blocking(pty.master_fd) {
            pty.kill_and_reap();
            return Err(TerminalError::launch("O_NONBLOCK", e));
        }
        Ok(pty)
    }

    fn assemble(
        master: Box<dyn MasterPty + Send>,
        mut child: Box<dyn Child + Send + Sync>,
    ) -> Result<Self, TerminalError> {
        match open_handles(master.as_ref(), child.as_ref()) {
            Ok((master_fd, pid, reader, writer)) => Ok(Self {
                master,
                reader,
                writer: Arc::new(Mutex::new(writer)),
                child,
                master_fd,
                pid,
                reaped: false,
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// master 端 fd
    pub fn master_fd(&self) -> RawFd {
        self.master_fd
    }

    /// 子进程 pid
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// 读取可用输出（非阻塞，无数据时返回 `WouldBlock`）
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }

    /// 输入端句柄，写入可能阻塞，不要在注册表锁内使用
    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// 调整 PTY 大小
    pub fn resize(&self, size: WindowSize) -> Result<(), TerminalError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| TerminalError::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    /// 当前 PTY 大小
    pub fn size(&self) -> Result<WindowSize, TerminalError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| TerminalError::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        Ok(WindowSize {
            rows: size.rows,
            cols: size.cols,
            xpix: size.pixel_width,
            ypix: size.pixel_height,
        })
    }

    /// 强制终止子进程并回收
    ///
    /// 进程已经不存在不算错误。返回后 pid 不再存活。
    pub fn terminate(mut self) {
        self.kill_and_reap();
        tracing::debug!("子进程已回收: pid={}", self.pid);
    }

    fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        if let Err(e) = kill_pid(self.pid) {
            tracing::warn!("终止子进程失败 pid={}: {}", self.pid, e);
        }
        if let Err(e) = self.child.wait() {
            tracing::debug!("回收子进程失败 pid={}: {}", self.pid, e);
        }
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        self.kill_and_reap();
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.xpix,
        pixel_height: size.ypix,
    }
}

type PtyHandles = (RawFd, u32, Box<dyn Read + Send>, PtyWriter);

fn open_handles(
    master: &(dyn MasterPty + Send),
    child: &(dyn Child + Send + Sync),
) -> Result<PtyHandles, TerminalError> {
    let master_fd = master
        .as_raw_fd()
        .ok_or_else(|| TerminalError::launch("master fd", "不可用"))?;
    let pid = child
        .process_id()
        .ok_or_else(|| TerminalError::launch("pid", "不可用"))?;
    let reader = master
        .try_clone_reader()
        .map_err(|e| TerminalError::launch("reader", e))?;
    let writer = PtyWriter::open(master_fd).map_err(|e| TerminalError::launch("writer", e))?;
    Ok((master_fd, pid, reader, writer))
}

/// 向 pid 发送 SIGKILL，进程已不存在时视为成功
pub fn kill_pid(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|&pid| pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "无效的 pid"))?;
    // SAFETY: kill 不涉及内存访问
    let result = unsafe { libc::kill(pid, libc::SIGKILL) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// pid 对应的进程是否仍然存在
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: 信号 0 只做存在性检查
    unsafe { libc::kill(pid, 0) == 0 }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: 只读写 fd 的状态标志
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 等待 fd 可写，PTY 挂断时返回 `BrokenPipe`
fn wait_writable(fd: RawFd) -> io::Result<()> {
    let timeout_ms =
        libc::c_int::try_from(WRITE_POLL_INTERVAL.as_millis()).unwrap_or(libc::c_int::MAX);

    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };

        // SAFETY: pollfd 在调用期间有效
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            continue;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "PTY 已关闭"));
        }
        if pollfd.revents & libc::POLLOUT != 0 {
            return Ok(());
        }
    }
}
