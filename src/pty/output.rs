//! PTY 输出转发器
//!
//! 一个后台任务轮询所有已注册的 PTY master fd，把可读的输出解码后通过
//! JSON-RPC 通知发送给所属会话。读取出错（通常是子进程退出）时就地清理会话。
//!
//! 注册表在注册/注销会话时通过唤醒通道通知转发器，新会话的输出不必等到
//! 下一次 poll 超时才被发现。

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::registry::{lock_registry, SharedRegistry};
use super::session::SessionId;
use crate::rpc::server::NotificationSender;
use crate::rpc::types::SessionStatus;

/// 单次读取的最大字节数
pub const MAX_READ_BYTES: usize = 20 * 1024;

/// poll 等待上限
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// poll 本身失败后的退避时间
const POLL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 输出转发器配置
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// 读取缓冲区大小
    pub buffer_size: usize,
    /// 等待 fd 可读的超时时间
    pub poll_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_size: MAX_READ_BYTES,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// 唤醒转发器的发送端，可克隆
#[derive(Debug, Clone)]
pub struct ForwarderWaker {
    tx: Arc<UnixStream>,
}

impl ForwarderWaker {
    pub fn wake(&self) {
        match (&*self.tx).write(&[1]) {
            Ok(_) => {}
            // 缓冲区已满说明已有未处理的唤醒
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::trace!("唤醒输出转发器失败: {}", e),
        }
    }
}

/// 唤醒通道的接收端，由转发器独占
#[derive(Debug)]
pub struct WakeReceiver {
    rx: UnixStream,
}

impl WakeReceiver {
    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// 读空所有挂起的唤醒
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

/// 创建唤醒通道
pub fn wake_channel() -> io::Result<(ForwarderWaker, WakeReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((ForwarderWaker { tx: Arc::new(tx) }, WakeReceiver { rx }))
}

/// 等待任意 fd 可读，返回就绪的 fd
///
/// 挂断和错误也算就绪，由随后的读取来发现。超时或被信号中断时返回空列表。
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: pollfds 在调用期间有效，长度与传入的数量一致
    let result = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .filter(|p| p.revents != 0)
        .map(|p| p.fd)
        .collect())
}

/// 输出转发器
pub struct OutputForwarder {
    registry: SharedRegistry,
    notification_sender: NotificationSender,
    wake: WakeReceiver,
    stop: Arc<AtomicBool>,
    config: ForwarderConfig,
}

impl OutputForwarder {
    pub fn new(
        registry: SharedRegistry,
        notification_sender: NotificationSender,
        wake: WakeReceiver,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            registry,
            notification_sender,
            wake,
            stop: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// 运行直到收到停止请求
    pub fn run(mut self) {
        let mut buffer = vec![0u8; self.config.buffer_size];
        tracing::debug!("输出转发器启动");

        while !self.stop.load(Ordering::Acquire) {
            self.run_once(&mut buffer);
        }

        tracing::debug!("输出转发器退出");
    }

    /// 一轮迭代：等待可读，逐个转发
    pub fn run_once(&mut self, buffer: &mut [u8]) {
        let wake_fd = self.wake.fd();
        let mut fds = lock_registry(&self.registry).all_fds();
        fds.push(wake_fd);

        let ready = match wait_readable(&fds, self.config.poll_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("poll 失败: {}", e);
                std::thread::sleep(POLL_RETRY_DELAY);
                return;
            }
        };

        for fd in ready {
            if fd == wake_fd {
                self.wake.drain();
                continue;
            }
            self.forward(fd, buffer);
        }
    }

    /// 读取一个就绪 fd 并发送给所属会话
    fn forward(&mut self, fd: RawFd, buffer: &mut [u8]) {
        let mut registry = lock_registry(&self.registry);

        // poll 返回之后会话可能已被断开
        let Some(session_id) = registry.lookup_session(fd).cloned() else {
            tracing::trace!("fd {} 已不在注册表中，跳过", fd);
            return;
        };
        let Some(entry) = registry.get_mut(&session_id) else {
            return;
        };

        match entry.process.read(buffer) {
            Ok(0) => {
                drop(registry);
                self.teardown(&session_id, "EOF");
            }
            Ok(n) => {
                let output = entry.decoder.decode(&buffer[..n]);
                drop(registry);
                tracing::trace!("读取 PTY 输出: {} -> {} bytes", session_id, n);
                if !output.is_empty() {
                    self.emit_output(&session_id, &output);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(registry);
                tracing::debug!("读取 PTY 输出错误: {} ({})", session_id, e);
                self.teardown(&session_id, &e.to_string());
            }
        }
    }

    /// 子进程退出后清理会话
    ///
    /// 会话可能已经被断开连接的处理器注销，此时什么也不做。
    fn teardown(&self, session_id: &SessionId, reason: &str) {
        let Some(entry) = lock_registry(&self.registry).unregister(session_id) else {
            return;
        };

        let mut decoder = entry.decoder;
        let tail = decoder.finish();
        if !tail.is_empty() {
            self.emit_output(session_id, &tail);
        }

        entry.process.terminate();
        tracing::info!("会话结束: {} (pid={}, {})", session_id, entry.pid, reason);

        if let Err(e) =
            self.notification_sender
                .send_status(session_id, SessionStatus::Terminated, Some(reason))
        {
            tracing::debug!("发送状态通知失败: {}", e);
        }
    }

    fn emit_output(&self, session_id: &SessionId, output: &str) {
        if let Err(e) = self.notification_sender.send_output(session_id, output) {
            tracing::debug!("发送输出通知失败: {} ({})", session_id, e);
        }
    }
}

/// 输出转发器句柄
pub struct OutputForwarderHandle {
    stop: Arc<AtomicBool>,
    waker: ForwarderWaker,
    task_handle: Option<JoinHandle<()>>,
}

impl OutputForwarderHandle {
    /// 停止输出转发器并等待其退出
    pub async fn stop(mut self) {
        self.signal_stop();
        if let Some(task_handle) = self.task_handle.take() {
            let _ = task_handle.await;
        }
    }

    /// 检查任务是否已完成
    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

impl Drop for OutputForwarderHandle {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// 启动输出转发器
///
/// 在阻塞线程池中运行，`waker` 用于在停止时打断 poll。
pub fn start_output_forwarder(
    registry: SharedRegistry,
    notification_sender: NotificationSender,
    wake: WakeReceiver,
    waker: ForwarderWaker,
    config: ForwarderConfig,
) -> OutputForwarderHandle {
    let forwarder = OutputForwarder::new(registry, notification_sender, wake, config);
    let stop = forwarder.stop.clone();
    let task_handle = tokio::task::spawn_blocking(move || forwarder.run());

    OutputForwarderHandle {
        stop,
        waker,
        task_handle: Some(task_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::mpsc;

    use crate::pty::registry::SessionRegistry;

    #[test]
    fn test_wake_makes_receiver_readable() {
        let (waker, rx) = wake_channel().unwrap();

        let ready = wait_readable(&[rx.fd()], Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());

        waker.wake();
        waker.clone().wake();
        let ready = wait_readable(&[rx.fd()], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![rx.fd()]);

        rx.drain();
        let ready = wait_readable(&[rx.fd()], Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wait_readable_times_out() {
        let (_waker, rx) = wake_channel().unwrap();
        let started = Instant::now();
        let ready = wait_readable(&[rx.fd()], Duration::from_millis(50)).unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_readable_reports_closed_fd() {
        let (waker, rx) = wake_channel().unwrap();
        let fd = rx.fd();
        drop(waker);
        // 对端关闭后读取端立即就绪（读到 EOF）
        let ready = wait_readable(&[fd], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![fd]);
    }

    #[test]
    fn test_run_once_with_empty_registry_returns_on_wake() {
        let (waker, wake) = wake_channel().unwrap();
        let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::with_waker(waker.clone())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = ForwarderConfig {
            poll_timeout: Duration::from_secs(5),
            ..ForwarderConfig::default()
        };
        let mut forwarder =
            OutputForwarder::new(registry, NotificationSender::new_for_test(tx), wake, config);

        waker.wake();
        let started = Instant::now();
        let mut buffer = vec![0u8; 64];
        forwarder.run_once(&mut buffer);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_stop_ends_task() {
        let (waker, wake) = wake_channel().unwrap();
        let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::with_waker(waker.clone())));
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = start_output_forwarder(
            registry,
            NotificationSender::new_for_test(tx),
            wake,
            waker,
            ForwarderConfig::default(),
        );
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(3), handle.stop())
            .await
            .expect("forwarder should stop promptly");
    }

    #[test]
    fn test_default_config() {
        let config = ForwarderConfig::default();
        assert_eq!(config.buffer_size, 20 * 1024);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
    }
}
