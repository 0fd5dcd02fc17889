//! PTY 管理器
//!
//! 处理会话的连接、输入、调整大小和断开连接。所有 PTY 句柄都登记在共享的
//! 会话注册表中，输出由 [`OutputForwarder`](super::output::OutputForwarder) 统一转发。

use std::sync::{Arc, Mutex, PoisonError};

use crate::rpc::server::NotificationSender;
use crate::rpc::types::WindowSize;
use crate::utils::error::TerminalError;

use super::command::LaunchConfig;
use super::local::{lock_writer, LocalPty};
use super::output::{
    start_output_forwarder, wake_channel, ForwarderConfig, ForwarderWaker, OutputForwarderHandle,
    WakeReceiver,
};
use super::registry::{lock_registry, SessionRegistry, SharedRegistry};
use super::session::{SessionId, SessionInfo};

/// 断开连接时写入的中断字符（Ctrl-C）
const INTERRUPT: u8 = 0x03;

/// 连接结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// 新启动了子进程
    Started { pid: u32 },
    /// 会话已经连接，沿用原来的子进程
    AlreadyActive { pid: u32 },
}

impl ConnectOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Started { pid } | Self::AlreadyActive { pid } => *pid,
        }
    }

    pub fn already_active(&self) -> bool {
        matches!(self, Self::AlreadyActive { .. })
    }
}

/// PTY 管理器
#[derive(Clone)]
pub struct PtyManager {
    registry: SharedRegistry,
    config: Arc<LaunchConfig>,
    notification_sender: NotificationSender,
    waker: ForwarderWaker,
    wake_rx: Arc<Mutex<Option<WakeReceiver>>>,
}

impl PtyManager {
    /// 创建新的 PTY 管理器
    ///
    /// 启动配置在此固定，之后所有会话都使用同一条命令。
    pub fn new(
        config: LaunchConfig,
        notification_sender: NotificationSender,
    ) -> Result<Self, TerminalError> {
        let (waker, wake_rx) = wake_channel()?;
        Ok(Self {
            registry: Arc::new(Mutex::new(SessionRegistry::with_waker(waker.clone()))),
            config: Arc::new(config),
            notification_sender,
            waker,
            wake_rx: Arc::new(Mutex::new(Some(wake_rx))),
        })
    }

    /// 使用 `/bin/sh` 的管理器（用于测试）
    #[cfg(test)]
    pub fn for_tests(notification_sender: NotificationSender) -> Result<Self, TerminalError> {
        use super::command::CommandVector;
        Self::new(
            LaunchConfig::new(CommandVector::new("/bin/sh", Vec::new())),
            notification_sender,
        )
    }

    /// 启动输出转发器，每个管理器只能启动一次
    pub fn start_forwarder(&self) -> Result<OutputForwarderHandle, TerminalError> {
        let wake_rx = self
            .wake_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TerminalError::InvalidRequest("输出转发器已经启动".to_string()))?;

        Ok(start_output_forwarder(
            self.registry.clone(),
            self.notification_sender.clone(),
            wake_rx,
            self.waker.clone(),
            ForwarderConfig::default(),
        ))
    }

    /// 连接会话
    ///
    /// 已连接的会话直接返回原来的 pid，已结束的会话返回错误。子进程在锁外启动；
    /// 若并发的连接请求抢先完成注册，新启动的进程会被终止。
    pub async fn connect(&self, session_id: &SessionId) -> Result<ConnectOutcome, TerminalError> {
        {
            let registry = lock_registry(&self.registry);
            if let Some(pid) = registry.lookup_pid(session_id) {
                tracing::debug!("会话已连接，忽略重复连接: {}", session_id);
                return Ok(ConnectOutcome::AlreadyActive { pid });
            }
            if registry.is_terminated(session_id) {
                tracing::debug!("拒绝重新连接已结束的会话: {}", session_id);
                return Err(TerminalError::SessionTerminated(session_id.clone()));
            }
        }

        let config = self.config.clone();
        let pty = tokio::task::spawn_blocking(move || LocalPty::spawn(&config))
            .await
            .map_err(|e| TerminalError::launch("spawn", e))??;
        let fd = pty.master_fd();
        let pid = pty.pid();

        let raced = {
            let mut registry = lock_registry(&self.registry);
            match registry.lookup_pid(session_id) {
                Some(existing) => Some((existing, pty)),
                None => {
                    registry.register(session_id.clone(), fd, pid, pty)?;
                    None
                }
            }
        };

        if let Some((existing, pty)) = raced {
            tracing::debug!("会话 {} 已被并发连接，丢弃新进程 pid={}", session_id, pid);
            let _ = tokio::task::spawn_blocking(move || pty.terminate()).await;
            return Ok(ConnectOutcome::AlreadyActive { pid: existing });
        }

        tracing::info!(
            "会话已连接: {} (pid={}, 命令: {})",
            session_id,
            pid,
            self.config.command.display()
        );
        Ok(ConnectOutcome::Started { pid })
    }

    /// 把输入原样写入会话的 PTY
    ///
    /// 写入在注册表锁之外进行，PTY 输入缓冲区满时等待子进程读取，不丢弃数据。
    /// 会话不存在时忽略，返回 `false`。
    pub async fn input(&self, session_id: &SessionId, data: &[u8]) -> bool {
        let writer = {
            let registry = lock_registry(&self.registry);
            match registry.get(session_id) {
                Some(entry) => entry.process.writer(),
                None => {
                    tracing::debug!("忽略发往未连接会话的输入: {}", session_id);
                    return false;
                }
            }
        };

        let data = data.to_vec();
        let len = data.len();
        let result =
            tokio::task::spawn_blocking(move || lock_writer(&writer).write_all(&data)).await;
        match result {
            Ok(Ok(())) => tracing::trace!("发送输入到会话 {}: {} bytes", session_id, len),
            Ok(Err(e)) => tracing::warn!("写入 PTY 失败: {} ({})", session_id, e),
            Err(e) => tracing::warn!("写入任务失败: {} ({})", session_id, e),
        }
        true
    }

    /// 调整会话窗口大小
    ///
    /// 在持锁期间通过会话自己的 master 调整，不会落到复用了同一 fd 号的其他会话上。
    pub fn resize(&self, session_id: &SessionId, size: WindowSize) -> bool {
        let registry = lock_registry(&self.registry);
        let Some(entry) = registry.get(session_id) else {
            tracing::debug!("忽略未连接会话的调整大小请求: {}", session_id);
            return false;
        };

        if let Err(e) = entry.process.resize(size) {
            tracing::warn!("调整窗口大小失败: {} ({})", session_id, e);
        } else {
            tracing::debug!("调整会话 {} 大小: {}x{}", session_id, size.cols, size.rows);
        }
        true
    }

    /// 断开会话
    ///
    /// 先写入 Ctrl-C 让 shell 有机会退出，再强制终止并回收子进程。重复调用返回 `false`。
    pub async fn disconnect(&self, session_id: &SessionId) -> bool {
        let Some(entry) = lock_registry(&self.registry).unregister(session_id) else {
            tracing::debug!("会话未连接，无需断开: {}", session_id);
            return false;
        };

        let pid = entry.pid;
        let process = entry.process;
        let result = tokio::task::spawn_blocking(move || {
            // 仍有输入在写时不再追加中断字符
            let writer = process.writer();
            if let Ok(mut writer) = writer.try_lock() {
                if let Err(e) = writer.try_write(&[INTERRUPT]) {
                    tracing::debug!("写入中断字符失败: pid={} ({})", pid, e);
                }
            }
            process.terminate();
        })
        .await;
        if let Err(e) = result {
            tracing::warn!("回收子进程任务失败: {} ({})", session_id, e);
        }

        tracing::info!("会话已断开: {} (pid={})", session_id, pid);
        true
    }

    /// 获取会话信息
    pub fn info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let registry = lock_registry(&self.registry);
        let entry = registry.get(session_id)?;
        let size = entry.process.size().ok();
        Some(SessionInfo {
            session_id: session_id.clone(),
            pid: entry.pid,
            rows: size.map(|s| s.rows),
            cols: size.map(|s| s.cols),
            connected_at: entry.connected_at,
        })
    }

    /// 列出所有会话
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = lock_registry(&self.registry).sessions();
        sessions.iter().filter_map(|id| self.info(id)).collect()
    }

    /// 获取会话数量
    pub fn session_count(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    /// 共享的会话注册表
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// 断开所有会话
    pub async fn shutdown(&self) {
        let sessions = lock_registry(&self.registry).sessions();
        if !sessions.is_empty() {
            tracing::info!("关闭 {} 个会话", sessions.len());
        }
        for session_id in sessions {
            self.disconnect(&session_id).await;
        }
    }
}
