//! 错误类型定义
//!
//! 定义 PTY 桥接服务的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 TerminalError 枚举，涵盖启动、注册和传输层的错误
//! - 实现错误转换（From trait）
//! - 支持转换为 JSON-RPC 错误格式
//!
//! PTY 读取失败、过期会话引用和重复连接不在此列：它们在发生处被就地处理，
//! 不会作为错误传到传输层。

use std::os::fd::RawFd;

use thiserror::Error;

use crate::pty::SessionId;
use crate::rpc::types::JsonRpcError;

/// 终端错误类型
#[derive(Debug, Error)]
pub enum TerminalError {
    /// PTY 或子进程创建失败
    #[error("PTY 创建失败: {0}")]
    PtyCreationFailed(String),

    /// 会话不存在
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    /// 会话已注册
    #[error("会话已注册: {0}")]
    DuplicateSession(SessionId),

    /// 会话已结束，不能再次连接
    #[error("会话已结束: {0}")]
    SessionTerminated(SessionId),

    /// 文件描述符已被其他会话占用
    #[error("文件描述符 {fd} 已属于会话 {owner}")]
    DuplicateFd { fd: RawFd, owner: SessionId },

    /// 无效的请求
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<TerminalError> for JsonRpcError {
    fn from(err: TerminalError) -> Self {
        // 应用特定的错误码范围 (-32000 到 -32099)
        let code = match &err {
            TerminalError::SessionNotFound(_) => -32001,
            TerminalError::DuplicateSession(_) => -32003,
            TerminalError::DuplicateFd { .. } => -32004,
            TerminalError::SessionTerminated(_) => -32005,
            TerminalError::InvalidRequest(_) => -32602,
            TerminalError::SerializationError(_) => -32700,
            TerminalError::PtyCreationFailed(_) => -32010,
            TerminalError::IoError(_) => -32603,
        };

        JsonRpcError {
            code,
            message: err.to_string(),
            data: Some(serde_json::json!({
                "error_type": err.error_type(),
                "error_code": err.code(),
            })),
        }
    }
}

impl TerminalError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            TerminalError::PtyCreationFailed(_) => 1001,
            TerminalError::SessionNotFound(_) => 1003,
            TerminalError::InvalidRequest(_) => 1004,
            TerminalError::IoError(_) => 1005,
            TerminalError::SerializationError(_) => 1006,
            TerminalError::DuplicateSession(_) => 1014,
            TerminalError::DuplicateFd { .. } => 1015,
            TerminalError::SessionTerminated(_) => 1016,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            TerminalError::PtyCreationFailed(_) => "pty_creation_failed",
            TerminalError::SessionNotFound(_) => "session_not_found",
            TerminalError::InvalidRequest(_) => "invalid_request",
            TerminalError::IoError(_) => "io_error",
            TerminalError::SerializationError(_) => "serialization_error",
            TerminalError::DuplicateSession(_) => "duplicate_session",
            TerminalError::DuplicateFd { .. } => "duplicate_fd",
            TerminalError::SessionTerminated(_) => "session_terminated",
        }
    }

    /// 包装 portable-pty 等返回的外部错误
    pub fn launch(stage: &str, err: impl std::fmt::Display) -> Self {
        TerminalError::PtyCreationFailed(format!("{}: {}", stage, err))
    }
}
