//! RPC 数据类型定义
//!
//! 定义 JSON-RPC 请求、响应和通知的数据结构。

use serde::{Deserialize, Serialize};

use crate::pty::SessionId;
use crate::utils::error::TerminalError;

/// 终端尺寸（行列及可选像素）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub xpix: u16,
    #[serde(default)]
    pub ypix: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            xpix: 0,
            ypix: 0,
        }
    }
}

impl Default for WindowSize {
    /// 新会话的初始尺寸
    fn default() -> Self {
        Self::new(50, 50)
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 运行中
    Active,
    /// 已终止（断开连接或子进程退出）
    Terminated,
    /// 错误
    Error,
}

// ============ RPC 请求类型 ============

/// 连接请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// 连接响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    pub pid: u32,
    /// 会话在此之前已经连接
    pub already_active: bool,
}

/// 输入请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// 文本输入，按 UTF-8 原样写入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Base64 编码的二进制输入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl InputRequest {
    /// 要写入 PTY 的字节
    pub fn bytes(&self) -> Result<Vec<u8>, TerminalError> {
        match (&self.input, &self.data) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(data)) => {
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
                    .map_err(|e| TerminalError::InvalidRequest(format!("Invalid base64 data: {}", e)))
            }
            (Some(_), Some(_)) => Err(TerminalError::InvalidRequest(
                "input 和 data 只能提供一个".to_string(),
            )),
            (None, None) => Err(TerminalError::InvalidRequest(
                "缺少 input 或 data".to_string(),
            )),
        }
    }
}

/// 调整大小请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub size: WindowSize,
}

/// 只携带会话 ID 的请求（断开连接、查询）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

// ============ JSON-RPC 2.0 协议类型 ============

/// JSON-RPC 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// JSON-RPC 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

impl JsonRpcResponse {
    /// 创建成功响应
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// 创建错误响应
    pub fn error(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// 解析错误 (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    /// 无效请求 (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// 方法不存在 (-32601)
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method.into()),
            data: None,
        }
    }

    /// 无效参数 (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// 内部错误 (-32603)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// 创建新通知
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}
