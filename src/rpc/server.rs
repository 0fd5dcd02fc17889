//! RPC 服务器实现
//!
//! 以行分隔的 JSON-RPC 2.0 为传输层，支持两种承载方式：
//! - stdio：通过 stdin/stdout 与前端通信，会话 ID 由请求参数指定
//! - tcp：每个 TCP 连接对应一个会话，会话 ID 由服务器在接受连接时签发，
//!   连接建立即连接会话，连接关闭即断开会话

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use super::methods::{CallContext, RpcMethods};
use super::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, SessionStatus};
use crate::pty::{PtyManager, SessionId};

type NotificationTx = mpsc::UnboundedSender<JsonRpcNotification>;

/// 通知发送器，可以克隆并在多个地方使用
///
/// 绑定了连接的会话，通知发往该连接；否则发往默认通道（stdio）。
#[derive(Clone)]
pub struct NotificationSender {
    tx: NotificationTx,
    routes: Arc<RwLock<HashMap<SessionId, NotificationTx>>>,
}

impl NotificationSender {
    /// 创建通知发送器和默认通道的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JsonRpcNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self {
            tx,
            routes: Arc::new(RwLock::new(HashMap::new())),
        };
        (sender, rx)
    }

    /// 创建新的通知发送器（用于测试）
    #[cfg(test)]
    pub fn new_for_test(tx: NotificationTx) -> Self {
        Self {
            tx,
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 把会话的通知路由到指定通道
    pub fn attach(&self, session_id: &SessionId, tx: NotificationTx) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), tx);
    }

    /// 取消会话的路由
    pub fn detach(&self, session_id: &SessionId) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// 发送通知到默认通道
    pub fn send(&self, notification: JsonRpcNotification) -> Result<(), mpsc::error::SendError<JsonRpcNotification>> {
        self.tx.send(notification)
    }

    /// 发送属于某个会话的通知
    pub fn send_to(
        &self,
        session_id: &SessionId,
        notification: JsonRpcNotification,
    ) -> Result<(), mpsc::error::SendError<JsonRpcNotification>> {
        let routed = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned();
        match routed {
            Some(tx) => tx.send(notification),
            None => self.send(notification),
        }
    }

    /// 发送终端输出通知
    pub fn send_output(&self, session_id: &SessionId, output: &str) -> Result<(), mpsc::error::SendError<JsonRpcNotification>> {
        let notification = JsonRpcNotification::new(
            "terminal.output",
            serde_json::json!({
                "session_id": session_id,
                "output": output
            }),
        );
        self.send_to(session_id, notification)
    }

    /// 发送会话状态变更通知
    pub fn send_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        message: Option<&str>,
    ) -> Result<(), mpsc::error::SendError<JsonRpcNotification>> {
        let mut params = serde_json::json!({
            "session_id": session_id,
            "status": status
        });
        if let Some(message) = message {
            params["message"] = serde_json::json!(message);
        }
        self.send_to(session_id, JsonRpcNotification::new("session.status", params))
    }
}

/// RPC 服务器
pub struct RpcServer {
    methods: Arc<RpcMethods>,
    notification_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcNotification>>>,
    notification_sender: NotificationSender,
}

impl RpcServer {
    /// 创建新的 RPC 服务器
    pub fn new(
        manager: PtyManager,
        notification_sender: NotificationSender,
        notification_rx: mpsc::UnboundedReceiver<JsonRpcNotification>,
    ) -> Self {
        Self {
            methods: Arc::new(RpcMethods::new(manager)),
            notification_rx: Mutex::new(Some(notification_rx)),
            notification_sender,
        }
    }

    /// 获取通知发送器
    pub fn notification_sender(&self) -> NotificationSender {
        self.notification_sender.clone()
    }

    /// 在 stdin/stdout 上运行，stdin 关闭时返回
    pub async fn run_stdio(&self) -> anyhow::Result<()> {
        let rx = self
            .notification_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdio 传输已经在运行"))?;

        let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
        let reader = BufReader::new(tokio::io::stdin());
        let notification_task = spawn_notification_writer(rx, stdout.clone());

        let result = self
            .serve_lines(reader, stdout, &CallContext::default())
            .await;

        tracing::info!("stdin 关闭，退出");
        notification_task.abort();
        result
    }

    /// 在 TCP 上监听，每个连接一个会话
    pub async fn run_tcp(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("监听 tcp://{}", listener.local_addr()?);
        self.serve_tcp(listener).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        // TCP 模式没有默认输出通道，未路由到连接的通知直接丢弃
        drop(self.notification_rx.lock().await.take());

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, peer).await {
                    tracing::warn!("连接 {} 出错: {}", peer, e);
                }
            });
        }
    }

    /// 处理单个 TCP 连接
    async fn serve_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let session_id = SessionId::generate();
        tracing::info!("新客户端连接: {} -> 会话 {}", peer, session_id);

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        let (tx, rx) = mpsc::unbounded_channel();
        self.notification_sender.attach(&session_id, tx);
        let notification_task = spawn_notification_writer(rx, writer.clone());

        let result = match self.methods.manager().connect(&session_id).await {
            Ok(_) => {
                let ctx = CallContext::bound(session_id.clone());
                self.serve_lines(BufReader::new(read_half), writer, &ctx).await
            }
            Err(e) => {
                tracing::error!("会话 {} 启动失败: {}", session_id, e);
                let _ = self.notification_sender.send_status(
                    &session_id,
                    SessionStatus::Error,
                    Some(&e.to_string()),
                );
                Ok(())
            }
        };

        self.methods.manager().disconnect(&session_id).await;
        self.notification_sender.detach(&session_id);
        // 写出剩余通知后结束
        let _ = notification_task.await;
        tracing::info!("客户端断开: {} (会话 {})", peer, session_id);
        result
    }

    /// 逐行读取请求并写回响应
    async fn serve_lines<R, W>(
        &self,
        mut reader: R,
        writer: Arc<Mutex<W>>,
        ctx: &CallContext,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                break;
            }

            let line_trimmed = line.trim();
            if line_trimmed.is_empty() {
                continue;
            }

            let response = self.handle_request(line_trimmed, ctx).await;

            let response_json = serde_json::to_string(&response)?;
            let mut writer = writer.lock().await;
            writer.write_all(response_json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        Ok(())
    }

    /// 处理单个请求
    async fn handle_request(&self, line: &str, ctx: &CallContext) -> JsonRpcResponse {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                return JsonRpcResponse::error(
                    serde_json::Value::Null,
                    JsonRpcError::parse_error(format!("JSON 解析错误: {}", e)),
                );
            }
        };

        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_request("无效的 JSON-RPC 版本"),
            );
        }

        self.methods
            .call(&request.method, request.params, request.id, ctx)
            .await
    }
}

/// 把通知写到输出流，所有发送端关闭后结束
fn spawn_notification_writer<W>(
    mut rx: mpsc::UnboundedReceiver<JsonRpcNotification>,
    writer: Arc<Mutex<W>>,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let json = match serde_json::to_string(&notification) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("序列化通知失败: {}", e);
                    continue;
                }
            };

            let mut writer = writer.lock().await;
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                tracing::debug!("输出流已关闭，停止发送通知");
                break;
            }
        }
    })
}
