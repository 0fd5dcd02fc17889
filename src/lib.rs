//! PTY Bridge 库
//!
//! 把远程客户端的会话桥接到各自独立的伪终端：会话注册表、输出转发器、
//! 会话事件处理器，以及 JSON-RPC 传输层。

pub mod pty;
pub mod rpc;
pub mod utils;
