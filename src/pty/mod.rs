//! PTY 管理模块
//!
//! 负责本地伪终端的创建、会话注册和输出转发。

pub mod command;
pub mod decode;
pub mod local;
pub mod manager;
pub mod output;
pub mod registry;
pub mod session;

pub use command::{CommandVector, LaunchConfig};
pub use local::LocalPty;
pub use manager::{ConnectOutcome, PtyManager};
pub use output::{start_output_forwarder, ForwarderConfig, OutputForwarderHandle};
pub use registry::{SessionRegistry, SharedRegistry};
pub use session::{SessionId, SessionInfo};
