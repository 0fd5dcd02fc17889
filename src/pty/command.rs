//! 启动命令
//!
//! 进程级的命令向量在启动时确定一次，之后每个会话都用它启动子进程。

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::rpc::types::WindowSize;
use crate::utils::error::TerminalError;

/// 检测系统默认 shell
pub fn detect_default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// 命令向量（程序 + 参数）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVector {
    program: String,
    args: Vec<String>,
}

impl CommandVector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 从命令行参数构建
    ///
    /// `cmd_args` 按 POSIX shell 规则拆分，例如 `--cmd-args='-c "echo hi"'`。
    pub fn from_cli(command: Option<String>, cmd_args: &str) -> Result<Self, TerminalError> {
        let program = command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(detect_default_shell);
        let args = shell_words::split(cmd_args)
            .map_err(|e| TerminalError::InvalidRequest(format!("无法解析 --cmd-args: {}", e)))?;
        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// 完整 argv
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// 用于日志的 shell 转义形式
    pub fn display(&self) -> String {
        shell_words::join(self.argv())
    }
}

/// PTY 启动配置
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub command: CommandVector,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub initial_size: WindowSize,
}

impl LaunchConfig {
    pub fn new(command: CommandVector) -> Self {
        Self {
            command,
            cwd: env::current_dir().ok(),
            env: HashMap::new(),
            initial_size: WindowSize::default(),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        if cwd.is_some() {
            self.cwd = cwd;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_default_shell() {
        let shell = detect_default_shell();
        assert!(!shell.is_empty());
    }

    #[test]
    fn test_from_cli_splits_args() {
        let cmd = CommandVector::from_cli(
            Some("bash".to_string()),
            "--norc -c 'echo hello world'",
        )
        .unwrap();
        assert_eq!(cmd.program(), "bash");
        assert_eq!(cmd.args(), ["--norc", "-c", "echo hello world"]);
        assert_eq!(cmd.argv().len(), 4);
    }

    #[test]
    fn test_from_cli_defaults_to_shell() {
        let cmd = CommandVector::from_cli(None, "").unwrap();
        assert_eq!(cmd.program(), detect_default_shell());
        assert!(cmd.args().is_empty());
    }

    #[test]
    fn test_from_cli_rejects_unbalanced_quotes() {
        let result = CommandVector::from_cli(Some("sh".to_string()), "-c 'echo");
        assert!(matches!(result, Err(TerminalError::InvalidRequest(_))));
    }

    #[test]
    fn test_display_quotes_arguments() {
        let cmd = CommandVector::new("sh", vec!["-c".to_string(), "echo hi".to_string()]);
        assert_eq!(cmd.display(), "sh -c 'echo hi'");
    }

    #[test]
    fn test_launch_config_defaults() {
        let config = LaunchConfig::new(CommandVector::new("sh", Vec::new()));
        assert_eq!(config.initial_size, WindowSize::default());
        assert!(config.env.is_empty());
    }
}
