//! 会话注册表
//!
//! 会话 ↔ PTY master fd ↔ 子进程 pid 的唯一事实来源。以会话为主键保存一张表，
//! 另维护 fd → 会话 的反向索引；两者总是在同一次调用中一起修改。
//!
//! 注册表本身不加锁，由 [`PtyManager`](super::PtyManager) 放在互斥锁后面共享给
//! 事件处理器和输出转发器。

use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::decode::Utf8StreamDecoder;
use super::local::LocalPty;
use super::output::ForwarderWaker;
use super::session::SessionId;
use crate::utils::error::TerminalError;

/// 事件处理器与输出转发器共享的注册表
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// 获取注册表锁
///
/// 持锁期间只做非阻塞的 fd 操作；锁中毒时沿用内部数据，注册表的每次修改都是完整的。
pub fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, SessionRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一个活动会话的注册项
#[derive(Debug)]
pub struct RegistryEntry<P> {
    pub fd: RawFd,
    pub pid: u32,
    pub process: P,
    pub decoder: Utf8StreamDecoder,
    pub connected_at: DateTime<Utc>,
}

/// 会话注册表
#[derive(Debug)]
pub struct SessionRegistry<P = LocalPty> {
    sessions: HashMap<SessionId, RegistryEntry<P>>,
    fd_index: HashMap<RawFd, SessionId>,
    /// 已注销的会话，不允许再次注册
    terminated: HashSet<SessionId>,
    waker: Option<ForwarderWaker>,
}

impl<P> SessionRegistry<P> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            fd_index: HashMap::new(),
            terminated: HashSet::new(),
            waker: None,
        }
    }

    /// 注册/注销时唤醒输出转发器
    pub fn with_waker(waker: ForwarderWaker) -> Self {
        Self {
            waker: Some(waker),
            ..Self::new()
        }
    }

    /// 注册会话
    ///
    /// 会话已存在、已结束或 fd 已被占用时返回错误，注册表保持不变。
    pub fn register(
        &mut self,
        session: SessionId,
        fd: RawFd,
        pid: u32,
        process: P,
    ) -> Result<(), TerminalError> {
        if self.sessions.contains_key(&session) {
            return Err(TerminalError::DuplicateSession(session));
        }
        if self.terminated.contains(&session) {
            return Err(TerminalError::SessionTerminated(session));
        }
        if let Some(owner) = self.fd_index.get(&fd) {
            return Err(TerminalError::DuplicateFd {
                fd,
                owner: owner.clone(),
            });
        }

        self.fd_index.insert(fd, session.clone());
        self.sessions.insert(
            session,
            RegistryEntry {
                fd,
                pid,
                process,
                decoder: Utf8StreamDecoder::new(),
                connected_at: Utc::now(),
            },
        );
        self.wake();
        Ok(())
    }

    /// 注销会话，返回被移除的注册项
    ///
    /// 会话不存在时返回 `None`；断开连接和读取出错两条路径可能先后注销同一会话。
    /// 被注销的会话 id 记入已结束集合，之后不能再注册。
    pub fn unregister(&mut self, session: &SessionId) -> Option<RegistryEntry<P>> {
        let entry = self.sessions.remove(session)?;
        if self.fd_index.get(&entry.fd) == Some(session) {
            self.fd_index.remove(&entry.fd);
        }
        self.terminated.insert(session.clone());
        self.wake();
        Some(entry)
    }

    pub fn lookup_fd(&self, session: &SessionId) -> Option<RawFd> {
        self.sessions.get(session).map(|e| e.fd)
    }

    pub fn lookup_session(&self, fd: RawFd) -> Option<&SessionId> {
        self.fd_index.get(&fd)
    }

    pub fn lookup_pid(&self, session: &SessionId) -> Option<u32> {
        self.sessions.get(session).map(|e| e.pid)
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// 会话是否已结束（断开或子进程退出）
    pub fn is_terminated(&self, session: &SessionId) -> bool {
        self.terminated.contains(session)
    }

    pub fn get(&self, session: &SessionId) -> Option<&RegistryEntry<P>> {
        self.sessions.get(session)
    }

    pub fn get_mut(&mut self, session: &SessionId) -> Option<&mut RegistryEntry<P>> {
        self.sessions.get_mut(session)
    }

    /// 所有需要轮询的 fd
    pub fn all_fds(&self) -> Vec<RawFd> {
        self.fd_index.keys().copied().collect()
    }

    /// 所有活动会话
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

impl<P> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}


/// Property-based tests for the registry
/// 任意注册/注销序列之后，fd 与会话的映射保持互逆
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Register { session: u8, fd: u8 },
        Unregister { session: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, 0u8..8).prop_map(|(session, fd)| Op::Register { session, fd }),
            (0u8..8).prop_map(|session| Op::Unregister { session }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_mappings_stay_inverse(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut registry: SessionRegistry<()> = SessionRegistry::new();

            for op in ops {
                match op {
                    Op::Register { session, fd } => {
                        let _ = registry.register(
                            SessionId::from(format!("s{}", session)),
                            RawFd::from(fd),
                            u32::from(session) + 1000,
                            (),
                        );
                    }
                    Op::Unregister { session } => {
                        let _ = registry.unregister(&SessionId::from(format!("s{}", session)));
                    }
                }

                for session in registry.sessions() {
                    let fd = registry.lookup_fd(&session);
                    prop_assert!(fd.is_some());
                    prop_assert!(registry.lookup_pid(&session).is_some());
                    prop_assert_eq!(registry.lookup_session(fd.unwrap()), Some(&session));
                }
                for fd in registry.all_fds() {
                    let session = registry.lookup_session(fd).cloned();
                    prop_assert!(session.is_some());
                    prop_assert_eq!(registry.lookup_fd(&session.unwrap()), Some(fd));
                }
                prop_assert_eq!(registry.all_fds().len(), registry.len());
            }
        }
    }
}
