//! RPC 方法注册和调用
//!
//! 实现 JSON-RPC 方法的分发，把请求转换为对 [`PtyManager`] 的调用。

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{
    ConnectRequest, ConnectResponse, InputRequest, JsonRpcError, JsonRpcResponse, ResizeRequest,
    SessionRequest,
};
use crate::pty::{PtyManager, SessionId};
use crate::utils::error::TerminalError;

/// 调用上下文
///
/// TCP 连接绑定了一个会话，请求中省略的 `session_id` 默认使用它。
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub bound_session: Option<SessionId>,
}

impl CallContext {
    pub fn bound(session_id: SessionId) -> Self {
        Self {
            bound_session: Some(session_id),
        }
    }

    /// 确定请求作用的会话
    fn resolve(&self, requested: Option<SessionId>) -> Result<SessionId, JsonRpcError> {
        match (&self.bound_session, requested) {
            (Some(bound), None) => Ok(bound.clone()),
            (Some(bound), Some(requested)) if *bound == requested => Ok(requested),
            (Some(bound), Some(requested)) => Err(JsonRpcError::invalid_params(format!(
                "连接绑定的会话是 {}，不能操作 {}",
                bound, requested
            ))),
            (None, Some(requested)) => Ok(requested),
            (None, None) => Err(JsonRpcError::invalid_params("缺少 session_id")),
        }
    }
}

/// RPC 方法处理器
pub struct RpcMethods {
    pty_manager: PtyManager,
}

impl RpcMethods {
    /// 创建新的方法处理器
    pub fn new(pty_manager: PtyManager) -> Self {
        Self { pty_manager }
    }

    pub fn manager(&self) -> &PtyManager {
        &self.pty_manager
    }

    /// 调用指定方法
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
        ctx: &CallContext,
    ) -> JsonRpcResponse {
        let result = match method {
            "session.connect" => self.session_connect(params, ctx).await,
            "session.input" => self.session_input(params, ctx).await,
            "session.resize" => self.session_resize(params, ctx),
            "session.disconnect" => self.session_disconnect(params, ctx).await,
            "session.list" => to_value(&self.pty_manager.list()),
            "session.get" => self.session_get(params, ctx),
            _ => Err(JsonRpcError::method_not_found(method)),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error),
        }
    }

    /// 连接会话
    ///
    /// stdio 下省略 `session_id` 时生成新的会话 ID。
    async fn session_connect(
        &self,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: ConnectRequest = match params {
            Some(params) => parse_params(Some(params))?,
            None => ConnectRequest::default(),
        };

        let session_id = match (&ctx.bound_session, request.session_id) {
            (None, None) => SessionId::generate(),
            (_, requested) => ctx.resolve(requested)?,
        };

        let outcome = self.pty_manager.connect(&session_id).await?;
        to_value(&ConnectResponse {
            session_id,
            pid: outcome.pid(),
            already_active: outcome.already_active(),
        })
    }

    /// 发送输入
    ///
    /// 数据全部写入 PTY 后才返回响应。
    async fn session_input(
        &self,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: InputRequest = parse_params(params)?;
        let data = request.bytes()?;
        let session_id = ctx.resolve(request.session_id)?;

        self.pty_manager.input(&session_id, &data).await;
        Ok(serde_json::Value::Null)
    }

    /// 调整大小
    fn session_resize(
        &self,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: ResizeRequest = parse_params(params)?;
        let session_id = ctx.resolve(request.session_id)?;

        self.pty_manager.resize(&session_id, request.size);
        Ok(serde_json::Value::Null)
    }

    /// 断开会话
    async fn session_disconnect(
        &self,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: SessionRequest = parse_params(params)?;
        let session_id = ctx.resolve(request.session_id)?;

        self.pty_manager.disconnect(&session_id).await;
        Ok(serde_json::Value::Null)
    }

    /// 获取会话信息
    fn session_get(
        &self,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: SessionRequest = parse_params(params)?;
        let session_id = ctx.resolve(request.session_id)?;

        match self.pty_manager.info(&session_id) {
            Some(info) => to_value(&info),
            None => Err(TerminalError::SessionNotFound(session_id.to_string()).into()),
        }
    }
}

fn parse_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("缺少参数"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("参数解析错误: {}", e)))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| TerminalError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::local::pid_alive;
    use crate::rpc::server::NotificationSender;

    fn new_methods() -> RpcMethods {
        let (sender, _rx) = NotificationSender::channel();
        RpcMethods::new(PtyManager::for_tests(sender).unwrap())
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let methods = new_methods();
        let response = methods
            .call("unknown.method", None, serde_json::json!(1), &CallContext::default())
            .await;

        assert!(response.error.is_some());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601); // Method not found
    }

    #[tokio::test]
    async fn test_missing_params() {
        let methods = new_methods();
        let response = methods
            .call("session.input", None, serde_json::json!(1), &CallContext::default())
            .await;

        assert!(response.error.is_some());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32602); // Invalid params
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let methods = new_methods();
        let response = methods
            .call(
                "session.resize",
                Some(serde_json::json!({"session_id": "s1", "rows": "many"})),
                serde_json::json!(1),
                &CallContext::default(),
            )
            .await;

        assert!(response.error.is_some());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32602); // Invalid params
    }

    #[tokio::test]
    async fn test_stale_session_calls_succeed_with_null() {
        let methods = new_methods();
        let ctx = CallContext::default();

        for (method, params) in [
            ("session.input", serde_json::json!({"session_id": "ghost", "input": "ls\n"})),
            ("session.resize", serde_json::json!({"session_id": "ghost", "rows": 24, "cols": 80})),
            ("session.disconnect", serde_json::json!({"session_id": "ghost"})),
        ] {
            let response = methods.call(method, Some(params), serde_json::json!(1), &ctx).await;
            assert!(response.error.is_none(), "{} should not fail", method);
            assert_eq!(response.result, Some(serde_json::Value::Null));
        }
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let methods = new_methods();
        let response = methods
            .call(
                "session.get",
                Some(serde_json::json!({"session_id": "ghost"})),
                serde_json::json!(1),
                &CallContext::default(),
            )
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, -32001);
        assert_eq!(error.data.unwrap()["error_type"], "session_not_found");
    }

    #[tokio::test]
    async fn test_bound_session_rejects_other_ids() {
        let methods = new_methods();
        let ctx = CallContext::bound(SessionId::from("mine"));
        let response = methods
            .call(
                "session.input",
                Some(serde_json::json!({"session_id": "theirs", "input": "x"})),
                serde_json::json!(1),
                &ctx,
            )
            .await;

        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[test]
    fn test_resolve_session() {
        let unbound = CallContext::default();
        assert!(unbound.resolve(None).is_err());
        assert_eq!(
            unbound.resolve(Some(SessionId::from("s"))).unwrap(),
            SessionId::from("s")
        );

        let bound = CallContext::bound(SessionId::from("b"));
        assert_eq!(bound.resolve(None).unwrap(), SessionId::from("b"));
        assert_eq!(
            bound.resolve(Some(SessionId::from("b"))).unwrap(),
            SessionId::from("b")
        );
        assert!(bound.resolve(Some(SessionId::from("c"))).is_err());
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let methods = new_methods();
        let ctx = CallContext::default();

        let response = methods
            .call("session.connect", None, serde_json::json!(1), &ctx)
            .await;
        let result = match (response.result, response.error) {
            (Some(result), None) => result,
            (_, error) => {
                println!("PTY creation failed (may be expected in CI): {:?}", error);
                return;
            }
        };

        let session_id = result["session_id"].as_str().unwrap().to_string();
        let pid = result["pid"].as_u64().unwrap() as u32;
        assert!(uuid::Uuid::parse_str(&session_id).is_ok());
        assert_eq!(result["already_active"], false);
        assert!(pid_alive(pid));

        let again = methods
            .call(
                "session.connect",
                Some(serde_json::json!({"session_id": session_id})),
                serde_json::json!(2),
                &ctx,
            )
            .await
            .result
            .unwrap();
        assert_eq!(again["already_active"], true);
        assert_eq!(again["pid"].as_u64(), Some(u64::from(pid)));

        let info = methods
            .call(
                "session.get",
                Some(serde_json::json!({"session_id": session_id})),
                serde_json::json!(3),
                &ctx,
            )
            .await
            .result
            .unwrap();
        assert_eq!(info["rows"], 50);

        let list = methods
            .call("session.list", None, serde_json::json!(4), &ctx)
            .await
            .result
            .unwrap();
        assert_eq!(list.as_array().map(Vec::len), Some(1));

        let response = methods
            .call(
                "session.disconnect",
                Some(serde_json::json!({"session_id": session_id})),
                serde_json::json!(5),
                &ctx,
            )
            .await;
        assert_eq!(response.result, Some(serde_json::Value::Null));
        assert!(!pid_alive(pid));
        assert_eq!(methods.manager().session_count(), 0);

        // 已结束的会话不能再连接
        let error = methods
            .call(
                "session.connect",
                Some(serde_json::json!({"session_id": session_id})),
                serde_json::json!(6),
                &ctx,
            )
            .await
            .error
            .unwrap();
        assert_eq!(error.code, -32005);
        assert_eq!(error.data.unwrap()["error_type"], "session_terminated");
        assert_eq!(methods.manager().session_count(), 0);
    }
}

/// Property-based tests for RPC error responses
/// 任意无效的方法名或参数都应得到格式正确的错误响应
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::rpc::server::NotificationSender;
    use proptest::prelude::*;

    const METHODS: [&str; 6] = [
        "session.connect",
        "session.input",
        "session.resize",
        "session.disconnect",
        "session.list",
        "session.get",
    ];

    fn call(method: &str, params: Option<serde_json::Value>, id: serde_json::Value) -> JsonRpcResponse {
        tokio_test::block_on(async {
            let (sender, _rx) = NotificationSender::channel();
            let methods = RpcMethods::new(PtyManager::for_tests(sender).unwrap());
            methods.call(method, params, id, &CallContext::default()).await
        })
    }

    // Strategy for generating invalid params
    fn invalid_params_strategy() -> impl Strategy<Value = Option<serde_json::Value>> {
        prop_oneof![
            Just(None),
            Just(Some(serde_json::json!({}))),
            Just(Some(serde_json::json!({"random": "value"}))),
            Just(Some(serde_json::json!(null))),
            Just(Some(serde_json::json!([1, 2, 3]))),
            Just(Some(serde_json::json!("string"))),
            Just(Some(serde_json::json!(123))),
        ]
    }

    // Strategy for generating request IDs
    fn request_id_strategy() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            (1i64..1000).prop_map(|n| serde_json::json!(n)),
            "[a-z0-9-]{1,20}".prop_map(|s| serde_json::json!(s)),
            Just(serde_json::Value::Null),
        ]
    }

    // 需要会话的方法（不含会启动进程的 session.connect）
    fn session_method_strategy() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("session.input"),
            Just("session.resize"),
            Just("session.disconnect"),
            Just("session.get"),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// *对于任意*无效的方法名，服务器应返回包含 error 字段的响应，错误码为 -32601
        #[test]
        fn prop_unknown_method_returns_error(
            method in "[a-z]{5,15}\\.[a-z]{5,15}",
            id in request_id_strategy()
        ) {
            if METHODS.contains(&method.as_str()) {
                return Ok(());
            }

            let response = call(&method, None, id.clone());

            prop_assert!(response.error.is_some(), "Response should have error for unknown method");
            let error = response.error.unwrap();
            prop_assert_eq!(error.code, -32601, "Error code should be -32601 for method not found");
            prop_assert_eq!(response.jsonrpc, "2.0", "jsonrpc version should be 2.0");
            prop_assert!(response.result.is_none(), "Response should not have result for error");
            prop_assert_eq!(response.id, id, "id should be echoed back");
        }

        /// *对于任意*缺少必需参数的请求，服务器应返回包含 error 字段的响应，错误码为 -32602
        #[test]
        fn prop_missing_params_returns_error(
            method in session_method_strategy(),
            id in request_id_strategy()
        ) {
            let response = call(method, None, id);

            prop_assert!(response.error.is_some(), "Response should have error for missing params");
            let error = response.error.unwrap();
            prop_assert_eq!(error.code, -32602, "Error code should be -32602 for invalid params");
            prop_assert_eq!(response.jsonrpc, "2.0", "jsonrpc version should be 2.0");
        }

        /// *对于任意*无效参数格式的请求，服务器应返回包含 error 字段的响应，错误码为 -32602
        #[test]
        fn prop_invalid_params_returns_error(
            method in session_method_strategy(),
            params in invalid_params_strategy(),
            id in request_id_strategy()
        ) {
            let response = call(method, params, id);

            prop_assert!(response.error.is_some(), "Response should have error for invalid params");
            let error = response.error.unwrap();
            prop_assert_eq!(error.code, -32602, "Error code should be -32602 for invalid params");
            prop_assert!(response.result.is_none());
        }
    }
}
