use crate::{
    primitives::CallId,
    rpc::{registry::RpcRequest, RpcCtx, RpcError, RpcRegistry},
    types::OutboundFrame,
};
use futures_util::FutureExt;
use serde_json::Value;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, debug_span, error, warn, Instrument};

/// Routes `CALL` frames to procedures and turns their outcome into the
/// matching `CALLRESULT` or `CALLERROR` frame.
#[derive(Debug, Clone)]
pub(crate) struct RpcDispatcher {
    registry: Arc<RpcRegistry>,
    timeout: Duration,
}

impl RpcDispatcher {
    pub(crate) fn new(registry: RpcRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
        }
    }

    /// Produce a future resolving to the response frame for a call.
    ///
    /// The future owns everything it needs, so the event loop can spawn it
    /// and move on. Handler panics and timeouts are converted to `CALLERROR`
    /// frames, never propagated.
    pub(crate) fn call(
        &self,
        ctx: RpcCtx,
        call_id: CallId,
        procedure: String,
        args: Vec<Value>,
    ) -> impl Future<Output = OutboundFrame> + Send + 'static {
        let route = self.registry.get(&procedure).cloned();
        let timeout = self.timeout;
        let span = debug_span!("rpc call", %procedure, %call_id, conn_id = ctx.conn_id());

        async move {
            let Some(route) = route else {
                debug!("unknown procedure");
                crate::metrics::record_call_error(&procedure, crate::error::codes::UNKNOWN_PROCEDURE);
                return RpcError::unknown_procedure(&procedure).into_frame(call_id);
            };

            crate::metrics::record_call(&procedure);
            let fut = AssertUnwindSafe(route.oneshot(RpcRequest { ctx, args })).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => {
                    error!("procedure panicked");
                    Err(RpcError::handler_failure("procedure panicked"))
                }
                Err(_) => {
                    warn!(?timeout, "procedure timed out");
                    Err(RpcError::timeout())
                }
            };
            crate::metrics::record_call_completed(
                &procedure,
                outcome.as_ref().err().map(RpcError::code),
            );

            match outcome {
                Ok(result) => OutboundFrame::CallResult { call_id, result },
                Err(err) => {
                    debug!(%err, "procedure failed");
                    err.into_frame(call_id)
                }
            }
        }
        .instrument(span)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::BrokerHandle;
    use serde_json::json;

    fn ctx() -> RpcCtx {
        RpcCtx {
            conn_id: 4,
            principal: Some("ada".into()),
            origin: None,
            session: Some(json!({"n": 1})),
            broker: BrokerHandle::detached(),
        }
    }

    fn dispatcher() -> RpcDispatcher {
        let mut rpc = RpcRegistry::new();
        rpc.register("echo", |_: RpcCtx, args: Vec<Value>| async move {
            Ok::<_, RpcError>(args)
        })
        .unwrap();
        rpc.register("whoami", |ctx: RpcCtx, ()| async move {
            Ok::<_, RpcError>(json!({
                "conn": ctx.conn_id(),
                "principal": ctx.principal(),
                "session": ctx.session(),
            }))
        })
        .unwrap();
        rpc.register("deny", |_: RpcCtx, ()| async move {
            Err::<(), _>(RpcError::unauthorized("nope").with_details(json!({"why": "test"})))
        })
        .unwrap();
        rpc.register("add", |_: RpcCtx, (a, b): (i64, i64)| async move {
            Ok::<_, RpcError>(a + b)
        })
        .unwrap();
        rpc.register("slow", |_: RpcCtx, ()| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RpcError>(())
        })
        .unwrap();
        rpc.register("boom", |_: RpcCtx, ()| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, RpcError>(())
        })
        .unwrap();
        RpcDispatcher::new(rpc, Duration::from_secs(5))
    }

    async fn call(procedure: &str, args: Vec<Value>) -> Value {
        let frame = dispatcher()
            .call(ctx(), CallId::from(7), procedure.into(), args)
            .await;
        serde_json::to_value(frame).unwrap()
    }

    #[tokio::test]
    async fn results_echo_the_call_id() {
        assert_eq!(call("echo", vec![json!("x")]).await, json!([3, 7, ["x"]]));
        assert_eq!(call("add", vec![json!(2), json!(3)]).await, json!([3, 7, 5]));
    }

    #[tokio::test]
    async fn handlers_see_the_caller() {
        assert_eq!(
            call("whoami", vec![]).await,
            json!([3, 7, {"conn": 4, "principal": "ada", "session": {"n": 1}}])
        );
    }

    #[tokio::test]
    async fn errors_become_call_errors() {
        assert_eq!(
            call("missing", vec![]).await,
            json!([4, 7, "unknown_procedure", "no procedure registered as `missing`"])
        );
        assert_eq!(
            call("deny", vec![]).await,
            json!([4, 7, "unauthorized", "nope", {"why": "test"}])
        );
        assert_eq!(call("add", vec![json!("x")]).await[2], "invalid_params");
        assert_eq!(call("boom", vec![]).await[2], "handler_failure");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_procedures_time_out() {
        assert_eq!(call("slow", vec![]).await[2], "timeout");
    }
}
