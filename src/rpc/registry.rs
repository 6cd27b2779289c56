use crate::{
    error::RegistrationError,
    rpc::{RpcCtx, RpcError},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future};
use tower::{
    util::{BoxCloneSyncService, Oneshot},
    Service, ServiceExt,
};

/// The input to an erased procedure.
#[derive(Debug)]
pub(crate) struct RpcRequest {
    pub(crate) ctx: RpcCtx,
    pub(crate) args: Vec<Value>,
}

/// A procedure handler with its parameter and result types erased.
///
/// Decoding the arguments, running the handler and serializing its result all
/// happen inside the service, so the dispatcher only deals in JSON values.
#[derive(Debug, Clone)]
pub(crate) struct Route(BoxedRoute);

type BoxedRoute = BoxCloneSyncService<RpcRequest, Value, RpcError>;

impl Route {
    /// Create a new route from a service.
    pub(crate) fn new<S>(inner: S) -> Self
    where
        S: Service<RpcRequest, Response = Value, Error = RpcError> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Self(BoxCloneSyncService::new(inner))
    }

    /// Erase a handler closure.
    pub(crate) fn from_handler<F, Fut, P, T>(handler: F) -> Self
    where
        F: Fn(RpcCtx, P) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        Self::new(tower::service_fn(move |req: RpcRequest| {
            let handler = handler.clone();
            async move {
                let params = decode_params::<P>(req.args)?;
                let result = handler(req.ctx, params).await?;
                serde_json::to_value(result).map_err(|err| {
                    RpcError::handler_failure(format!("result is not serializable: {err}"))
                })
            }
        }))
    }

    /// Create a one-shot future for the given request.
    pub(crate) fn oneshot(self, req: RpcRequest) -> Oneshot<BoxedRoute, RpcRequest> {
        self.0.oneshot(req)
    }
}

/// Decode call arguments into handler parameters.
///
/// The whole argument array is tried first, so `Vec<Value>` and tuples work
/// naturally. A call with a single argument may also decode as that argument
/// alone, and a call without arguments may decode as `()`.
fn decode_params<P: DeserializeOwned>(args: Vec<Value>) -> Result<P, RpcError> {
    let fallback = match args.as_slice() {
        [] => Some(Value::Null),
        [single] => Some(single.clone()),
        _ => None,
    };
    match serde_json::from_value(Value::Array(args)) {
        Ok(params) => Ok(params),
        Err(err) => fallback
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| RpcError::invalid_params(err.to_string())),
    }
}

/// Procedures callable by clients, keyed by exact name.
///
/// ```
/// use wsbroker::rpc::{RpcCtx, RpcError, RpcRegistry};
///
/// let mut rpc = RpcRegistry::new();
/// rpc.register("sum", |_ctx: RpcCtx, nums: Vec<i64>| async move {
///     Ok::<_, RpcError>(nums.iter().sum::<i64>())
/// })
/// .unwrap();
/// assert!(rpc.contains("sum"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RpcRegistry {
    routes: HashMap<String, Route>,
}

impl RpcRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a procedure name.
    ///
    /// The handler receives the call context and its arguments decoded as
    /// `P`. Registering the same name twice is an error.
    pub fn register<F, Fut, P, T>(
        &mut self,
        procedure: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        F: Fn(RpcCtx, P) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let procedure = procedure.into();
        if self.routes.contains_key(&procedure) {
            return Err(RegistrationError::DuplicateProcedure(procedure));
        }
        self.routes.insert(procedure, Route::from_handler(handler));
        Ok(())
    }

    /// True if a procedure is registered under `procedure`.
    pub fn contains(&self, procedure: &str) -> bool {
        self.routes.contains_key(procedure)
    }

    /// Names of all registered procedures.
    pub fn procedures(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of registered procedures.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn get(&self, procedure: &str) -> Option<&Route> {
        self.routes.get(procedure)
    }
}
