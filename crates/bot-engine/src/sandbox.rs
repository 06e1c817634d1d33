//! Budgeted QuickJS execution of one user-supplied code fragment.
//!
//! The interpreter has no ambient authority: the only host bindings are a
//! console sink and the ledger-mediated `fetch`/`post` capabilities. Memory
//! and stack caps are enforced by the runtime, busy loops by an interrupt
//! handler, and promise settlement by a wall-clock deadline around the
//! evaluation future.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::function::{Async, Rest};
use rquickjs::{
    AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Ctx, Function, IntoJs, Object, Type,
    Value, async_with,
};

use evalbot_core::value::{EvalOutcome, EvalValue, MAX_VALUE_DEPTH, MAX_VALUE_NODES};

use crate::api::SandboxLimits;
use crate::ledger::HttpBudgetLedger;

/// Bridges the raw host bindings to the user-facing globals. Budget
/// violations surface as plain `Error` rejections so user `.catch` works.
const PRELUDE: &str = r#"
globalThis.console = { log: (...args) => { __host_log(...args); } };
globalThis.fetch = async (url) => {
  const reply = await __host_fetch(String(url));
  if (!reply.ok) { throw new Error(reply.error); }
  return reply.response;
};
globalThis.post = async (url, body) => {
  const reply = await __host_post(String(url), String(body));
  if (!reply.ok) { throw new Error(reply.error); }
  return reply.response;
};
"#;

/// Terminal failure of a sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("Evaluation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("Evaluation exceeded its resource limits ({detail})")]
    ResourceExhausted { detail: String },
    #[error("{message}")]
    User { message: String },
}

/// State shared with the injected capabilities.
///
/// The principal is stored on the sandbox and read when a capability call is
/// *made*; this is only safe because each worker constructs a fresh sandbox
/// per job, which `execute(self)` enforces by consuming the instance.
struct SandboxShared {
    principal: Mutex<String>,
    eval_id: Mutex<u64>,
    console: Mutex<Vec<String>>,
    ledger: Arc<HttpBudgetLedger>,
    http: reqwest::Client,
}

impl SandboxShared {
    fn current(&self) -> (String, u64) {
        (lock(&self.principal).clone(), *lock(&self.eval_id))
    }
}

/// One isolated interpreter instance, good for exactly one run.
pub struct Sandbox {
    runtime: AsyncRuntime,
    context: AsyncContext,
    shared: Arc<SandboxShared>,
    timeout: Duration,
}

impl Sandbox {
    pub async fn new(
        limits: &SandboxLimits,
        ledger: Arc<HttpBudgetLedger>,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let runtime = AsyncRuntime::new()?;
        runtime.set_memory_limit(limits.heap_bytes).await;
        runtime.set_max_stack_size(limits.stack_bytes).await;
        let context = AsyncContext::full(&runtime).await?;

        let shared = Arc::new(SandboxShared {
            principal: Mutex::new("default".to_string()),
            eval_id: Mutex::new(0),
            console: Mutex::new(Vec::new()),
            ledger,
            http,
        });
        install_host_bindings(&context, shared.clone()).await?;

        Ok(Self {
            runtime,
            context,
            shared,
            timeout: limits.timeout,
        })
    }

    /// Runs `code` to completion (draining interpreter jobs while awaiting
    /// promise settlement) and decodes the settled value. Consuming `self`
    /// makes disposal unconditional: every interpreter-side reference is
    /// released when the sandbox drops, on success, error, and timeout alike.
    pub async fn execute(self, code: &str, principal: &str) -> EvalOutcome {
        let eval_id = self.shared.ledger.begin_eval(principal);
        *lock(&self.shared.principal) = principal.to_string();
        *lock(&self.shared.eval_id) = eval_id;
        lock(&self.shared.console).clear();

        let interrupted = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + self.timeout;
        {
            let interrupted = interrupted.clone();
            self.runtime
                .set_interrupt_handler(Some(Box::new(move || {
                    if Instant::now() >= deadline {
                        interrupted.store(true, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                })))
                .await;
        }

        let source = if needs_async_wrapper(code) {
            format!("(async () => {{ {code}\n }})()")
        } else {
            code.to_string()
        };

        let settled = tokio::time::timeout(
            self.timeout,
            async_with!(self.context => |ctx| { run_script(&ctx, &source).await }),
        )
        .await;

        self.runtime.set_interrupt_handler(None).await;
        let output = std::mem::take(&mut *lock(&self.shared.console));
        let timeout_ms = self.timeout.as_millis().min(u64::MAX as u128) as u64;

        match settled {
            Err(_elapsed) => EvalOutcome::err(SandboxError::Timeout { timeout_ms }.to_string(), output),
            Ok(Ok(value)) => EvalOutcome::ok(value, output),
            Ok(Err(message)) => {
                let error = classify_failure(message, interrupted.load(Ordering::Relaxed), timeout_ms);
                EvalOutcome::err(error.to_string(), output)
            }
        }
    }
}

/// `await` is only valid at the top level inside an async body, so fragments
/// using it are wrapped in an async IIFE. The wrapper returns the function
/// result, not the fragment's completion value.
fn needs_async_wrapper(code: &str) -> bool {
    code.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| token == "await")
}

fn classify_failure(message: String, interrupted: bool, timeout_ms: u64) -> SandboxError {
    let lower = message.to_ascii_lowercase();
    if interrupted || lower.contains("interrupted") {
        return SandboxError::Timeout { timeout_ms };
    }
    if lower.contains("out of memory") || lower.contains("stack overflow") {
        return SandboxError::ResourceExhausted { detail: message };
    }
    SandboxError::User { message }
}

async fn run_script<'js>(ctx: &Ctx<'js>, source: &str) -> Result<EvalValue, String> {
    let value = match ctx.eval::<Value, _>(source).catch(ctx) {
        Ok(value) => value,
        Err(caught) => return Err(caught_message(caught)),
    };

    let settled = if let Some(promise) = value.as_promise() {
        match promise.clone().into_future::<Value>().await.catch(ctx) {
            Ok(value) => value,
            Err(caught) => return Err(caught_message(caught)),
        }
    } else {
        value
    };

    let mut nodes = MAX_VALUE_NODES;
    Ok(decode_value(&settled, 0, &mut nodes))
}

fn caught_message(caught: CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exception) => exception
            .message()
            .unwrap_or_else(|| "unknown error".to_string()),
        CaughtError::Value(value) => {
            let mut nodes = MAX_VALUE_NODES;
            decode_value(&value, 0, &mut nodes).render_inline()
        }
        CaughtError::Error(error) => error.to_string(),
    }
}

/// Decodes an interpreter value into host primitives, bounded by depth and
/// node count so cyclic structures terminate.
fn decode_value<'js>(value: &Value<'js>, depth: usize, nodes: &mut usize) -> EvalValue {
    if *nodes == 0 {
        return EvalValue::Truncated;
    }
    *nodes -= 1;

    match value.type_of() {
        Type::Uninitialized | Type::Undefined => EvalValue::Undefined,
        Type::Null => EvalValue::Null,
        Type::Bool => EvalValue::Bool(value.as_bool().unwrap_or(false)),
        Type::Int => EvalValue::Int(value.as_int().unwrap_or(0)),
        Type::Float => EvalValue::Float(value.as_float().unwrap_or(f64::NAN)),
        Type::String => EvalValue::String(
            value
                .as_string()
                .and_then(|s| s.to_string().ok())
                .unwrap_or_default(),
        ),
        Type::Array => {
            if depth >= MAX_VALUE_DEPTH {
                return EvalValue::Truncated;
            }
            let Some(array) = value.as_array() else {
                return EvalValue::Truncated;
            };
            let items = array
                .iter::<Value>()
                .map(|item| match item {
                    Ok(item) => decode_value(&item, depth + 1, nodes),
                    Err(_) => EvalValue::Truncated,
                })
                .collect();
            EvalValue::Array(items)
        }
        Type::Object | Type::Exception => {
            if depth >= MAX_VALUE_DEPTH {
                return EvalValue::Truncated;
            }
            let Some(object) = value.as_object() else {
                return EvalValue::Truncated;
            };
            let mut entries = Vec::new();
            for prop in object.props::<String, Value>() {
                match prop {
                    Ok((key, item)) => entries.push((key, decode_value(&item, depth + 1, nodes))),
                    Err(_) => entries.push(("…".to_string(), EvalValue::Truncated)),
                }
            }
            EvalValue::Object(entries)
        }
        Type::Function | Type::Constructor => EvalValue::String("[function]".to_string()),
        Type::Symbol => EvalValue::String("[symbol]".to_string()),
        Type::BigInt => EvalValue::String("[bigint]".to_string()),
        Type::Promise => EvalValue::String("[promise]".to_string()),
        _ => EvalValue::Truncated,
    }
}

/// Result shape handed back to the JS prelude.
struct HostHttpReply {
    error: Option<String>,
    response: Option<HttpResponseData>,
}

struct HttpResponseData {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl HostHttpReply {
    fn from(result: Result<HttpResponseData, String>) -> Self {
        match result {
            Ok(response) => Self {
                error: None,
                response: Some(response),
            },
            Err(message) => Self {
                error: Some(message),
                response: None,
            },
        }
    }
}

impl<'js> IntoJs<'js> for HostHttpReply {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let reply = Object::new(ctx.clone())?;
        reply.set("ok", self.error.is_none())?;
        if let Some(message) = self.error {
            reply.set("error", message)?;
        }
        if let Some(response) = self.response {
            let body = Object::new(ctx.clone())?;
            body.set("status", response.status as i32)?;
            body.set("statusText", response.status_text)?;
            let headers = Object::new(ctx.clone())?;
            for (name, value) in response.headers {
                headers.set(name, value)?;
            }
            body.set("headers", headers)?;
            body.set("body", response.body)?;
            reply.set("response", body)?;
        }
        Ok(reply.into_value())
    }
}

async fn install_host_bindings(
    context: &AsyncContext,
    shared: Arc<SandboxShared>,
) -> anyhow::Result<()> {
    async_with!(context => |ctx| {
        let globals = ctx.globals();

        let console_shared = shared.clone();
        globals.set(
            "__host_log",
            Function::new(ctx.clone(), move |args: Rest<Value>| {
                let line = args
                    .iter()
                    .map(|arg| {
                        let mut nodes = MAX_VALUE_NODES;
                        decode_value(arg, 0, &mut nodes).render_inline()
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                lock(&console_shared.console).push(line);
            })?,
        )?;

        let fetch_shared = shared.clone();
        globals.set(
            "__host_fetch",
            Function::new(
                ctx.clone(),
                Async(move |url: String| {
                    let shared = fetch_shared.clone();
                    async move { HostHttpReply::from(perform_fetch(&shared, url).await) }
                }),
            )?,
        )?;

        let post_shared = shared.clone();
        globals.set(
            "__host_post",
            Function::new(
                ctx.clone(),
                Async(move |url: String, body: String| {
                    let shared = post_shared.clone();
                    async move { HostHttpReply::from(perform_post(&shared, url, body).await) }
                }),
            )?,
        )?;

        ctx.eval::<(), _>(PRELUDE)?;
        Ok::<(), anyhow::Error>(())
    })
    .await
}

/// Unqualified URLs default to https.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

async fn perform_fetch(shared: &SandboxShared, url: String) -> Result<HttpResponseData, String> {
    let (principal, eval_id) = shared.current();
    shared
        .ledger
        .check_limits(&principal, eval_id)
        .map_err(|err| err.to_string())?;
    shared.ledger.record_request(&principal, eval_id);

    let limits = shared.ledger.limits();
    let request = shared
        .http
        .get(normalize_url(&url))
        .timeout(limits.request_timeout);
    send_capped(request, limits.response_size_limit_bytes).await
}

async fn perform_post(
    shared: &SandboxShared,
    url: String,
    body: String,
) -> Result<HttpResponseData, String> {
    shared
        .ledger
        .validate_post_body(body.as_bytes())
        .map_err(|err| err.to_string())?;

    let (principal, eval_id) = shared.current();
    shared
        .ledger
        .check_limits(&principal, eval_id)
        .map_err(|err| err.to_string())?;
    shared.ledger.record_request(&principal, eval_id);

    let limits = shared.ledger.limits();
    let request = shared
        .http
        .post(normalize_url(&url))
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body)
        .timeout(limits.request_timeout);
    send_capped(request, limits.response_size_limit_bytes).await
}

async fn send_capped(
    request: reqwest::RequestBuilder,
    cap: usize,
) -> Result<HttpResponseData, String> {
    let mut response = request
        .send()
        .await
        .map_err(|err| format!("Request failed: {err}"))?;

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or_default().to_string();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| format!("Request failed: {err}"))?
    {
        if body.len() + chunk.len() > cap {
            return Err(format!("Response body too large (max {cap} bytes)"));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(HttpResponseData {
        status: status.as_u16(),
        status_text,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpLimits;

    async fn run(code: &str) -> EvalOutcome {
        run_with(code, SandboxLimits::default(), HttpLimits::default()).await
    }

    async fn run_with(code: &str, limits: SandboxLimits, http: HttpLimits) -> EvalOutcome {
        let ledger = Arc::new(HttpBudgetLedger::new(http));
        let sandbox = Sandbox::new(&limits, ledger, reqwest::Client::new())
            .await
            .unwrap();
        sandbox.execute(code, "did:plc:test").await
    }

    #[tokio::test]
    async fn evaluates_pure_expression() {
        let outcome = run("2 + 2").await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.result, Some(EvalValue::Int(4)));
    }

    #[tokio::test]
    async fn captures_console_before_value() {
        let outcome = run("console.log('Hello'); 'World'").await;
        assert!(outcome.success);
        assert_eq!(outcome.output, vec!["Hello".to_string()]);
        assert_eq!(outcome.result, Some(EvalValue::String("World".into())));
    }

    #[tokio::test]
    async fn settles_promise_results() {
        let outcome = run("Promise.resolve(6 * 7)").await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.result, Some(EvalValue::Int(42)));
    }

    #[tokio::test]
    async fn top_level_await_runs_in_async_wrapper() {
        let outcome = run("await Promise.resolve(0); console.log('done')").await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.output, vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn busy_loop_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        };
        let outcome = run_with("while (true) {}", limits, HttpLimits::default()).await;
        assert!(!outcome.success);
        assert!(
            outcome.error.as_deref().unwrap_or_default().contains("timed out"),
            "{:?}",
            outcome.error
        );
    }

    #[tokio::test]
    async fn unsettled_promise_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        };
        let outcome = run_with("new Promise(() => {})", limits, HttpLimits::default()).await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn http_budget_rejection_carries_ledger_message() {
        let http = HttpLimits {
            per_eval_limit: 0,
            ..HttpLimits::default()
        };
        let outcome = run_with("fetch('example.com')", SandboxLimits::default(), http).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Too many HTTP requests in this eval (max 0 requests)")
        );
    }

    #[tokio::test]
    async fn user_exceptions_surface_their_message() {
        let outcome = run("throw new Error('boom')").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn deep_recursion_is_reported_as_failure() {
        let outcome = run("function f() { return f(); } f()").await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn structured_values_decode() {
        let outcome = run("({ a: 1, b: [true, null] })").await;
        assert!(outcome.success);
        let Some(EvalValue::Object(entries)) = outcome.result else {
            panic!("expected object, got {:?}", outcome.result);
        };
        assert_eq!(entries[0], ("a".to_string(), EvalValue::Int(1)));
        assert_eq!(
            entries[1],
            (
                "b".to_string(),
                EvalValue::Array(vec![EvalValue::Bool(true), EvalValue::Null])
            )
        );
    }

    #[tokio::test]
    async fn cyclic_values_terminate() {
        let outcome = run("const a = []; a.push(a); a").await;
        assert!(outcome.success);
        assert!(outcome.result.is_some());
    }

    #[test]
    fn async_wrapper_detection_uses_word_boundaries() {
        assert!(needs_async_wrapper("await fetch('x')"));
        assert!(needs_async_wrapper("for (;;) { await f(); }"));
        assert!(!needs_async_wrapper("awaited()"));
        assert!(!needs_async_wrapper("fetch('x').then(r => r.status)"));
    }

    #[test]
    fn url_normalization_prepends_https() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
    }
}
