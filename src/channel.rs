//! Untyped expression channel to a remote browser process.
//!
//! Transports implement [`Channel::exec`], which runs a script resolving to a
//! JSON string. The default [`Channel::evaluate_value`] wraps the caller's
//! expression in an envelope that reports success, runtime exceptions and
//! syntax errors distinctly, so every transport classifies failures the same
//! way. Typed helpers live on [`ChannelExt`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::ctx::{Ctx, PollError, PollOptions, poll};
use crate::error::{CujError, Result};

#[async_trait]
pub trait Channel: Send + Sync {
    /// Short label used in logs, e.g. `primary` or `secondary`.
    fn label(&self) -> &str {
        "primary"
    }

    /// Run `script` and return the string it resolves to.
    async fn exec(&self, script: &str) -> Result<String>;

    /// Evaluate `expression` and decode the enveloped result.
    ///
    /// With `await_promise` the resolved value of a returned promise is
    /// produced; without it a promise result is reported as a remote
    /// exception.
    async fn evaluate_value(&self, expression: &str, await_promise: bool) -> Result<Value> {
        let script = envelope(expression, await_promise)?;
        let raw = self.exec(&script).await?;
        decode_envelope(&raw)
    }
}

/// Opens additional connections on the device-under-test.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_conn(&self, url: &Url, new_window: bool) -> Result<Arc<dyn Channel>>;
}

/// Build the script that evaluates `expression` and reports its outcome as
/// JSON.
pub fn envelope(expression: &str, await_promise: bool) -> Result<String> {
    let source = serde_json::to_string(expression)?;
    Ok(format!(
        r#"(async () => {{
  const describe = (e) => {{
    if (typeof e === "string") return e;
    if (e && typeof e.message === "string") return e.message;
    try {{ return JSON.stringify(e); }} catch (_) {{ return String(e); }}
  }};
  let value;
  try {{
    value = (0, eval)({source});
    if (value && typeof value.then === "function") {{
      if (!{await_promise}) {{
        return JSON.stringify({{ err: {{ kind: "exception", message: "expression produced a promise; evaluate it as a promise" }} }});
      }}
      value = await value;
    }}
  }} catch (e) {{
    const kind = e instanceof SyntaxError ? "syntax" : "exception";
    return JSON.stringify({{ err: {{ kind, message: describe(e) }} }});
  }}
  return JSON.stringify({{ ok: value === undefined ? null : value }});
}})()"#
    ))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    err: Option<RemoteFailure>,
}

#[derive(Debug, Deserialize)]
struct RemoteFailure {
    kind: String,
    #[serde(default)]
    message: String,
}

/// Decode the JSON string produced by [`envelope`].
pub fn decode_envelope(raw: &str) -> Result<Value> {
    let parsed: Envelope = serde_json::from_str(raw)
        .map_err(|err| CujError::Transport(format!("malformed evaluation envelope: {err}")))?;
    if let Some(failure) = parsed.err {
        return Err(match failure.kind.as_str() {
            "syntax" => CujError::RemoteSyntax(failure.message),
            _ => CujError::RemoteException {
                message: failure.message,
            },
        });
    }
    Ok(parsed.ok.unwrap_or(Value::Null))
}

/// Typed helpers available on every channel.
#[async_trait]
pub trait ChannelExt: Channel {
    async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let value = self.evaluate_value(expression, false).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn evaluate_promise<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let value = self.evaluate_value(expression, true).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Apply the remote function expression `function` to `args`.
    async fn call<T: DeserializeOwned>(&self, function: &str, args: &[Value]) -> Result<T> {
        let expression = call_expression(function, args)?;
        self.evaluate_promise(&expression).await
    }

    /// Evaluate `expression` until it is truthy or `timeout` elapses.
    ///
    /// Runtime exceptions are retried; syntax and transport failures stop the
    /// wait immediately.
    async fn wait_for_expression(&self, ctx: &Ctx, expression: &str, timeout: Duration) -> Result<()> {
        let probe = format!("!!({expression})");
        let opts = ctx.poll().with_timeout(timeout);
        wait_truthy(self, ctx, &probe, opts).await
    }

    /// Load `url` and wait until the document finishes loading.
    async fn navigate(&self, ctx: &Ctx, url: &Url) -> Result<()> {
        let target = serde_json::to_string(url.as_str())?;
        debug!(channel = self.label(), url = %url, "navigating");
        self.evaluate_value(&format!("window.location.href = {target}"), false)
            .await?;
        let opts = ctx.poll();
        wait_truthy(
            self,
            ctx,
            &format!("document.readyState === 'complete' && window.location.href === {target}"),
            opts,
        )
        .await
    }
}

impl<C: Channel + ?Sized> ChannelExt for C {}

async fn wait_truthy<C: Channel + ?Sized>(
    channel: &C,
    ctx: &Ctx,
    probe: &str,
    opts: PollOptions,
) -> Result<()> {
    poll(ctx, opts, move || async move {
        match channel.evaluate_value(probe, false).await {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(other) => Err(PollError::Retry(CujError::failed(format!(
                "expression not yet truthy (got {other})"
            )))),
            Err(err @ CujError::RemoteSyntax(_)) | Err(err @ CujError::Transport(_)) => {
                Err(PollError::Break(err))
            }
            Err(err) => Err(PollError::Retry(err)),
        }
    })
    .await
}

pub fn call_expression(function: &str, args: &[Value]) -> Result<String> {
    let rendered = args
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(format!("({function})({})", rendered.join(", ")))
}

/// Render a callback-style extension API call as a promise expression.
///
/// `api` is a dotted function path such as `chrome.metricsPrivate.getHistogram`;
/// `chrome.runtime.lastError` rejects the promise with its message.
pub fn promisify(api: &str, args: &[Value]) -> Result<String> {
    let rendered = args
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut call_args = rendered.join(", ");
    if !call_args.is_empty() {
        call_args.push_str(", ");
    }
    Ok(format!(
        "new Promise((resolve, reject) => {api}({call_args}(result) => {{ \
         const err = chrome.runtime && chrome.runtime.lastError; \
         if (err) {{ reject(new Error(err.message)); }} else {{ resolve(result); }} }}))"
    ))
}
