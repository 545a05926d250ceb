//! Remote accessibility tree access.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::node::{EventKind, NodeInfo, NodeRef, TreeEvent};
use crate::channel::{Channel, ChannelExt};
use crate::error::{CujError, Result};

/// Handle of an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    DoDefault,
    Focus,
    MakeVisible,
}

impl NodeAction {
    pub fn method(&self) -> &'static str {
        match self {
            NodeAction::DoDefault => "doDefault",
            NodeAction::Focus => "focus",
            NodeAction::MakeVisible => "makeVisible",
        }
    }
}

/// Read access to the device's accessibility tree plus the few node actions
/// the tree itself offers.
#[async_trait]
pub trait Automation: Send + Sync {
    /// Full snapshot of the desktop tree.
    async fn tree(&self) -> Result<NodeInfo>;

    /// Start buffering events of `kind` from anywhere in the tree.
    async fn watch(&self, kind: EventKind) -> Result<WatchId>;

    /// Take the events buffered since the last drain.
    async fn drain(&self, id: WatchId) -> Result<Vec<TreeEvent>>;

    async fn unwatch(&self, id: WatchId) -> Result<()>;

    /// Invoke `action` on the node at `node.path`. Fails with
    /// [`CujError::Stale`] when that node no longer has the located role and
    /// name.
    async fn perform(&self, node: &NodeRef, action: NodeAction) -> Result<()>;
}

const SERIALIZE_JS: &str = r#"const __cujAttrs = (n) => {
  const s = n.state || {};
  const attrs = {
    focused: !!s.focused,
    invisible: !!s.invisible,
    offscreen: !!s.offscreen,
    focusable: !!s.focusable,
  };
  if (n.checked !== undefined) attrs.checked = String(n.checked);
  if (n.value !== undefined) attrs.value = String(n.value);
  if (n.htmlTag !== undefined) attrs.htmlTag = n.htmlTag;
  return attrs;
};
const __cujLoc = (n) => {
  const l = n.location || {};
  return { left: l.left | 0, top: l.top | 0, width: l.width | 0, height: l.height | 0 };
};
const __cujShallow = (n) => ({
  role: n.role || "unknown",
  name: n.name || "",
  className: n.className || "",
  location: __cujLoc(n),
  attributes: __cujAttrs(n),
  children: [],
});
const __cujTree = (n) => Object.assign(__cujShallow(n), {
  children: (n.children || []).map(__cujTree),
});"#;

/// [`Automation`] over a test-extension [`Channel`] using `chrome.automation`.
pub struct ChannelAutomation {
    channel: Arc<dyn Channel>,
}

impl ChannelAutomation {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    fn desktop_script(body: &str) -> String {
        format!(
            "new Promise((resolve, reject) => chrome.automation.getDesktop((root) => {{ \
             try {{ {SERIALIZE_JS}\n{body} }} catch (e) {{ reject(e); }} }}))"
        )
    }
}

#[async_trait]
impl Automation for ChannelAutomation {
    async fn tree(&self) -> Result<NodeInfo> {
        let script = Self::desktop_script("resolve(__cujTree(root));");
        self.channel.evaluate_promise(&script).await
    }

    async fn watch(&self, kind: EventKind) -> Result<WatchId> {
        let kind_js = serde_json::to_string(kind.as_str())?;
        let script = Self::desktop_script(&format!(
            r#"const reg = globalThis.__cujWatches || (globalThis.__cujWatches = {{ next: 1, entries: {{}} }});
const id = reg.next++;
const entry = {{ kind: {kind_js}, events: [] }};
entry.listener = (ev) => entry.events.push({{ kind: {kind_js}, target: __cujShallow(ev.target) }});
root.addEventListener({kind_js}, entry.listener, true);
reg.entries[id] = entry;
resolve(id);"#
        ));
        let id: u64 = self.channel.evaluate_promise(&script).await?;
        debug!(kind = kind.as_str(), id, "watching accessibility events");
        Ok(WatchId(id))
    }

    async fn drain(&self, id: WatchId) -> Result<Vec<TreeEvent>> {
        let expression = format!(
            "(() => {{ const reg = globalThis.__cujWatches; const entry = reg && reg.entries[{id}]; \
             if (!entry) throw new Error('unknown watch {id}'); \
             return entry.events.splice(0, entry.events.length); }})()",
            id = id.0
        );
        self.channel.evaluate(&expression).await
    }

    async fn unwatch(&self, id: WatchId) -> Result<()> {
        let script = Self::desktop_script(&format!(
            "const reg = globalThis.__cujWatches; const entry = reg && reg.entries[{id}]; \
             if (entry) {{ root.removeEventListener(entry.kind, entry.listener, true); delete reg.entries[{id}]; }} \
             resolve(null);",
            id = id.0
        ));
        let _: Value = self.channel.evaluate_promise(&script).await?;
        Ok(())
    }

    async fn perform(&self, node: &NodeRef, action: NodeAction) -> Result<()> {
        let path = json!(node.path);
        let expect = json!({ "role": node.info.role.as_str(), "name": node.info.name });
        let script = Self::desktop_script(&format!(
            r#"let n = root;
for (const i of {path}) {{ n = n && n.children ? n.children[i] : undefined; }}
const expect = {expect};
if (!n || (n.role || "unknown") !== expect.role || (n.name || "") !== expect.name) {{
  throw new Error("stale node at path {path}");
}}
n.{method}();
resolve(null);"#,
            method = action.method()
        ));
        match self.channel.evaluate_promise::<Value>(&script).await {
            Ok(_) => Ok(()),
            Err(CujError::RemoteException { message }) if message.contains("stale node") => {
                Err(CujError::Stale(message))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ScriptedChannel;
    use crate::uiauto::node::{Rect, Role};

    #[tokio::test]
    async fn tree_decodes_serialized_desktop() {
        let channel = ScriptedChannel::new(|expr, await_promise| {
            assert!(await_promise);
            assert!(expr.contains("chrome.automation.getDesktop"));
            Ok(json!({
                "role": "desktop",
                "children": [{
                    "role": "button",
                    "name": "Launcher",
                    "location": {"left": 0, "top": 0, "width": 10, "height": 10},
                    "attributes": {"focused": false}
                }]
            }))
        });
        let automation = ChannelAutomation::new(Arc::new(channel));
        let tree = automation.tree().await.unwrap();
        assert_eq!(tree.role, Role::Unknown);
        assert_eq!(tree.children[0].role, Role::Button);
        assert_eq!(tree.children[0].location, Rect::new(0, 0, 10, 10));
    }

    #[tokio::test]
    async fn perform_maps_stale_exception() {
        let channel = ScriptedChannel::new(|expr, _| {
            assert!(expr.contains("n.doDefault()"));
            Err(CujError::RemoteException {
                message: "stale node at path [0,2]".into(),
            })
        });
        let automation = ChannelAutomation::new(Arc::new(channel));
        let node = NodeRef {
            path: vec![0, 2],
            info: NodeInfo::new(Role::Button, "OK"),
        };
        let err = automation.perform(&node, NodeAction::DoDefault).await.unwrap_err();
        assert!(matches!(err, CujError::Stale(_)));
    }

    #[tokio::test]
    async fn drain_decodes_events() {
        let channel = ScriptedChannel::new(|expr, await_promise| {
            assert!(!await_promise);
            assert!(expr.contains("reg.entries[7]"));
            Ok(json!([{"kind": "alert", "target": {"role": "alert", "name": "Saved"}}]))
        });
        let automation = ChannelAutomation::new(Arc::new(channel));
        let events = automation.drain(WatchId(7)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Alert);
        assert_eq!(events[0].target.name, "Saved");
    }
}
