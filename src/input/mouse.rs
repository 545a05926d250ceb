use std::sync::Arc;

use serde_json::{Value, json};

use super::MouseButton;
use crate::channel::{Channel, ChannelExt, promisify};
use crate::error::Result;
use crate::uiauto::Point;

/// Mouse driven through the test extension's `chrome.autotestPrivate` API.
pub struct ChannelMouse {
    channel: Arc<dyn Channel>,
}

impl ChannelMouse {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Instant move; interpolation is done by the pointer layer.
    pub async fn move_to(&self, to: Point) -> Result<()> {
        let expression = promisify(
            "chrome.autotestPrivate.mouseMove",
            &[json!({ "x": to.x, "y": to.y }), json!(0)],
        )?;
        let _: Value = self.channel.evaluate_promise(&expression).await?;
        Ok(())
    }

    pub async fn button(&self, button: MouseButton, pressed: bool) -> Result<()> {
        let api = if pressed {
            "chrome.autotestPrivate.mousePress"
        } else {
            "chrome.autotestPrivate.mouseRelease"
        };
        let expression = promisify(api, &[json!(button.as_str())])?;
        let _: Value = self.channel.evaluate_promise(&expression).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ScriptedChannel;
    use std::sync::Mutex;

    #[tokio::test]
    async fn issues_autotest_private_calls() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let channel = ScriptedChannel::new(move |expr, await_promise| {
            assert!(await_promise);
            log.lock().unwrap().push(expr.to_string());
            Ok(Value::Null)
        });
        let mouse = ChannelMouse::new(Arc::new(channel));
        mouse.move_to(Point::new(3, 4)).await.unwrap();
        mouse.button(MouseButton::Right, true).await.unwrap();
        mouse.button(MouseButton::Right, false).await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen[0].contains(r#"mouseMove({"x":3,"y":4}, 0, (result)"#));
        assert!(seen[1].contains(r#"mousePress("Right", (result)"#));
        assert!(seen[2].contains(r#"mouseRelease("Right", (result)"#));
    }
}
