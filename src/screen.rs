//! Screen recording of the device display.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::info;

use crate::channel::{Channel, ChannelExt};
use crate::error::{CujError, Result};

pub const RECORDING_FILE: &str = "recording.webm";

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Stop recording and return the encoded video.
    async fn stop(&self) -> Result<Vec<u8>>;
}

const START_JS: &str = r#"(async () => {
  if (globalThis.__cujRecording) throw new Error("recording already in progress");
  const stream = await navigator.mediaDevices.getDisplayMedia({ audio: false, video: { frameRate: 30 } });
  const recorder = new MediaRecorder(stream, { mimeType: "video/webm;codecs=vp9" });
  const state = { recorder, stream, chunks: [] };
  recorder.ondataavailable = (e) => { if (e.data && e.data.size > 0) state.chunks.push(e.data); };
  recorder.start(1000);
  globalThis.__cujRecording = state;
  return true;
})()"#;

const STOP_JS: &str = r#"new Promise((resolve, reject) => {
  const state = globalThis.__cujRecording;
  if (!state) { reject(new Error("no recording in progress")); return; }
  state.recorder.onstop = async () => {
    try {
      state.stream.getTracks().forEach((t) => t.stop());
      const bytes = new Uint8Array(await new Blob(state.chunks, { type: "video/webm" }).arrayBuffer());
      let binary = "";
      for (let i = 0; i < bytes.length; i += 0x8000) {
        binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
      }
      delete globalThis.__cujRecording;
      resolve(btoa(binary));
    } catch (e) { reject(e); }
  };
  state.recorder.stop();
})"#;

/// `MediaRecorder`-based capture evaluated on a test-extension connection;
/// the video comes back base64-encoded.
pub struct ChannelScreenRecorder {
    channel: Arc<dyn Channel>,
}

impl ChannelScreenRecorder {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ScreenCapture for ChannelScreenRecorder {
    async fn start(&self) -> Result<()> {
        let _: Value = self.channel.evaluate_promise(START_JS).await?;
        info!("screen recording started");
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<u8>> {
        let encoded: String = self.channel.evaluate_promise(STOP_JS).await?;
        let video = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| CujError::Transport(format!("screen recording is not base64: {err}")))?;
        info!(bytes = video.len(), "screen recording stopped");
        Ok(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ScriptedChannel;
    use serde_json::json;

    #[tokio::test]
    async fn stop_decodes_base64_video() {
        let channel = ScriptedChannel::new(|expr, _| {
            if expr.contains("getDisplayMedia") {
                Ok(json!(true))
            } else {
                Ok(json!(STANDARD.encode(b"\x1aE\xdf\xa3webm")))
            }
        });
        let recorder = ChannelScreenRecorder::new(Arc::new(channel));
        recorder.start().await.unwrap();
        assert_eq!(recorder.stop().await.unwrap(), b"\x1aE\xdf\xa3webm".to_vec());
    }

    #[tokio::test]
    async fn garbage_payload_is_a_transport_failure() {
        let channel = ScriptedChannel::new(|_, _| Ok(json!("***")));
        let recorder = ChannelScreenRecorder::new(Arc::new(channel));
        assert!(matches!(recorder.stop().await, Err(CujError::Transport(_))));
    }
}
