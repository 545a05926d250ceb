use std::sync::Arc;
use std::time::Duration;

use cujkit::action::{self, Action, combine, repeat};
use cujkit::channel::{Channel, ChannelExt};
use cujkit::ctx::Ctx;
use cujkit::error::{Result, StepExt};
use cujkit::recorder::{Direction, Expectations, MetricSpec};
use url::Url;

/// Installs `globalThis.__cujHistograms` and a frame monitor in the page.
///
/// Samples land in unit-wide buckets so the library's histogram maths
/// applies unchanged. The store survives repeated installs.
pub const PAGE_RECORDER: &str = r#"(() => {
  if (globalThis.__cujHistograms) return true;
  const store = {};
  const record = (name, value) => {
    const v = Math.max(0, Math.round(value));
    const h = store[name] || (store[name] = { sum: 0, buckets: [] });
    h.sum += v;
    const bucket = h.buckets.find((b) => b.min === v);
    if (bucket) {
      bucket.count += 1;
    } else {
      h.buckets.push({ min: v, max: v + 1, count: 1 });
      h.buckets.sort((a, b) => a.min - b.min);
    }
    return true;
  };
  const frames = {
    stamps: [],
    running: false,
    start() {
      this.stamps = [];
      this.running = true;
      const tick = (t) => {
        if (!this.running) return;
        this.stamps.push(t);
        requestAnimationFrame(tick);
      };
      requestAnimationFrame(tick);
      return true;
    },
    stop(prefix) {
      this.running = false;
      const s = this.stamps;
      let smooth = 0;
      for (let i = 1; i < s.length; i++) {
        const delta = s[i] - s[i - 1];
        record(prefix + ".FrameTime", delta);
        if (delta <= 25) smooth += 1;
      }
      if (s.length > 1) record(prefix + ".Smoothness", (100 * smooth) / (s.length - 1));
      return s.length;
    },
  };
  globalThis.__cujHistograms = store;
  globalThis.__cujRecord = record;
  globalThis.__cujFrames = frames;
  if (document.body && document.body.scrollHeight < 4 * innerHeight) {
    const filler = document.createElement("div");
    filler.style.height = 8 * innerHeight + "px";
    document.body.appendChild(filler);
  }
  return true;
})()"#;

const DOM_WORKLOAD: &str = r#"(async () => {
  const host = document.createElement("div");
  document.body.appendChild(host);
  for (let i = 0; i < 10; i++) {
    const begin = performance.now();
    for (let n = 0; n < 300; n++) {
      const node = document.createElement("p");
      node.textContent = "row " + n;
      host.appendChild(node);
    }
    void host.offsetHeight;
    __cujRecord("Cuj.Dom.LayoutTime", performance.now() - begin);
    host.replaceChildren();

    const clicked = performance.now();
    await new Promise((resolve) => {
      host.addEventListener("click", resolve, { once: true });
      host.dispatchEvent(new MouseEvent("click", { bubbles: true }));
    });
    const painted = await new Promise((resolve) =>
      requestAnimationFrame(() => resolve(performance.now())),
    );
    __cujRecord("Cuj.Input.ClickToFrame", painted - clicked);
  }
  host.remove();
  return true;
})()"#;

/// A built-in journey run against one page.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub default_url: &'static str,
    pub default_runs: usize,
    metrics: fn() -> Vec<MetricSpec>,
    thresholds: &'static [(&'static str, f64)],
    steps: fn(&Arc<dyn Channel>) -> Action,
}

impl Scenario {
    pub fn metrics(&self) -> Vec<MetricSpec> {
        (self.metrics)()
    }

    pub fn expectations(&self) -> Expectations {
        self.thresholds
            .iter()
            .fold(Expectations::new(), |acc, (name, threshold)| acc.expect(*name, *threshold))
    }

    pub fn action(&self, channel: &Arc<dyn Channel>) -> Action {
        action::named(self.name, (self.steps)(channel))
    }
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "scroll",
        description: "Scroll a long page in steps while recording frame times.",
        default_url: "https://www.wikipedia.org/",
        default_runs: 3,
        metrics: || {
            vec![
                MetricSpec::smoothness("Cuj.Scroll.Smoothness").required(),
                MetricSpec::latency("Cuj.Scroll.FrameTime"),
            ]
        },
        thresholds: &[("Cuj.Scroll.Smoothness", 80.0), ("Cuj.Scroll.FrameTime", 40.0)],
        steps: scroll_steps,
    },
    Scenario {
        name: "animation",
        description: "Run a two second transform animation and measure smoothness.",
        default_url: "https://example.org/",
        default_runs: 3,
        metrics: || {
            vec![
                MetricSpec::smoothness("Cuj.Animation.Smoothness").required(),
                MetricSpec::custom("Cuj.Animation.FrameTime", "ms", Direction::SmallerIsBetter),
            ]
        },
        thresholds: &[("Cuj.Animation.Smoothness", 85.0)],
        steps: animation_steps,
    },
    Scenario {
        name: "dom-latency",
        description: "Build and lay out DOM batches, then time click-to-frame latency.",
        default_url: "https://example.org/",
        default_runs: 5,
        metrics: || {
            vec![
                MetricSpec::custom("Cuj.Dom.LayoutTime", "ms", Direction::SmallerIsBetter).required(),
                MetricSpec::latency("Cuj.Input.ClickToFrame").required(),
            ]
        },
        thresholds: &[("Cuj.Dom.LayoutTime", 50.0), ("Cuj.Input.ClickToFrame", 100.0)],
        steps: dom_steps,
    },
];

pub fn scenarios() -> &'static [Scenario] {
    SCENARIOS
}

pub fn default_scenario() -> &'static Scenario {
    &SCENARIOS[0]
}

pub fn find_scenario(name: &str) -> Option<&'static Scenario> {
    let needle = name.trim();
    if needle.is_empty() {
        return None;
    }
    SCENARIOS
        .iter()
        .find(|scenario| scenario.name.eq_ignore_ascii_case(needle))
}

/// Load `url` and install the page recorder before any run starts.
pub async fn prepare(ctx: &Ctx, channel: &dyn Channel, url: &Url) -> Result<()> {
    channel.navigate(ctx, url).await.step("load scenario page")?;
    channel
        .evaluate_value(PAGE_RECORDER, false)
        .await
        .step("install page recorder")?;
    Ok(())
}

fn evaluate(channel: &Arc<dyn Channel>, name: &str, expression: &'static str) -> Action {
    let channel = channel.clone();
    action::named(
        name,
        Action::new(move |_ctx: Ctx| {
            let channel = channel.clone();
            async move {
                channel.evaluate_value(expression, true).await?;
                Ok(())
            }
        }),
    )
}

fn scroll_steps(channel: &Arc<dyn Channel>) -> Action {
    combine(
        "scroll page",
        [
            evaluate(channel, "reset scroll", "window.scrollTo(0, 0)"),
            evaluate(channel, "start frame monitor", "__cujFrames.start()"),
            repeat(
                20,
                combine(
                    "scroll step",
                    [
                        evaluate(channel, "scroll by", "window.scrollBy(0, 240)"),
                        action::sleep(Duration::from_millis(50)),
                    ],
                ),
            ),
            evaluate(channel, "stop frame monitor", "__cujFrames.stop('Cuj.Scroll')"),
        ],
    )
}

fn animation_steps(channel: &Arc<dyn Channel>) -> Action {
    combine(
        "animate box",
        [
            evaluate(channel, "start frame monitor", "__cujFrames.start()"),
            evaluate(
                channel,
                "start animation",
                r#"(() => {
  const box = document.createElement("div");
  box.id = "cuj-box";
  box.style.cssText = "position:fixed;top:0;left:0;width:120px;height:120px;background:#36c";
  document.body.appendChild(box);
  box.animate(
    [{ transform: "translateX(0)" }, { transform: "translateX(60vw) rotate(180deg)" }],
    { duration: 2000, iterations: 1 },
  ).finished.then(() => box.remove());
  return true;
})()"#,
            ),
            action::sleep(Duration::from_secs(2)),
            evaluate(channel, "stop frame monitor", "__cujFrames.stop('Cuj.Animation')"),
        ],
    )
}

fn dom_steps(channel: &Arc<dyn Channel>) -> Action {
    evaluate(channel, "dom workload", DOM_WORKLOAD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cujkit::fake::ScriptedChannel;
    use std::sync::Mutex;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(find_scenario(" Scroll ").map(|s| s.name), Some("scroll"));
        assert!(find_scenario("").is_none());
        assert!(find_scenario("missing").is_none());
        assert_eq!(default_scenario().name, "scroll");
    }

    #[test]
    fn every_metric_validates_and_has_an_expectation_target() {
        for scenario in scenarios() {
            let metrics = scenario.metrics();
            for metric in &metrics {
                metric.validate().expect("valid metric");
            }
            for (name, _) in scenario.expectations().iter() {
                assert!(
                    metrics.iter().any(|metric| metric.name == name),
                    "{} expects unknown metric {name}",
                    scenario.name
                );
            }
        }
    }

    #[tokio::test]
    async fn scroll_action_drives_the_page_in_order() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = seen.clone();
        let channel: Arc<dyn Channel> = Arc::new(ScriptedChannel::new(move |expression, _| {
            log.lock().unwrap().push(expression.to_string());
            Ok(serde_json::Value::Bool(true))
        }));

        let scenario = find_scenario("scroll").unwrap();
        scenario.action(&channel).run(&Ctx::new()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("window.scrollTo(0, 0)"));
        assert_eq!(seen.iter().filter(|e| e.contains("scrollBy")).count(), 20);
        assert_eq!(seen.last().map(String::as_str), Some("__cujFrames.stop('Cuj.Scroll')"));
    }
}
