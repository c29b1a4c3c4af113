//! Browser automation: `browse(url)` returns the rendered HTML,
//! `screenshot(url)` returns a full-page PNG asset.
//!
//! A cancelled run drops the in-flight session, which closes the browser.
//!
//! Needs the `browser` cargo feature and `[browser] enabled = true`.
//! Otherwise both names are still registered but fail when called, so
//! scripts get a clear message instead of an undefined name.

use bustrack_core::config::BrowserConfig;
use tokio::runtime::Handle;

use crate::capability::CapabilityTable;
use crate::error::ScriptError;

pub fn register(table: &mut CapabilityTable, config: &BrowserConfig, handle: Handle) {
    #[cfg(feature = "browser")]
    if config.enabled {
        headless::register(table, config.executable.clone(), handle);
        return;
    }
    #[cfg(not(feature = "browser"))]
    let _ = handle;
    let reason = if config.enabled {
        "browser support was not compiled in (build with --features browser)"
    } else {
        "browser automation is disabled ([browser] enabled = false)"
    };
    for name in ["browse", "screenshot"] {
        table.register_fn(name, Some(1), move |_, _| Err(ScriptError::capability(name, reason)));
    }
}

#[cfg(feature = "browser")]
mod headless {
    use bustrack_core::{Asset, Value};
    use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
    use chromiumoxide::page::{Page, ScreenshotParams};
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tokio::task::JoinHandle;

    use crate::cancel::block_on_cancellable;
    use crate::capability::{CapabilityTable, string_arg};
    use crate::error::ScriptError;

    struct Session {
        browser: Browser,
        events: JoinHandle<()>,
        page: Page,
    }

    impl Session {
        async fn open(executable: Option<&str>, url: &str) -> Result<Self, String> {
            let mut builder = ChromeConfig::builder()
                .arg("--headless")
                .arg("--disable-gpu")
                .arg("--no-sandbox");
            if let Some(path) = executable {
                builder = builder.chrome_executable(path);
            }
            let config = builder.build()?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| format!("could not launch browser: {e}"))?;
            let events = tokio::spawn(async move { while handler.next().await.is_some() {} });
            let page = browser
                .new_page(url)
                .await
                .map_err(|e| format!("could not open {url}: {e}"))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| format!("could not wait for load: {e}"))?;
            Ok(Self {
                browser,
                events,
                page,
            })
        }

        async fn close(mut self) {
            let _ = self.browser.close().await;
            let _ = self.browser.wait().await;
            self.events.abort();
        }
    }

    async fn browse(executable: Option<&str>, url: &str) -> Result<Value, String> {
        let session = Session::open(executable, url).await?;
        let html = session
            .page
            .content()
            .await
            .map_err(|e| format!("could not read page: {e}"));
        session.close().await;
        html.map(Value::String)
    }

    async fn screenshot(executable: Option<&str>, url: &str) -> Result<Value, String> {
        let session = Session::open(executable, url).await?;
        let png = session
            .page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| format!("could not take screenshot: {e}"));
        session.close().await;
        Ok(Value::Asset(
            Asset::new(png?, "image/png", "screenshot.png").with_origin(url),
        ))
    }

    pub(super) fn register(table: &mut CapabilityTable, executable: Option<String>, handle: Handle) {
        let executable = Arc::new(executable);
        {
            let (executable, handle) = (executable.clone(), handle.clone());
            table.register_fn("browse", Some(1), move |args, cancel| {
                let url = string_arg("browse", &args, 0)?;
                tracing::info!(url = %url, "🌐 browse");
                block_on_cancellable(&handle, cancel, async {
                    browse(executable.as_deref(), &url)
                        .await
                        .map_err(|e| ScriptError::capability("browse", e))
                })
            });
        }
        table.register_fn("screenshot", Some(1), move |args, cancel| {
            let url = string_arg("screenshot", &args, 0)?;
            tracing::info!(url = %url, "📸 screenshot");
            block_on_cancellable(&handle, cancel, async {
                screenshot(executable.as_deref(), &url)
                    .await
                    .map_err(|e| ScriptError::capability("screenshot", e))
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use bustrack_core::Value;

    #[tokio::test]
    async fn test_disabled_browser_fails_cleanly() {
        let mut table = CapabilityTable::new();
        register(&mut table, &BrowserConfig::default(), Handle::current());
        assert!(table.contains("browse"));
        assert!(table.contains("screenshot"));

        let err = table
            .call("screenshot", vec![Value::from("https://example.com")], &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("disabled"), "{err}");
    }
}
