//! Content-expansion behaviors run against a live page before capture.
//!
//! Behaviors execute in a fixed order, each bounded by a per-behavior
//! deadline and all of them by an overall deadline. They never fail the
//! capture: any per-action error is swallowed and the runner reports
//! whatever effect counts it managed to collect.

use std::time::{Duration, Instant};

use crate::browser::PageDriver;
use crate::models::BehaviorStats;

/// Caps and toggles for one behavior pass.
#[derive(Debug, Clone)]
pub struct BehaviorOptions {
    /// Budget for the whole pass.
    pub max_total_ms: u64,
    /// Budget per behavior.
    pub max_behavior_ms: u64,
    /// Pause between page-mutating steps.
    pub action_delay_ms: u64,
    pub scroll_step_px: u32,
    pub max_scroll_passes: u32,
    /// Passes with an unchanged scroll height before scrolling stops.
    pub scroll_stable_passes: u32,
    pub max_infinite_scroll_pages: u32,
    pub infinite_scroll_wait_ms: u64,
    pub max_carousel_clicks: u32,

    pub dismiss_overlays: bool,
    pub scroll_to_load: bool,
    pub expand_content: bool,
    pub click_tabs: bool,
    pub navigate_carousels: bool,
    pub expand_comments: bool,
    pub infinite_scroll: bool,
}

impl Default for BehaviorOptions {
    fn default() -> Self {
        BehaviorOptions {
            max_total_ms: 120_000,
            max_behavior_ms: 30_000,
            action_delay_ms: 300,
            scroll_step_px: 500,
            max_scroll_passes: 50,
            scroll_stable_passes: 3,
            max_infinite_scroll_pages: 10,
            infinite_scroll_wait_ms: 1_000,
            max_carousel_clicks: 5,
            dismiss_overlays: true,
            scroll_to_load: true,
            expand_content: true,
            click_tabs: true,
            navigate_carousels: true,
            expand_comments: true,
            infinite_scroll: true,
        }
    }
}

const DISMISS_OVERLAYS_JS: &str = r##"
(() => {
    const selectors = [
        "[class*='cookie'] button[class*='accept']",
        "[class*='cookie'] button[class*='agree']",
        "[class*='consent'] button[class*='accept']",
        "[id*='cookie'] button",
        ".cc-dismiss",
        "#onetrust-accept-btn-handler",
        ".cookie-banner button",
        "[class*='modal'] [class*='close']",
        "[class*='modal'] button[aria-label*='close' i]",
        "[class*='popup'] [class*='close']",
        ".modal-close",
        "button[class*='dismiss']",
        "[aria-label='Close']",
        "[aria-label='Dismiss']",
        "button.close",
    ];
    let clicked = 0;
    for (const sel of selectors) {
        let els;
        try { els = document.querySelectorAll(sel); } catch (e) { continue; }
        for (const el of els) {
            if (el.offsetParent !== null) {
                try { el.click(); clicked++; } catch (e) {}
            }
        }
    }
    // Remove viewport-covering fixed/sticky layers left behind.
    for (const el of document.querySelectorAll(
        '[style*="position: fixed"], [style*="position: sticky"]')) {
        if (el.offsetHeight > window.innerHeight * 0.5) {
            try { el.remove(); } catch (e) {}
        }
    }
    return clicked;
})()
"##;

const EXPAND_CONTENT_JS: &str = r#"
(() => {
    let expanded = 0;
    for (const detail of document.querySelectorAll('details:not([open])')) {
        try { detail.open = true; expanded++; } catch (e) {}
    }
    const phrases = ['read more', 'show more', 'see more', 'view more', 'expand'];
    for (const el of document.querySelectorAll('a, button, [role="button"], [aria-expanded="false"]')) {
        if (el.offsetParent === null) continue;
        const text = (el.textContent || '').trim().toLowerCase();
        if (text.length > 0 && text.length < 40 && phrases.some(p => text.includes(p))) {
            try { el.click(); expanded++; } catch (e) {}
        }
    }
    return expanded;
})()
"#;

const CLICK_TABS_JS: &str = r#"
(() => {
    let clicked = 0;
    const containers = document.querySelectorAll(
        "[role='tablist'], .tabs, [class*='tab-list'], [data-toggle='tab']");
    const seen = new Set();
    for (const container of containers) {
        const tabs = container.querySelectorAll(
            "[role='tab']:not([aria-selected='true']), .tab:not(.active), .nav-link:not(.active)");
        for (const tab of tabs) {
            if (seen.has(tab) || tab.offsetParent === null) continue;
            seen.add(tab);
            try { tab.click(); clicked++; } catch (e) {}
        }
    }
    return clicked;
})()
"#;

fn carousel_js(max_clicks: u32) -> String {
    format!(
        r#"
(() => {{
    const selectors = [
        "[class*='carousel'] [class*='next']",
        "[class*='slider'] [class*='next']",
        "[class*='swiper'] [class*='next']",
        ".slick-next",
        "[aria-label*='next' i]",
    ];
    let slides = 0;
    const seen = new Set();
    for (const sel of selectors) {{
        let controls;
        try {{ controls = document.querySelectorAll(sel); }} catch (e) {{ continue; }}
        for (const control of controls) {{
            if (seen.has(control)) continue;
            seen.add(control);
            for (let i = 0; i < {max_clicks}; i++) {{
                if (control.offsetParent === null) break;
                try {{ control.click(); slides++; }} catch (e) {{ break; }}
            }}
        }}
    }}
    return slides;
}})()
"#
    )
}

const EXPAND_COMMENTS_JS: &str = r#"
(() => {
    const selectors = [
        "[class*='comment'] [class*='load-more']",
        "[class*='comment'] [class*='show-more']",
        ".load-comments",
        "[class*='comments'] button",
    ];
    let loaded = 0;
    for (const sel of selectors) {
        let els;
        try { els = document.querySelectorAll(sel); } catch (e) { continue; }
        for (const el of els) {
            if (el.offsetParent !== null) {
                try { el.click(); loaded++; } catch (e) {}
            }
        }
    }
    return loaded;
})()
"#;

/// Runs the behavior set against one page.
pub struct BehaviorRunner {
    options: BehaviorOptions,
}

impl BehaviorRunner {
    pub fn new(options: BehaviorOptions) -> Self {
        BehaviorRunner { options }
    }

    /// Executes every enabled behavior in order. Never fails: errors and
    /// per-behavior timeouts are logged and the pass moves on.
    pub async fn run_all(&self, page: &dyn PageDriver) -> BehaviorStats {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.options.max_total_ms);
        let mut stats = BehaviorStats::default();

        type Step<'a> = (
            &'a str,
            bool,
            std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<u64>> + Send + 'a>>,
        );

        let opts = &self.options;
        let steps: Vec<Step> = vec![
            ("overlays", opts.dismiss_overlays, Box::pin(self.dismiss_overlays(page))),
            ("scroll", opts.scroll_to_load, Box::pin(self.scroll_to_load(page))),
            ("expand", opts.expand_content, Box::pin(self.expand_content(page))),
            ("tabs", opts.click_tabs, Box::pin(self.click_tabs(page))),
            ("carousels", opts.navigate_carousels, Box::pin(self.navigate_carousels(page))),
            ("comments", opts.expand_comments, Box::pin(self.expand_comments(page))),
            ("infinite", opts.infinite_scroll, Box::pin(self.infinite_scroll(page))),
        ];

        for (name, enabled, step) in steps {
            if !enabled {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("Behavior budget exhausted before {name}");
                break;
            }
            let budget = Duration::from_millis(self.options.max_behavior_ms)
                .min(deadline.duration_since(now));

            let count = match tokio::time::timeout(budget, step).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    log::debug!("Behavior {name} failed: {e}");
                    0
                }
                Err(_) => {
                    log::debug!("Behavior {name} cut short at {} ms", budget.as_millis());
                    0
                }
            };

            match name {
                "overlays" => stats.overlays_dismissed = count,
                "scroll" => stats.scroll_passes = count,
                "expand" => stats.elements_expanded = count,
                "tabs" => stats.tabs_clicked = count,
                "carousels" => stats.carousel_slides = count,
                "comments" => stats.comments_loaded = count,
                "infinite" => stats.infinite_scroll_pages = count,
                _ => {}
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    async fn dismiss_overlays(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let clicked = eval_count(page, DISMISS_OVERLAYS_JS).await?;
        // Whatever is left gets an Escape.
        if let Err(e) = page.press_escape().await {
            log::debug!("Escape dispatch failed: {e}");
        }
        self.pause().await;
        Ok(clicked)
    }

    /// Scrolls by viewport increments until the document height is stable
    /// for `scroll_stable_passes` consecutive passes, then restores the
    /// scroll position.
    async fn scroll_to_load(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let step = self.options.scroll_step_px;
        let mut passes = 0u64;
        let mut stable = 0u32;
        let mut last_height = -1i64;

        for _ in 0..self.options.max_scroll_passes {
            let snapshot = page
                .eval(&format!(
                    "(() => {{ window.scrollBy(0, {step}); \
                     return [document.body.scrollHeight, window.scrollY + window.innerHeight]; }})()"
                ))
                .await?;
            passes += 1;
            self.pause().await;

            let (height, bottom) = match snapshot.as_array() {
                Some(pair) if pair.len() == 2 => (
                    pair[0].as_i64().unwrap_or(0),
                    pair[1].as_i64().unwrap_or(0),
                ),
                _ => break,
            };

            if height == last_height {
                stable += 1;
            } else {
                stable = 0;
                last_height = height;
            }
            if stable >= self.options.scroll_stable_passes && bottom >= height {
                break;
            }
        }

        let _ = page.eval("window.scrollTo(0, 0)").await;
        Ok(passes)
    }

    async fn expand_content(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let n = eval_count(page, EXPAND_CONTENT_JS).await?;
        self.pause().await;
        Ok(n)
    }

    async fn click_tabs(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let n = eval_count(page, CLICK_TABS_JS).await?;
        self.pause().await;
        Ok(n)
    }

    async fn navigate_carousels(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let n = eval_count(page, &carousel_js(self.options.max_carousel_clicks)).await?;
        self.pause().await;
        Ok(n)
    }

    async fn expand_comments(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let n = eval_count(page, EXPAND_COMMENTS_JS).await?;
        self.pause().await;
        Ok(n)
    }

    /// Scroll-and-wait cycles for feeds that append pages on demand.
    async fn infinite_scroll(&self, page: &dyn PageDriver) -> anyhow::Result<u64> {
        let mut pages = 0u64;
        for _ in 0..self.options.max_infinite_scroll_pages {
            let before = eval_count(page, "document.body.querySelectorAll('*').length").await?;
            page.eval("window.scrollTo(0, document.body.scrollHeight)")
                .await?;
            tokio::time::sleep(Duration::from_millis(self.options.infinite_scroll_wait_ms)).await;
            let after = eval_count(page, "document.body.querySelectorAll('*').length").await?;
            if after > before {
                pages += 1;
            } else {
                break;
            }
        }
        Ok(pages)
    }

    async fn pause(&self) {
        tokio::time::sleep(Duration::from_millis(self.options.action_delay_ms)).await;
    }
}

async fn eval_count(page: &dyn PageDriver, script: &str) -> anyhow::Result<u64> {
    let value = page.eval(script).await?;
    Ok(value.as_u64().or_else(|| value.as_i64().map(|n| n.max(0) as u64)).unwrap_or(0))
}
